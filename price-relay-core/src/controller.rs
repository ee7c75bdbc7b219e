use crate::{
    cache::ObservationCache,
    config::validate_thresholds,
    decision::evaluate,
    error::ConfigError,
    gateway::{LedgerGateway, PriceSource},
    registry::PriceCallback,
    scheduler::{BatchEntry, PushScheduler, PushState, SchedulerConfig},
    stream::PriceStreamClient,
    types::{DurationInSeconds, FeedId, Observation, PctNumber, PriceConfig, UpdateCondition, UpdateThresholds},
};
use anyhow::{anyhow, bail, Result};
use parking_lot::{Mutex, RwLock};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interval between update checks.
    pub pushing_frequency: Duration,
    /// Interval between one-shot source polls backing up the stream.
    pub polling_frequency: Duration,
    pub scheduler: SchedulerConfig,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pushing_frequency.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "pushing_frequency",
            });
        }
        if self.polling_frequency.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "polling_frequency",
            });
        }
        self.scheduler.validate()
    }
}

/// The main relayer: compares source and on-chain prices and hands stale
/// feeds to the push scheduler.
pub struct Controller<L: LedgerGateway> {
    price_configs: RwLock<Vec<PriceConfig>>,
    stream: Arc<PriceStreamClient>,
    source: Arc<dyn PriceSource>,
    ledger: Arc<L>,
    target_prices: Arc<ObservationCache>,
    /// Replaced on every `start`, so a stopped controller can run again.
    scheduler: RwLock<Arc<PushScheduler>>,
    config: ControllerConfig,
    shutdown: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl<L: LedgerGateway + 'static> Controller<L> {
    pub fn new(
        price_configs: Vec<PriceConfig>,
        stream: Arc<PriceStreamClient>,
        source: Arc<dyn PriceSource>,
        ledger: Arc<L>,
        config: ControllerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        for price_config in &price_configs {
            validate_thresholds(&price_config.alias, &price_config.thresholds())?;
        }

        let scheduler = PushScheduler::new(
            Arc::clone(&source),
            ledger.clone(),
            config.scheduler.clone(),
        );

        Ok(Self {
            price_configs: RwLock::new(price_configs),
            stream,
            source,
            ledger,
            target_prices: Arc::new(ObservationCache::new()),
            scheduler: RwLock::new(scheduler),
            config,
            shutdown: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Scheduler of the current (or last) run.
    pub fn scheduler(&self) -> Arc<PushScheduler> {
        Arc::clone(&self.scheduler.read())
    }

    /// Last on-chain observation seen for each feed.
    pub fn target_prices(&self) -> &Arc<ObservationCache> {
        &self.target_prices
    }

    fn feed_ids(&self) -> Vec<FeedId> {
        self.price_configs.read().iter().map(|c| c.id).collect()
    }

    /// Replaces the main thresholds of a configured feed.
    pub fn configure_thresholds(
        &self,
        feed_id: FeedId,
        time_difference: DurationInSeconds,
        price_deviation_pct: PctNumber,
        confidence_ratio_pct: PctNumber,
    ) -> Result<(), ConfigError> {
        let mut configs = self.price_configs.write();
        let price_config = configs
            .iter_mut()
            .find(|c| c.id == feed_id)
            .ok_or_else(|| ConfigError::UnknownFeed(feed_id.to_hex()))?;

        let thresholds = UpdateThresholds {
            time_difference,
            price_deviation_pct,
            confidence_ratio_pct,
        };
        validate_thresholds(&price_config.alias, &thresholds)?;
        price_config.set_thresholds(thresholds);
        info!(%feed_id, alias = %price_config.alias, ?thresholds, "Updated thresholds");
        Ok(())
    }

    /// Runs until [`stop`](Self::stop) is called or the scheduler reports a
    /// fatal submission failure, which is returned as the error. Each run
    /// starts with a fresh scheduler; a controller that is already running
    /// rejects a second `start`.
    #[instrument(skip_all, name = "controller_loop")]
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("Controller is already running");
        }
        let _running = RunningGuard(&self.running);

        let shutdown = CancellationToken::new();
        *self.shutdown.lock() = shutdown.clone();
        let scheduler = PushScheduler::new(
            Arc::clone(&self.source),
            self.ledger.clone(),
            self.config.scheduler.clone(),
        );
        *self.scheduler.write() = Arc::clone(&scheduler);

        self.run(&shutdown, &scheduler).await
    }

    async fn run(&self, shutdown: &CancellationToken, scheduler: &Arc<PushScheduler>) -> Result<()> {
        let feed_ids = self.feed_ids();
        info!(count = feed_ids.len(), "Starting controller loop...");

        if let Err(e) = self.stream.refresh(self.source.as_ref(), &feed_ids).await {
            warn!(error = %e, "Initial source price poll failed. Relying on the stream.");
        }

        let callback: PriceCallback = Arc::new(|feed_id: &FeedId, observation: &Observation| {
            trace!(%feed_id, price = observation.price, publish_time = observation.publish_time, "Source price update");
        });
        let handle = self.stream.subscribe(&feed_ids, callback).await;

        let poller = tokio::spawn(run_source_poller(
            Arc::clone(&self.stream),
            Arc::clone(&self.source),
            feed_ids.clone(),
            self.config.polling_frequency,
            shutdown.child_token(),
        ));

        let result = loop {
            debug!("Starting new check cycle.");
            self.run_cycle().await;

            tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                failure = scheduler.wait_fatal() => {
                    let err = match failure {
                        Some(failure) => anyhow::Error::new(failure),
                        None => anyhow!("push scheduler stopped"),
                    };
                    error!(error = %err, "Fatal submission failure. Stopping controller.");
                    break Err(err.context("Relayer stopped on a fatal submission failure"));
                }
                () = tokio::time::sleep(self.config.pushing_frequency) => {}
            }
        };

        shutdown.cancel();
        scheduler.shutdown();
        if let Err(e) = poller.await {
            error!(error = %e, "Source poller task ended abnormally");
        }
        self.stream.unsubscribe(handle.feed_ids(), Some(&handle)).await;
        info!("Controller loop stopped");
        result
    }

    /// Ends the current run. Has no effect on a later `start`.
    pub fn stop(&self) {
        self.shutdown.lock().cancel();
    }

    /// One check over every configured feed. Returns how many feeds were
    /// handed to the scheduler.
    pub async fn run_cycle(&self) -> usize {
        let configs = self.price_configs.read().clone();
        let feed_ids: Vec<FeedId> = configs.iter().map(|c| c.id).collect();

        let on_chain = self.ledger.query_on_chain_many(&feed_ids).await;
        debug!(count = on_chain.len(), "Fetched latest target chain prices.");
        for (feed_id, observation) in on_chain {
            self.target_prices.record(feed_id, observation);
        }

        let scheduler = self.scheduler();
        let mut must_push = Vec::new();
        let mut may_push = Vec::new();
        for price_config in &configs {
            if scheduler.state(&price_config.id) != PushState::Idle {
                continue;
            }

            let source = self.stream.get_latest(&price_config.id);
            let target = self.target_prices.latest(&price_config.id);
            let entry = BatchEntry {
                feed_id: price_config.id,
                target_publish_time: target.map(|t| t.publish_time),
            };
            match evaluate(price_config, source.as_ref(), target.as_ref()) {
                UpdateCondition::Yes => must_push.push(entry),
                UpdateCondition::Early => may_push.push(entry),
                UpdateCondition::No => {}
            }
        }

        // Early updates only ride along with a batch some other feed triggered.
        if must_push.is_empty() {
            debug!("No update conditions met. No push needed.");
            return 0;
        }

        info!(
            required = must_push.len(),
            early = may_push.len(),
            "Update conditions met. Scheduling push."
        );
        must_push
            .into_iter()
            .chain(may_push)
            .filter(|entry| scheduler.notify_needs_update(*entry))
            .count()
    }
}

/// Clears the running flag however `start` exits.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn run_source_poller(
    stream: Arc<PriceStreamClient>,
    source: Arc<dyn PriceSource>,
    feed_ids: Vec<FeedId>,
    polling_interval: Duration,
    shutdown: CancellationToken,
) {
    info!(interval = ?polling_interval, "Starting source price poller");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(polling_interval) => {}
        }
        if let Err(e) = stream.refresh(source.as_ref(), &feed_ids).await {
            error!(error = %e, "Failed to poll source prices.");
        }
    }
}
