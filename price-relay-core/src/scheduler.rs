//! Batches feeds that need an update into one transaction and keeps each
//! pushed feed in cooldown until the submission had time to land.

use crate::error::ConfigError;
use crate::gateway::{LedgerGateway, PriceSource, SubmissionReceipt};
use crate::types::{FeedId, UnixTimestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-feed push state. Only the scheduler changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Idle,
    Batching,
    Cooldown,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long the first flagged feed waits for others to join its batch.
    /// Zero flushes on the next scheduler turn, i.e. once per re-scan cycle.
    pub batching_window: Duration,
    /// Time after a submission during which its feeds are not reconsidered.
    /// Must exceed the ledger's confirmation latency.
    pub cooldown: Duration,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cooldown.is_zero() {
            return Err(ConfigError::ZeroDuration { name: "cooldown" });
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batching_window: Duration::ZERO,
            cooldown: Duration::from_secs(10),
        }
    }
}

/// A feed queued for the next batch, with the on-chain publish time that was
/// observed when the update was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub feed_id: FeedId,
    pub target_publish_time: Option<UnixTimestamp>,
}

/// Classified submission failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmissionFailure {
    /// The transaction reverted without a reason; most likely someone
    /// already pushed the same or a newer price.
    #[error("update already applied: {0}")]
    AlreadyApplied(String),

    /// Concurrent pushers contend for the same account.
    #[error("nonce conflict: {0}")]
    NonceConflict(String),

    /// The payer account must be topped up.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("submission failed: {0}")]
    Other(String),
}

impl SubmissionFailure {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InsufficientFunds(_))
    }
}

/// Maps a ledger error onto a [`SubmissionFailure`]. Gateways may return a
/// `SubmissionFailure` directly; otherwise the error text is inspected.
pub fn classify_submission_error(err: &anyhow::Error) -> SubmissionFailure {
    if let Some(failure) = err.downcast_ref::<SubmissionFailure>() {
        return failure.clone();
    }
    classify_message(&format!("{:#}", err))
}

fn classify_message(message: &str) -> SubmissionFailure {
    let lower = message.to_lowercase();

    if lower.contains("insufficient funds")
        || lower.contains("doesn't have enough funds")
        || lower.contains("insufficient balance")
    {
        return SubmissionFailure::InsufficientFunds(message.to_string());
    }

    if lower.contains("nonce too low")
        || lower.contains("correct nonce")
        || lower.contains("sequence_number_too_old")
        || lower.contains("sequence number too old")
    {
        return SubmissionFailure::NonceConflict(message.to_string());
    }

    if lower.contains("already applied") || reverted_without_reason(&lower) {
        return SubmissionFailure::AlreadyApplied(message.to_string());
    }

    SubmissionFailure::Other(message.to_string())
}

fn reverted_without_reason(lower: &str) -> bool {
    const MARKERS: [&str; 2] = [
        "vm exception while processing transaction: revert",
        "execution reverted",
    ];

    MARKERS.iter().any(|marker| match lower.find(marker) {
        Some(pos) => {
            let rest = lower[pos + marker.len()..].trim_start();
            let reason = rest.strip_prefix(':').unwrap_or(rest).trim_start();
            !reason.starts_with(|c: char| c.is_ascii_alphanumeric())
        }
        None => false,
    })
}

/// Result of a submission attempt that did not stop the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Submitted(SubmissionReceipt),
    /// The ledger rejected the transaction for a non-fatal reason.
    Absorbed(SubmissionFailure),
    /// Nothing to push.
    Skipped,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("failed to fetch update payload: {0:#}")]
    Payload(anyhow::Error),

    #[error("failed to estimate update fee: {0:#}")]
    Fee(anyhow::Error),

    #[error("fatal submission failure: {0}")]
    Fatal(SubmissionFailure),
}

#[derive(Default)]
struct SchedulerState {
    states: HashMap<FeedId, PushState>,
    pending: Vec<BatchEntry>,
}

pub struct PushScheduler {
    source: Arc<dyn PriceSource>,
    ledger: Arc<dyn LedgerGateway>,
    config: SchedulerConfig,
    inner: Mutex<SchedulerState>,
    fatal: Mutex<Option<SubmissionFailure>>,
    fatal_signal: CancellationToken,
    shutdown: CancellationToken,
}

impl PushScheduler {
    pub fn new(
        source: Arc<dyn PriceSource>,
        ledger: Arc<dyn LedgerGateway>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            ledger,
            config,
            inner: Mutex::new(SchedulerState::default()),
            fatal: Mutex::new(None),
            fatal_signal: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self, feed_id: &FeedId) -> PushState {
        self.inner
            .lock()
            .states
            .get(feed_id)
            .copied()
            .unwrap_or(PushState::Idle)
    }

    pub fn fatal_error(&self) -> Option<SubmissionFailure> {
        self.fatal.lock().clone()
    }

    /// Resolves once a fatal submission failure has been recorded.
    pub async fn wait_fatal(&self) -> Option<SubmissionFailure> {
        self.fatal_signal.cancelled().await;
        self.fatal_error()
    }

    /// Flags `entry.feed_id` for the next batch. Ignored unless the feed is
    /// `Idle`. The first feed accepted into an empty batch opens the
    /// batching window.
    pub fn notify_needs_update(self: &Arc<Self>, entry: BatchEntry) -> bool {
        if self.shutdown.is_cancelled() || self.fatal_signal.is_cancelled() {
            return false;
        }

        let opens_window = {
            let mut inner = self.inner.lock();
            let state = inner
                .states
                .entry(entry.feed_id)
                .or_insert(PushState::Idle);
            let current = *state;
            if current != PushState::Idle {
                debug!(feed_id = %entry.feed_id, state = ?current, "Feed is already being pushed. Ignoring.");
                return false;
            }
            *state = PushState::Batching;
            inner.pending.push(entry);
            inner.pending.len() == 1
        };

        if opens_window {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move { scheduler.run_batch_window().await });
        }
        true
    }

    /// Stops batching and cooldown timers, returning their feeds to `Idle`.
    /// A submission already in flight is allowed to finish.
    pub fn shutdown(&self) {
        info!("Push scheduler shutdown requested");
        self.shutdown.cancel();
    }

    async fn run_batch_window(self: Arc<Self>) {
        tokio::select! {
            () = tokio::time::sleep(self.config.batching_window) => {}
            () = self.shutdown.cancelled() => {
                let batch = std::mem::take(&mut self.inner.lock().pending);
                self.set_states(&batch, PushState::Idle);
                return;
            }
        }

        let batch = std::mem::take(&mut self.inner.lock().pending);
        if batch.is_empty() {
            return;
        }

        let outcome = self.push_batch(&batch).await;
        match outcome {
            Ok(PushOutcome::Submitted(_)) | Ok(PushOutcome::Absorbed(_)) => {}
            Ok(PushOutcome::Skipped) => {
                self.set_states(&batch, PushState::Idle);
                return;
            }
            Err(PushError::Fatal(failure)) => {
                error!(error = %failure, "Payer is out of balance, please top it up.");
                *self.fatal.lock() = Some(failure);
                self.set_states(&batch, PushState::Idle);
                self.fatal_signal.cancel();
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to prepare price update. Skipping this push.");
                self.set_states(&batch, PushState::Idle);
                return;
            }
        }

        self.set_states(&batch, PushState::Cooldown);
        tokio::select! {
            () = tokio::time::sleep(self.config.cooldown) => {}
            () = self.shutdown.cancelled() => {}
        }
        self.set_states(&batch, PushState::Idle);
        debug!(count = batch.len(), "Cooldown finished");
    }

    /// Fetches the update payload for `batch`, pays the fee and submits it.
    /// Non-fatal ledger rejections are classified and absorbed.
    pub async fn push_batch(&self, batch: &[BatchEntry]) -> Result<PushOutcome, PushError> {
        if batch.is_empty() {
            return Ok(PushOutcome::Skipped);
        }

        let feed_ids: Vec<FeedId> = batch.iter().map(|entry| entry.feed_id).collect();
        let target_times: Vec<Option<UnixTimestamp>> = batch
            .iter()
            .map(|entry| entry.target_publish_time)
            .collect();

        let payload = self
            .source
            .fetch_update_payload(&feed_ids)
            .await
            .map_err(PushError::Payload)?;

        let fee = self
            .ledger
            .estimate_fee(&payload)
            .await
            .map_err(PushError::Fee)?;

        info!(
            count = feed_ids.len(),
            ids = ?feed_ids.iter().map(FeedId::to_hex).collect::<Vec<_>>(),
            fee,
            "Pushing price updates"
        );

        match self
            .ledger
            .submit(&payload, &feed_ids, &target_times, fee)
            .await
        {
            Ok(receipt) => {
                info!(tx_hash = %receipt.tx_hash, "Successfully submitted price update transaction.");
                Ok(PushOutcome::Submitted(receipt))
            }
            Err(e) => {
                let failure = classify_submission_error(&e);
                if failure.is_fatal() {
                    return Err(PushError::Fatal(failure));
                }
                match &failure {
                    SubmissionFailure::AlreadyApplied(_) => info!(
                        "Execution reverted. With high probability, the target chain price \
                         has already been updated. Skipping this push."
                    ),
                    SubmissionFailure::NonceConflict(_) => warn!(
                        "Multiple pushers are using the same account and the nonce is incorrect. \
                         Skipping this push."
                    ),
                    SubmissionFailure::InsufficientFunds(_) | SubmissionFailure::Other(_) => error!(
                        error = ?e,
                        ids = ?feed_ids.iter().map(FeedId::to_hex).collect::<Vec<_>>(),
                        "An unidentified error occurred while pushing price updates."
                    ),
                }
                Ok(PushOutcome::Absorbed(failure))
            }
        }
    }

    fn set_states(&self, batch: &[BatchEntry], state: PushState) {
        let mut inner = self.inner.lock();
        for entry in batch {
            inner.states.insert(entry.feed_id, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::UpdatePayload;
    use crate::types::Observation;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::time::Instant;

    #[derive(Debug, Default)]
    struct StubSource {
        fail: bool,
    }

    #[async_trait]
    impl PriceSource for StubSource {
        async fn fetch_latest(&self, _feed_ids: &[FeedId]) -> Result<Vec<(FeedId, Observation)>> {
            Ok(Vec::new())
        }

        async fn fetch_update_payload(&self, feed_ids: &[FeedId]) -> Result<UpdatePayload> {
            if self.fail {
                return Err(anyhow!("price service unavailable"));
            }
            Ok(UpdatePayload::new(
                feed_ids.iter().map(|id| id.as_bytes().to_vec()).collect(),
            ))
        }
    }

    #[derive(Debug, Default)]
    struct StubLedger {
        error: Option<String>,
        submissions: Mutex<Vec<Vec<FeedId>>>,
    }

    impl StubLedger {
        fn failing(message: &str) -> Self {
            Self {
                error: Some(message.to_string()),
                ..Default::default()
            }
        }

        fn submissions(&self) -> Vec<Vec<FeedId>> {
            self.submissions.lock().clone()
        }
    }

    #[async_trait]
    impl LedgerGateway for StubLedger {
        async fn query_on_chain(&self, _feed_id: &FeedId) -> Result<Option<Observation>> {
            Ok(None)
        }

        async fn estimate_fee(&self, payload: &UpdatePayload) -> Result<u128> {
            Ok(payload.updates.len() as u128)
        }

        async fn submit(
            &self,
            _payload: &UpdatePayload,
            feed_ids: &[FeedId],
            _target_publish_times: &[Option<UnixTimestamp>],
            _fee: u128,
        ) -> Result<SubmissionReceipt> {
            self.submissions.lock().push(feed_ids.to_vec());
            match &self.error {
                Some(message) => Err(anyhow!(message.clone())),
                None => Ok(SubmissionReceipt {
                    tx_hash: "0xfeed".to_string(),
                }),
            }
        }
    }

    fn feed(n: u8) -> FeedId {
        FeedId::from_bytes([n; 32])
    }

    fn entry(n: u8) -> BatchEntry {
        BatchEntry {
            feed_id: feed(n),
            target_publish_time: Some(100),
        }
    }

    fn config(window_ms: u64, cooldown_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            batching_window: Duration::from_millis(window_ms),
            cooldown: Duration::from_millis(cooldown_ms),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let started = Instant::now();
        while !condition() {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_classify_reverted_without_reason() {
        for message in [
            "execution reverted",
            "Error: VM Exception while processing transaction: revert",
            "call failed: execution reverted, data: 0x",
        ] {
            assert!(
                matches!(
                    classify_message(message),
                    SubmissionFailure::AlreadyApplied(_)
                ),
                "{}",
                message
            );
        }
    }

    #[test]
    fn test_classify_revert_with_reason_is_other() {
        assert!(matches!(
            classify_message("execution reverted: invalid data source"),
            SubmissionFailure::Other(_)
        ));
    }

    #[test]
    fn test_classify_nonce_and_funds() {
        assert!(matches!(
            classify_message("the tx doesn't have the correct nonce."),
            SubmissionFailure::NonceConflict(_)
        ));
        assert!(matches!(
            classify_message("nonce too low"),
            SubmissionFailure::NonceConflict(_)
        ));
        let funds = classify_message("sender doesn't have enough funds to send tx.");
        assert!(funds.is_fatal());
        assert!(classify_message("insufficient funds for gas * price + value").is_fatal());
    }

    #[test]
    fn test_classify_prefers_typed_failure() {
        let err = anyhow::Error::new(SubmissionFailure::NonceConflict("typed".into()))
            .context("submit failed with insufficient funds text in context");
        assert_eq!(
            classify_submission_error(&err),
            SubmissionFailure::NonceConflict("typed".into())
        );
    }

    #[tokio::test]
    async fn test_push_batch_submits_all_feeds() {
        let ledger = Arc::new(StubLedger::default());
        let scheduler = PushScheduler::new(
            Arc::new(StubSource::default()),
            ledger.clone(),
            config(0, 100),
        );

        let outcome = scheduler.push_batch(&[entry(1), entry(2)]).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Submitted(_)));
        assert_eq!(ledger.submissions(), vec![vec![feed(1), feed(2)]]);
    }

    #[tokio::test]
    async fn test_push_batch_absorbs_benign_revert() {
        let scheduler = PushScheduler::new(
            Arc::new(StubSource::default()),
            Arc::new(StubLedger::failing("execution reverted")),
            config(0, 100),
        );
        let outcome = scheduler.push_batch(&[entry(1)]).await.unwrap();
        assert!(matches!(
            outcome,
            PushOutcome::Absorbed(SubmissionFailure::AlreadyApplied(_))
        ));
    }

    #[tokio::test]
    async fn test_push_batch_propagates_insufficient_funds() {
        let scheduler = PushScheduler::new(
            Arc::new(StubSource::default()),
            Arc::new(StubLedger::failing("insufficient funds for transfer")),
            config(0, 100),
        );
        let result = scheduler.push_batch(&[entry(1)]).await;
        assert!(matches!(
            result,
            Err(PushError::Fatal(SubmissionFailure::InsufficientFunds(_)))
        ));
    }

    #[tokio::test]
    async fn test_cooldown_prevents_second_submission() {
        let ledger = Arc::new(StubLedger::default());
        let scheduler = PushScheduler::new(
            Arc::new(StubSource::default()),
            ledger.clone(),
            config(30, 300),
        );

        assert!(scheduler.notify_needs_update(entry(1)));
        for _ in 0..5 {
            assert!(!scheduler.notify_needs_update(entry(1)));
        }
        assert_eq!(scheduler.state(&feed(1)), PushState::Batching);

        wait_until(|| scheduler.state(&feed(1)) == PushState::Cooldown).await;
        assert!(!scheduler.notify_needs_update(entry(1)));
        assert_eq!(ledger.submissions().len(), 1);

        wait_until(|| scheduler.state(&feed(1)) == PushState::Idle).await;
        assert_eq!(ledger.submissions().len(), 1);
        assert!(scheduler.notify_needs_update(entry(1)));
        wait_until(|| ledger.submissions().len() == 2).await;
    }

    #[tokio::test]
    async fn test_feeds_flagged_in_window_share_a_batch() {
        let ledger = Arc::new(StubLedger::default());
        let scheduler = PushScheduler::new(
            Arc::new(StubSource::default()),
            ledger.clone(),
            config(50, 100),
        );

        assert!(scheduler.notify_needs_update(entry(1)));
        assert!(scheduler.notify_needs_update(entry(2)));
        assert!(scheduler.notify_needs_update(entry(3)));

        wait_until(|| !ledger.submissions().is_empty()).await;
        assert_eq!(ledger.submissions(), vec![vec![feed(1), feed(2), feed(3)]]);
    }

    #[tokio::test]
    async fn test_benign_failure_does_not_stop_later_cycles() {
        let ledger = Arc::new(StubLedger::failing("execution reverted"));
        let scheduler = PushScheduler::new(
            Arc::new(StubSource::default()),
            ledger.clone(),
            config(0, 30),
        );

        assert!(scheduler.notify_needs_update(entry(1)));
        wait_until(|| ledger.submissions().len() == 1).await;
        wait_until(|| scheduler.state(&feed(1)) == PushState::Idle).await;

        assert!(scheduler.notify_needs_update(entry(1)));
        wait_until(|| ledger.submissions().len() == 2).await;
        assert!(scheduler.fatal_error().is_none());
    }

    #[tokio::test]
    async fn test_fatal_failure_is_recorded_and_stops_intake() {
        let scheduler = PushScheduler::new(
            Arc::new(StubSource::default()),
            Arc::new(StubLedger::failing("sender doesn't have enough funds to send tx.")),
            config(0, 30),
        );

        assert!(scheduler.notify_needs_update(entry(1)));
        let failure = tokio::time::timeout(Duration::from_secs(5), scheduler.wait_fatal())
            .await
            .unwrap();
        assert!(matches!(failure, Some(SubmissionFailure::InsufficientFunds(_))));
        assert_eq!(scheduler.state(&feed(1)), PushState::Idle);
        assert!(!scheduler.notify_needs_update(entry(2)));
    }

    #[tokio::test]
    async fn test_payload_failure_returns_feed_to_idle() {
        let ledger = Arc::new(StubLedger::default());
        let scheduler = PushScheduler::new(
            Arc::new(StubSource { fail: true }),
            ledger.clone(),
            config(0, 10_000),
        );

        assert!(scheduler.notify_needs_update(entry(1)));
        wait_until(|| scheduler.state(&feed(1)) == PushState::Idle).await;
        assert!(ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_cooldown() {
        let ledger = Arc::new(StubLedger::default());
        let scheduler = PushScheduler::new(
            Arc::new(StubSource::default()),
            ledger.clone(),
            config(0, 60_000),
        );

        assert!(scheduler.notify_needs_update(entry(1)));
        wait_until(|| scheduler.state(&feed(1)) == PushState::Cooldown).await;

        scheduler.shutdown();
        wait_until(|| scheduler.state(&feed(1)) == PushState::Idle).await;
        assert!(!scheduler.notify_needs_update(entry(1)));
    }
}
