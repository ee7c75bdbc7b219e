//! Price stream client: a transport session, the subscription registry and
//! the observation cache wired together behind one control surface.

use crate::cache::ObservationCache;
use crate::error::{ConfigError, DecodeError, StreamError, StreamResult};
use crate::gateway::PriceSource;
use crate::message::{ClientMessage, ResponseStatus, ServerMessage};
use crate::registry::{CallbackId, PriceCallback, SubscriptionRegistry};
use crate::transport::{ConnectionState, SessionConfig, SessionHooks, TransportSession};
use crate::types::{FeedId, Observation};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, trace, warn};

/// Returned by [`PriceStreamClient::subscribe`]; identifies the callback for
/// precise removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    feed_ids: Vec<FeedId>,
    callback_id: CallbackId,
}

impl SubscriptionHandle {
    pub fn feed_ids(&self) -> &[FeedId] {
        &self.feed_ids
    }
}

struct StreamShared {
    registry: SubscriptionRegistry,
    cache: Arc<ObservationCache>,
    /// Held while a registry change and its wire request go out, so requests
    /// reach the server in registry order.
    wire: TokioMutex<()>,
    /// Session a background resend is pending for, if any.
    resyncing: Mutex<Option<Arc<TransportSession>>>,
}

impl StreamShared {
    fn new(cache: Arc<ObservationCache>) -> Self {
        Self {
            registry: SubscriptionRegistry::new(),
            cache,
            wire: TokioMutex::new(()),
            resyncing: Mutex::new(None),
        }
    }

    /// Records `observation` and fans it out if the cache accepted it.
    fn accept(&self, feed_id: FeedId, observation: Observation) -> bool {
        if !self.cache.record(feed_id, observation) {
            return false;
        }
        self.registry.dispatch(&feed_id, &observation);
        true
    }

    /// Sends a subscribe request for the whole active set.
    async fn send_active_set(&self, session: &TransportSession) -> StreamResult<()> {
        let feed_ids = self.registry.active_feeds();
        if feed_ids.is_empty() {
            return Ok(());
        }
        let request = ClientMessage::subscribe(&feed_ids)
            .to_json()
            .map_err(DecodeError::from)?;
        session.send(request).await
    }

    /// Re-sends the active set once `session` opens. Used after a subscribe
    /// request could not be sent; at most one such task runs per session.
    fn schedule_resync(self: &Arc<Self>, session: Arc<TransportSession>) {
        {
            let mut resyncing = self.resyncing.lock();
            if resyncing.as_ref().is_some_and(|s| Arc::ptr_eq(s, &session)) {
                return;
            }
            *resyncing = Some(Arc::clone(&session));
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match session.ready().await {
                    Ok(()) => {}
                    Err(StreamError::ReadyTimeout(_)) => continue,
                    Err(e) => {
                        debug!(error = %e, "Session closed before subscriptions were resent");
                        break;
                    }
                }

                let _wire = shared.wire.lock().await;
                match shared.send_active_set(&session).await {
                    Ok(()) => {
                        info!("Resent pending price feed subscriptions");
                        break;
                    }
                    Err(StreamError::ReadyTimeout(_)) => continue,
                    Err(e) => {
                        shared.on_error(&e);
                        break;
                    }
                }
            }
            let mut resyncing = shared.resyncing.lock();
            if resyncing.as_ref().is_some_and(|s| Arc::ptr_eq(s, &session)) {
                *resyncing = None;
            }
        });
    }
}

#[async_trait]
impl SessionHooks for StreamShared {
    fn on_message(&self, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                self.on_error(&StreamError::Decode(e));
                return;
            }
        };

        match message {
            ServerMessage::PriceUpdate { price_feed } => match price_feed.into_observation() {
                Ok((feed_id, observation)) => {
                    if !self.accept(feed_id, observation) {
                        trace!(%feed_id, publish_time = observation.publish_time, "Ignoring stale price update");
                    }
                }
                Err(e) => self.on_error(&StreamError::Decode(e)),
            },
            ServerMessage::Response {
                status: ResponseStatus::Error,
                error,
            } => self.on_error(&StreamError::ServerError(
                error.unwrap_or_else(|| "unspecified error".to_string()),
            )),
            ServerMessage::Response { .. } => debug!("Price service acknowledged request"),
        }
    }

    fn on_error(&self, error: &StreamError) {
        match error {
            StreamError::Decode(_) | StreamError::ServerError(_) | StreamError::MalformedFrame(_) => {
                error!(error = %error, "Dropping price service message")
            }
            _ => warn!(error = %error, "Price stream error"),
        }
    }

    async fn on_reconnect(&self, session: &TransportSession) {
        let feed_ids = self.registry.active_feeds();
        if feed_ids.is_empty() {
            return;
        }

        info!(count = feed_ids.len(), "Re-subscribing to price feeds after reconnect");
        let _wire = self.wire.lock().await;
        if let Err(e) = self.send_active_set(session).await {
            self.on_error(&e);
        }
    }
}

/// Client for the price service's streaming API.
///
/// The underlying session is created on first use and recreated after
/// [`stop`](Self::stop); registered callbacks survive both.
pub struct PriceStreamClient {
    config: SessionConfig,
    shared: Arc<StreamShared>,
    session: Mutex<Option<Arc<TransportSession>>>,
}

impl PriceStreamClient {
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        Self::with_cache(config, Arc::new(ObservationCache::new()))
    }

    /// Builds a client that feeds an existing cache.
    pub fn with_cache(
        config: SessionConfig,
        cache: Arc<ObservationCache>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            shared: Arc::new(StreamShared::new(cache)),
            session: Mutex::new(None),
        })
    }

    pub fn cache(&self) -> &Arc<ObservationCache> {
        &self.shared.cache
    }

    pub fn active_feeds(&self) -> Vec<FeedId> {
        self.shared.registry.active_feeds()
    }

    pub fn state(&self) -> ConnectionState {
        match self.session.lock().as_ref() {
            Some(session) => session.state(),
            None => ConnectionState::Disconnected,
        }
    }

    /// Opens the stream if it is not already running. A new session is sent
    /// the feeds that still have subscribers; if that request cannot be sent
    /// it is retried in the background and the error is returned.
    pub async fn start(&self) -> StreamResult<()> {
        let _wire = self.shared.wire.lock().await;
        let (session, fresh) = self.ensure_session()?;
        if fresh {
            self.request_active_set(session).await?;
        }
        Ok(())
    }

    /// Closes the stream and waits for the connection task to exit.
    pub async fn stop(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.shutdown().await;
        }
    }

    /// Registers `callback` for every feed in `feed_ids` and asks the server
    /// for the feeds that had no subscriber yet.
    ///
    /// The registration always succeeds. If the request cannot be sent (the
    /// stream is still connecting after `ready_timeout`), it is resent in the
    /// background once the session opens.
    pub async fn subscribe(&self, feed_ids: &[FeedId], callback: PriceCallback) -> SubscriptionHandle {
        let _wire = self.shared.wire.lock().await;
        let registry = &self.shared.registry;
        let callback_id = registry.next_callback_id();
        let unique: BTreeSet<FeedId> = feed_ids.iter().copied().collect();

        let mut newly_active = Vec::new();
        for feed_id in &unique {
            if registry.subscribe(*feed_id, callback_id, Arc::clone(&callback)) {
                newly_active.push(*feed_id);
            }
        }

        let handle = SubscriptionHandle {
            feed_ids: unique.into_iter().collect(),
            callback_id,
        };
        if newly_active.is_empty() {
            return handle;
        }

        let result = match self.ensure_session() {
            Ok((session, true)) => self.request_active_set(session).await,
            Ok((session, false)) => self.request_feeds(session, &newly_active).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, count = newly_active.len(), "Subscribe request not sent yet");
        }
        handle
    }

    /// Removes the handle's callback (`Some`) or every callback (`None`) from
    /// `feed_ids`, and unsubscribes server-side from feeds left without one.
    pub async fn unsubscribe(&self, feed_ids: &[FeedId], handle: Option<&SubscriptionHandle>) {
        let _wire = self.shared.wire.lock().await;
        let callback_id = handle.map(|h| h.callback_id);
        let unique: BTreeSet<FeedId> = feed_ids.iter().copied().collect();
        let inactive: Vec<FeedId> = unique
            .into_iter()
            .filter(|feed_id| self.shared.registry.unsubscribe(feed_id, callback_id))
            .collect();

        if inactive.is_empty() {
            return;
        }

        let session = self.session.lock().clone();
        let Some(session) = session.filter(|s| !s.is_closed()) else {
            return;
        };
        let request = match ClientMessage::unsubscribe(&inactive).to_json() {
            Ok(request) => request,
            Err(e) => {
                self.shared.on_error(&StreamError::Decode(e.into()));
                return;
            }
        };
        // Not replayed on reconnect anyway, so a lost request is harmless.
        if let Err(e) = session.send(request).await {
            debug!(error = %e, "Unsubscribe request not sent");
        }
    }

    pub fn get_latest(&self, feed_id: &FeedId) -> Option<Observation> {
        self.shared.cache.latest(feed_id)
    }

    /// One-shot poll of `source`, fed through the same cache and callbacks as
    /// streamed updates. Returns how many observations were accepted.
    pub async fn refresh(&self, source: &dyn PriceSource, feed_ids: &[FeedId]) -> Result<usize> {
        let observations = source.fetch_latest(feed_ids).await?;
        let accepted = observations
            .into_iter()
            .filter(|(feed_id, observation)| self.shared.accept(*feed_id, *observation))
            .count();
        debug!(requested = feed_ids.len(), accepted, "Refreshed source prices");
        Ok(accepted)
    }

    /// Returns the running session, creating and opening one if needed. The
    /// flag is set for a new session, which has not been told about any feed.
    fn ensure_session(&self) -> StreamResult<(Arc<TransportSession>, bool)> {
        let (session, fresh) = {
            let mut slot = self.session.lock();
            match slot.as_ref() {
                Some(session) if !session.is_closed() => (Arc::clone(session), false),
                _ => {
                    let hooks: Arc<dyn SessionHooks> = self.shared.clone();
                    let session = TransportSession::new(self.config.clone(), hooks);
                    *slot = Some(Arc::clone(&session));
                    (session, true)
                }
            }
        };
        session.open()?;
        Ok((session, fresh))
    }

    async fn request_active_set(&self, session: Arc<TransportSession>) -> StreamResult<()> {
        let result = self.shared.send_active_set(&session).await;
        if result.is_err() {
            self.shared.schedule_resync(session);
        }
        result
    }

    async fn request_feeds(&self, session: Arc<TransportSession>, feed_ids: &[FeedId]) -> StreamResult<()> {
        let request = ClientMessage::subscribe(feed_ids)
            .to_json()
            .map_err(DecodeError::from)?;
        let result = session.send(request).await;
        if result.is_err() {
            self.shared.schedule_resync(session);
        }
        result
    }
}
