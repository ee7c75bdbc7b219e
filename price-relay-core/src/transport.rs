//! Resilient WebSocket session to the price service.
//!
//! Owns one physical connection at a time, watches peer pings for liveness,
//! and transparently reconnects with exponential backoff after any close it
//! did not initiate itself. Outbound messages go through a queue drained by
//! the connection task, so callers never touch the socket directly.

use crate::error::{ConfigError, StreamError, StreamResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// The price service pings every 30 seconds.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_SLACK: Duration = Duration::from_secs(3);
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL (`ws://` or `wss://`).
    pub url: String,
    /// How often the peer is expected to ping.
    pub ping_interval: Duration,
    /// Extra time granted on top of `ping_interval` before the connection is
    /// considered dead.
    pub ping_slack: Duration,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay: Duration,
    /// Upper bound for the backoff delay (`None` = unbounded).
    pub reconnect_max_delay: Option<Duration>,
    /// Timeout of a single connection attempt.
    pub connect_timeout: Duration,
    /// How long `send` waits for the session to become open (`None` = forever).
    pub ready_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_slack: DEFAULT_PING_SLACK,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            reconnect_max_delay: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ready_timeout: Some(DEFAULT_READY_TIMEOUT),
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.ping_interval + self.ping_slack
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Missing("price service websocket endpoint"));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: self.url.clone(),
                reason: "expected a ws:// or wss:// URL".to_string(),
            });
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "ping_interval",
            });
        }
        if self.reconnect_base_delay.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "reconnect_base_delay",
            });
        }
        Ok(())
    }
}

/// Connection state, owned by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Exponential reconnect backoff: `base * 2^failures`, optionally capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Option<Duration>) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Counts one more consecutive failure and returns the delay to wait.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Callbacks the session invokes. Set once when the session is built.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// A text (or UTF-8 binary) frame arrived.
    fn on_message(&self, text: &str);

    /// Transport faults and malformed frames. Never fatal.
    fn on_error(&self, error: &StreamError) {
        warn!(error = %error, "Price stream error");
    }

    /// A replacement connection is open after an unexpected close.
    async fn on_reconnect(&self, session: &TransportSession);
}

#[derive(Default)]
struct Lifecycle {
    task: Option<JoinHandle<()>>,
}

/// A long-lived, self-healing WebSocket session.
pub struct TransportSession {
    config: SessionConfig,
    hooks: Arc<dyn SessionHooks>,
    state: watch::Sender<ConnectionState>,
    backoff: Mutex<Backoff>,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: TokioMutex<mpsc::UnboundedReceiver<String>>,
    /// Cancelled exactly once, by `close`.
    shutdown: CancellationToken,
    /// Serializes `open`/`close` against state changes made by the connection task.
    lifecycle: Mutex<Lifecycle>,
}

impl TransportSession {
    pub fn new(config: SessionConfig, hooks: Arc<dyn SessionHooks>) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let backoff = Backoff::new(config.reconnect_base_delay, config.reconnect_max_delay);
        Arc::new(Self {
            config,
            hooks,
            state: watch::Sender::new(ConnectionState::Disconnected),
            backoff: Mutex::new(backoff),
            outbound_tx,
            outbound_rx: TokioMutex::new(outbound_rx),
            shutdown: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Consecutive failed connections since the last successful open.
    pub fn failure_count(&self) -> u32 {
        self.backoff.lock().failures()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Starts the connection task. No-op while connecting or open.
    pub fn open(self: &Arc<Self>) -> StreamResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if self.shutdown.is_cancelled() {
            return Err(StreamError::Closed);
        }
        if lifecycle.task.is_some() {
            return Ok(());
        }

        self.state.send_replace(ConnectionState::Connecting);
        let session = Arc::clone(self);
        lifecycle.task = Some(tokio::spawn(async move { session.run().await }));
        Ok(())
    }

    /// Queues `text` for the peer, waiting for the connection to be open
    /// first if a (re)connect is in progress.
    pub async fn send(&self, text: String) -> StreamResult<()> {
        self.ready().await?;
        debug!(message = %text, "Sending");
        self.outbound_tx
            .send(text)
            .map_err(|_| StreamError::NotConnected)
    }

    /// User-initiated close. Suppresses reconnects; safe to call repeatedly.
    pub fn close(&self) {
        let lifecycle = self.lifecycle.lock();
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(url = %self.config.url, "Closing price stream session");
        self.shutdown.cancel();
        let next = if lifecycle.task.is_some() {
            ConnectionState::Closing
        } else {
            ConnectionState::Disconnected
        };
        self.state.send_replace(next);
    }

    /// Closes the session and waits for the connection task to finish.
    pub async fn shutdown(&self) {
        self.close();
        let task = self.lifecycle.lock().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Price stream task ended abnormally");
            }
        }
    }

    /// Waits, bounded by `ready_timeout`, until the connection is open.
    pub async fn ready(&self) -> StreamResult<()> {
        let mut rx = self.state.subscribe();
        let wait = rx.wait_for(|state| *state != ConnectionState::Connecting);

        let state = match self.config.ready_timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result.map(|state| *state),
                Err(_) => return Err(StreamError::ReadyTimeout(limit)),
            },
            None => wait.await.map(|state| *state),
        }
        .map_err(|_| StreamError::NotConnected)?;

        match state {
            ConnectionState::Open => Ok(()),
            _ => Err(StreamError::NotConnected),
        }
    }

    /// Applies a state change unless the session was closed meanwhile; after
    /// `close` only the final `Disconnected` is accepted.
    fn transition(&self, next: ConnectionState) -> bool {
        let _lifecycle = self.lifecycle.lock();
        if self.shutdown.is_cancelled() && next != ConnectionState::Disconnected {
            return false;
        }
        self.state.send_replace(next);
        true
    }

    #[instrument(skip_all, name = "price_stream_session", fields(url = %self.config.url))]
    async fn run(self: Arc<Self>) {
        let mut reconnecting = false;

        loop {
            if !self.transition(ConnectionState::Connecting) {
                break;
            }

            info!(reconnecting, "Connecting to price service stream");
            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                connect_async(self.config.url.as_str()),
            );
            let connected = tokio::select! {
                () = self.shutdown.cancelled() => break,
                result = attempt => result,
            };

            match connected {
                Ok(Ok((stream, _response))) => {
                    self.backoff.lock().reset();
                    if !self.transition(ConnectionState::Open) {
                        break;
                    }
                    info!("Price service stream connected");

                    if reconnecting {
                        self.hooks.on_reconnect(self.as_ref()).await;
                    }

                    match self.drive(stream).await {
                        Ok(()) => break,
                        Err(e) => self.hooks.on_error(&e),
                    }
                }
                Ok(Err(e)) => self.hooks.on_error(&StreamError::from(e)),
                Err(_) => self.hooks.on_error(&StreamError::ConnectionFailed(format!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout
                ))),
            }

            if !self.transition(ConnectionState::Connecting) {
                break;
            }

            let (delay, failures) = {
                let mut backoff = self.backoff.lock();
                let delay = backoff.record_failure();
                (delay, backoff.failures())
            };
            error!(
                failures,
                delay_ms = delay.as_millis() as u64,
                "Connection closed unexpectedly or because of timeout. Reconnecting after backoff."
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown.cancelled() => break,
            }
            reconnecting = true;
        }

        self.transition(ConnectionState::Disconnected);
        info!("Price stream session closed");
    }

    /// Pumps one open connection. Returns `Ok` only for a user-initiated close.
    async fn drive(&self, stream: WsStream) -> StreamResult<()> {
        let (mut write, mut read) = stream.split();
        let liveness = self.config.liveness_timeout();
        let deadline = tokio::time::sleep(liveness);
        tokio::pin!(deadline);

        let mut outbound = self.outbound_rx.lock().await;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(error = %e, "Failed to send close frame");
                    }
                    return Ok(());
                }

                () = &mut deadline => {
                    warn!(timeout_ms = liveness.as_millis() as u64, "No ping from peer. Restarting stream.");
                    return Err(StreamError::LivenessTimeout(liveness));
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.hooks.on_message(&text),
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => self.hooks.on_message(&text),
                            Err(e) => self.hooks.on_error(&StreamError::MalformedFrame(e.to_string())),
                        },
                        // tungstenite queues the pong reply itself.
                        Some(Ok(Message::Ping(_))) => {
                            trace!("Heartbeat");
                            deadline.as_mut().reset(Instant::now() + liveness);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1005, "No close frame".to_string()));
                            return Err(StreamError::ConnectionClosed { code, reason });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(StreamError::ConnectionClosed {
                                code: 1006,
                                reason: "Stream ended".to_string(),
                            });
                        }
                    }
                }

                Some(text) = outbound.recv() => {
                    write.send(Message::Text(text)).await?;
                }
            }
        }
    }
}
