//! Connection lifecycle management
//!
//! [`ConnectionManager`] owns one transport and everything needed to keep a
//! usable session on top of it: the handshake, the correlation table, the
//! coalescing flush, liveness probing and recovery.
//!
//! # States
//!
//! ```text
//! Disconnected -> Connecting -> Negotiating -> Ready <-> Degraded
//!      ^              |              |           |          |
//!      +--------------+              +-----------+----------+--> Closing -> Closed
//! ```
//!
//! - A connect error returns to `Disconnected`; the caller may try again.
//! - A failed handshake is fatal and goes straight to `Closed`.
//! - Losing the transport, failing a send, or missing too many heartbeats
//!   while `Ready` moves to `Degraded` and starts a single recovery task.
//!   Requests issued while degraded wait in a bounded FIFO queue.
//! - Recovery renegotiates, drains the queue in order and only then returns
//!   to `Ready`. Exhausting the attempts, or a handshake rejection, closes
//!   the connection and fails everything still pending.
//!
//! # Locking
//!
//! All mutable session data sits behind one `std::sync::Mutex` that is
//! never held across an `.await`. Sends are serialized by a separate async
//! lock so frames leave in the order their batches were taken.

mod backoff;
mod heartbeat;

pub use backoff::ReconnectPolicy;
pub use heartbeat::HeartbeatMonitor;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::{Envelope, EnvelopeKind, MessageCodec, RpcError, ERROR_METHOD_NOT_FOUND};
use crate::config::{Config, ReplayPolicy};
use crate::correlator::{BatchPolicy, CorrelationTable, Outcome, Resolution};
use crate::error::{classify, CapwireError, Result};
use crate::negotiator::{CapabilityNegotiator, NegotiatedCapabilities};
use crate::transport::{Transport, TransportKind};
use crate::types::{
    CapabilityKind, Implementation, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING,
    NOTIF_PROMPTS_LIST_CHANGED, NOTIF_RESOURCES_LIST_CHANGED, NOTIF_TOOLS_LIST_CHANGED,
};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Negotiating,
    Ready,
    Degraded,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Published on the manager's broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The provider announced that a capability list changed. `kinds` is
    /// empty for lists this client does not model.
    CapabilityListChanged { kinds: Vec<CapabilityKind> },
    /// A frame was malformed or answered nothing we asked.
    ProtocolAnomaly(String),
}

/// How a recovery run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Recovered,
    Closed,
}

type ReconnectFuture = Shared<BoxFuture<'static, ReconnectOutcome>>;

/// Timing and sizing knobs resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_timeout: Duration,
    pub heartbeat_miss_threshold: u32,
    pub reconnect: ReconnectPolicy,
    pub queue_capacity: usize,
    pub replay_policy: ReplayPolicy,
    pub batch: BatchPolicy,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        let conn = &config.connection;
        Self {
            request_timeout: conn.request_timeout(),
            connect_timeout: conn.connect_timeout(),
            heartbeat_interval: conn.heartbeat_interval(),
            heartbeat_timeout: conn.heartbeat_timeout(),
            heartbeat_miss_threshold: conn.heartbeat_miss_threshold,
            reconnect: ReconnectPolicy::from(&conn.reconnect),
            queue_capacity: conn.degraded_queue_capacity,
            replay_policy: conn.replay_policy,
            batch: BatchPolicy::new(config.batching.window(), config.batching.max_batch_size),
        }
    }
}

/// Everything guarded by the state lock.
struct Session {
    state: ConnectionState,
    table: CorrelationTable,
    /// Bumped on every successful transport connect.
    generation: u64,
    /// Id of the in-flight `initialize`, failed fast if the stream ends.
    handshake_id: Option<u64>,
    reconnect: Option<ReconnectFuture>,
    negotiated: Option<Arc<NegotiatedCapabilities>>,
}

struct ConnectionInner {
    transport: Arc<dyn Transport>,
    codec: MessageCodec,
    negotiator: CapabilityNegotiator,
    settings: ConnectionSettings,
    session: Mutex<Session>,
    send_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
    heartbeat: HeartbeatMonitor,
    cancel: CancellationToken,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Resilient session over a [`Transport`].
///
/// Cheap to clone; clones share the same session. Dropping the last clone
/// stops the background tasks.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("transport", &self.inner.transport.kind())
            .field("state", &self.inner.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager. Nothing is opened until [`connect`](Self::connect).
    pub fn new(transport: Arc<dyn Transport>, config: &Config) -> Self {
        let negotiator = CapabilityNegotiator::new(Implementation {
            name: config.client.name.clone(),
            version: config.client.version.clone(),
        });
        Self::with_negotiator(transport, config, negotiator)
    }

    /// Create a manager with a custom handshake.
    pub fn with_negotiator(
        transport: Arc<dyn Transport>,
        config: &Config,
        negotiator: CapabilityNegotiator,
    ) -> Self {
        let settings = ConnectionSettings::from(config);
        let (events, _) = broadcast::channel(64);
        let heartbeat = HeartbeatMonitor::new(settings.heartbeat_miss_threshold);
        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                codec: MessageCodec::new(),
                negotiator,
                settings,
                session: Mutex::new(Session {
                    state: ConnectionState::Disconnected,
                    table: CorrelationTable::new(),
                    generation: 0,
                    handshake_id: None,
                    reconnect: None,
                    negotiated: None,
                }),
                send_lock: tokio::sync::Mutex::new(()),
                events,
                heartbeat,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Open the transport and perform the handshake.
    ///
    /// # Errors
    ///
    /// A transport failure or connect timeout leaves the manager
    /// `Disconnected` so the call can be retried. A handshake failure
    /// ([`CapwireError::ProtocolVersionMismatch`],
    /// [`CapwireError::NegotiationFailed`], or a handshake timeout) closes
    /// the manager for good.
    pub async fn connect(&self) -> Result<Arc<NegotiatedCapabilities>> {
        self.inner.connect().await
    }

    /// Issue a request with the default timeout and wait for its outcome.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.begin(method, params, None).await?.wait().await
    }

    /// Issue a request with an optional deadline and cancellation token.
    pub async fn request_with(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<Value> {
        self.begin(method, params, timeout)
            .await?
            .wait_with(cancel)
            .await
    }

    /// Enqueue a request and return a handle to await it.
    ///
    /// While `Ready` the request joins the current batch window. While
    /// `Degraded` it joins the recovery queue.
    ///
    /// # Errors
    ///
    /// [`CapwireError::Overloaded`] when the recovery queue is full;
    /// [`CapwireError::NotConnected`] in any other state.
    pub async fn begin(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<PendingCall> {
        self.inner.begin(method, params, timeout).await
    }

    /// Cancel a pending request. Returns `false` if it already resolved.
    pub fn cancel(&self, id: u64) -> bool {
        self.inner.lock().table.cancel(id, CapwireError::Cancelled(id))
    }

    /// Force recovery as if the transport had been lost. Returns `None` if
    /// the connection is not in a state that can recover.
    pub async fn reconnect(&self, reason: &str) -> Option<ReconnectOutcome> {
        let run = self.inner.trigger_reconnect(reason)?;
        Some(run.await)
    }

    /// Close the connection and fail every pending request. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut session = self.inner.lock();
            let state = session.state;
            match state {
                ConnectionState::Closing | ConnectionState::Closed => return Ok(()),
                _ => self.inner.transition(&mut session, ConnectionState::Closing),
            }
        }
        self.inner.terminate("connection closed").await;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Result of the most recent handshake.
    pub fn negotiated(&self) -> Option<Arc<NegotiatedCapabilities>> {
        self.inner.lock().negotiated.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.lock().table.pending_len()
    }

    pub fn queued_requests(&self) -> usize {
        self.inner.lock().table.queued_len()
    }

    /// Number of successful transport connects so far.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }
}

impl ConnectionInner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn state(&self) -> ConnectionState {
        self.lock().state
    }

    fn transition(&self, session: &mut Session, to: ConnectionState) {
        let from = session.state;
        if from == to {
            return;
        }
        session.state = to;
        tracing::info!(%from, %to, transport = %self.transport.kind(), "connection state changed");
        let _ = self.events.send(ConnectionEvent::StateChanged { from, to });
    }

    fn anomaly(&self, detail: String) {
        tracing::warn!("protocol anomaly: {}", detail);
        let _ = self.events.send(ConnectionEvent::ProtocolAnomaly(detail));
    }

    fn sweep_expired(&self, now: Instant) -> usize {
        self.lock().table.sweep_expired(now).len()
    }

    async fn connect(self: &Arc<Self>) -> Result<Arc<NegotiatedCapabilities>> {
        {
            let mut session = self.lock();
            let state = session.state;
            match (state, session.negotiated.clone()) {
                (ConnectionState::Disconnected, _) => {
                    self.transition(&mut session, ConnectionState::Connecting)
                }
                (ConnectionState::Ready, Some(negotiated)) => return Ok(negotiated),
                (other, _) => {
                    return Err(
                        CapwireError::Connect(format!("cannot connect while {}", other)).into(),
                    )
                }
            }
        }

        let opened =
            tokio::time::timeout(self.settings.connect_timeout, self.transport.connect()).await;
        let failure = match opened {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(
                CapwireError::Connect(format!(
                    "timed out after {}ms",
                    self.settings.connect_timeout.as_millis()
                ))
                .into(),
            ),
        };
        if let Some(e) = failure {
            let mut session = self.lock();
            if session.state == ConnectionState::Connecting {
                self.transition(&mut session, ConnectionState::Disconnected);
            }
            return Err(e);
        }

        let generation = {
            let mut session = self.lock();
            if session.state != ConnectionState::Connecting {
                return Err(CapwireError::ConnectionLost("closed while connecting".into()).into());
            }
            session.generation += 1;
            self.transition(&mut session, ConnectionState::Negotiating);
            session.generation
        };
        self.spawn_read_loop(generation);

        match self.negotiate().await {
            Ok(negotiated) => {
                {
                    let mut session = self.lock();
                    if session.state != ConnectionState::Negotiating {
                        return Err(CapwireError::ConnectionLost(
                            "closed during negotiation".into(),
                        )
                        .into());
                    }
                    session.negotiated = Some(Arc::clone(&negotiated));
                    self.transition(&mut session, ConnectionState::Ready);
                }
                if let Some(interval) = self.settings.heartbeat_interval {
                    heartbeat::spawn(
                        self,
                        interval,
                        self.settings.heartbeat_timeout,
                        self.cancel.clone(),
                    );
                }
                Ok(negotiated)
            }
            Err(e) => {
                tracing::error!("handshake failed: {:#}", e);
                self.terminate(&format!("handshake failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Send `initialize`, validate the reply and acknowledge it.
    async fn negotiate(self: &Arc<Self>) -> Result<Arc<NegotiatedCapabilities>> {
        let params = serde_json::to_value(self.negotiator.handshake_params())?;
        let result = self
            .send_direct(METHOD_INITIALIZE, params, self.settings.connect_timeout, true)
            .await;
        let result = match result {
            Ok(value) => value,
            Err(e) => {
                if let Some(CapwireError::Remote { code, message, .. }) = classify(&e) {
                    return Err(CapwireError::NegotiationFailed(format!(
                        "provider rejected initialize ({}): {}",
                        code, message
                    ))
                    .into());
                }
                return Err(e);
            }
        };

        let negotiated = self.negotiator.accept(result)?;
        let ack = self
            .codec
            .encode(&Envelope::notification(METHOD_INITIALIZED, json!({})))?;
        if let Err(e) = self.transport.send(ack).await {
            tracing::warn!("failed to send initialized notification: {}", e);
        }
        tracing::info!(
            protocol_version = %negotiated.protocol_version,
            server = %negotiated.server_info.name,
            kinds = ?negotiated.kinds,
            "handshake complete"
        );
        Ok(Arc::new(negotiated))
    }

    async fn begin(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<PendingCall> {
        let timeout = timeout.unwrap_or(self.settings.request_timeout);
        let mut flush_now = false;
        let mut start_window = false;

        let (id, rx) = {
            let mut session = self.lock();
            let state = session.state;
            match state {
                ConnectionState::Ready => {
                    let (id, rx) = session.table.register(method, params, timeout, Instant::now());
                    let waiting = session.table.push_outbox(id);
                    if self.settings.batch.is_full(waiting) {
                        flush_now = true;
                    } else if session.table.schedule_flush() {
                        start_window = true;
                    }
                    (id, rx)
                }
                ConnectionState::Degraded => {
                    if session.table.queued_len() >= self.settings.queue_capacity {
                        return Err(CapwireError::Overloaded {
                            capacity: self.settings.queue_capacity,
                        }
                        .into());
                    }
                    let (id, rx) = session.table.register(method, params, timeout, Instant::now());
                    let depth = session.table.push_queued(id);
                    tracing::debug!(id, depth, "queued request while degraded");
                    (id, rx)
                }
                other => return Err(CapwireError::NotConnected(other.to_string()).into()),
            }
        };

        let call = PendingCall::new(self, id, method, timeout, rx);
        if flush_now {
            self.flush().await;
        } else if start_window {
            let inner = Arc::clone(self);
            let window = self.settings.batch.window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                inner.flush().await;
            });
        }
        Ok(call)
    }

    /// Drain the outbox in batches of at most `max_size`.
    async fn flush(self: &Arc<Self>) {
        let _send = self.send_lock.lock().await;
        loop {
            let batch = {
                let mut session = self.lock();
                session.table.clear_flush_schedule();
                if session.state != ConnectionState::Ready {
                    return;
                }
                let generation = session.generation;
                session
                    .table
                    .take_outbox(self.settings.batch.max_size, generation)
            };
            if batch.is_empty() {
                return;
            }
            if let Err(e) = self.transmit(&batch).await {
                tracing::warn!(count = batch.len(), "batch send failed: {:#}", e);
                let ids: Vec<u64> = batch.iter().map(|(id, _)| *id).collect();
                self.lock().table.requeue_front(&ids);
                let _ = self.trigger_reconnect("send failed");
                return;
            }
        }
    }

    async fn transmit(&self, batch: &[(u64, Envelope)]) -> Result<()> {
        let envelopes: Vec<Envelope> = batch.iter().map(|(_, e)| e.clone()).collect();
        let frame = self.codec.encode_batch(&envelopes)?;
        tracing::debug!(count = envelopes.len(), "sending frame");
        self.transport.send(frame).await
    }

    /// Bypass the queues: used for the handshake and heartbeat probes.
    async fn request_direct(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.send_direct(method, params, timeout, false).await
    }

    async fn send_direct(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        timeout: Duration,
        handshake: bool,
    ) -> Result<Value> {
        let (id, rx, envelope) = {
            let mut session = self.lock();
            let generation = session.generation;
            let (id, rx) = session.table.register(method, params, timeout, Instant::now());
            let envelope = session.table.mark_transmitted(id, generation);
            if handshake {
                session.handshake_id = Some(id);
            }
            (id, rx, envelope)
        };
        let call = PendingCall::new(self, id, method, timeout, rx);
        let Some(envelope) = envelope else {
            return Err(CapwireError::ProtocolAnomaly(format!("request {} vanished", id)).into());
        };

        self.transport.send(self.codec.encode(&envelope)?).await?;
        let outcome = call.wait().await;
        if handshake {
            let mut session = self.lock();
            if session.handshake_id == Some(id) {
                session.handshake_id = None;
            }
        }
        outcome
    }

    fn spawn_read_loop(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        let transport = Arc::clone(&self.transport);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut frames = transport.receive();
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = frames.next() => frame,
                };
                let Some(inner) = weak.upgrade() else { return };
                match frame {
                    Some(raw) => inner.handle_frame(&raw).await,
                    None => {
                        inner.on_stream_end(generation);
                        return;
                    }
                }
            }
        });
    }

    async fn handle_frame(&self, raw: &str) {
        let entries = match self.codec.decode_entries(raw) {
            Ok(entries) => entries,
            Err(e) => {
                self.anomaly(format!("dropped inbound frame: {}", e));
                return;
            }
        };
        for entry in entries {
            let envelope = match entry {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.anomaly(format!("dropped inbound envelope: {}", e));
                    continue;
                }
            };
            match envelope.kind() {
                EnvelopeKind::Response => {
                    let id = envelope.id.clone();
                    let resolution = self.lock().table.resolve(envelope);
                    match resolution {
                        Resolution::Matched => {}
                        Resolution::Abandoned => {
                            tracing::debug!(?id, "discarded response for cancelled request")
                        }
                        Resolution::Unknown => {
                            self.anomaly(format!("response for unknown id {:?}", id))
                        }
                    }
                }
                EnvelopeKind::Request => self.answer_peer_request(envelope).await,
                EnvelopeKind::Notification => self.handle_notification(&envelope),
            }
        }
    }

    /// Providers may probe us too. Anything but `ping` is refused.
    async fn answer_peer_request(&self, request: Envelope) {
        let method = request.method.clone().unwrap_or_default();
        let reply = if method == METHOD_PING {
            Envelope::success(request.id, json!({}))
        } else {
            tracing::debug!(%method, "refusing provider request");
            Envelope::failure(
                request.id,
                RpcError {
                    code: ERROR_METHOD_NOT_FOUND,
                    message: format!("Method not found: {}", method),
                    data: None,
                },
            )
        };
        match self.codec.encode(&reply) {
            Ok(frame) => {
                if let Err(e) = self.transport.send(frame).await {
                    tracing::debug!("failed to answer provider request: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to encode reply: {}", e),
        }
    }

    fn handle_notification(&self, notification: &Envelope) {
        let method = notification.method.as_deref().unwrap_or_default();
        let kinds = match method {
            NOTIF_TOOLS_LIST_CHANGED => vec![CapabilityKind::Operation],
            NOTIF_RESOURCES_LIST_CHANGED => {
                vec![CapabilityKind::Resource, CapabilityKind::Template]
            }
            NOTIF_PROMPTS_LIST_CHANGED => Vec::new(),
            _ => {
                tracing::debug!(%method, "ignoring notification");
                return;
            }
        };
        tracing::info!(%method, "capability list changed");
        let _ = self
            .events
            .send(ConnectionEvent::CapabilityListChanged { kinds });
    }

    fn on_stream_end(self: &Arc<Self>, generation: u64) {
        let state = {
            let mut session = self.lock();
            if session.generation != generation {
                return;
            }
            if let Some(id) = session.handshake_id.take() {
                session.table.cancel(
                    id,
                    CapwireError::ConnectionLost("transport closed during handshake".into()),
                );
            }
            session.state
        };
        tracing::debug!(generation, %state, "inbound stream ended");
        if state == ConnectionState::Ready {
            let _ = self.trigger_reconnect("transport closed");
        }
    }

    /// Start recovery, or join the one already running.
    fn trigger_reconnect(self: &Arc<Self>, reason: &str) -> Option<ReconnectFuture> {
        let mut session = self.lock();
        if let Some(running) = &session.reconnect {
            return Some(running.clone());
        }
        if session.state != ConnectionState::Ready {
            return None;
        }

        tracing::warn!(reason, "connection degraded, starting recovery");
        self.transition(&mut session, ConnectionState::Degraded);
        session.table.demote_outbox();
        let replay = self.settings.replay_policy == ReplayPolicy::Replay;
        let next = session.generation + 1;
        let settled = session.table.settle_in_flight(next, replay, reason);
        if settled > 0 {
            tracing::info!(settled, replay, "settled in-flight requests");
        }

        let inner = Arc::clone(self);
        let run: BoxFuture<'static, ReconnectOutcome> =
            async move { inner.run_reconnect().await }.boxed();
        let run = run.shared();
        session.reconnect = Some(run.clone());
        drop(session);

        tokio::spawn(run.clone());
        Some(run)
    }

    async fn run_reconnect(self: Arc<Self>) -> ReconnectOutcome {
        let policy = self.settings.reconnect.clone();
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect attempt scheduled");
            tokio::select! {
                _ = self.cancel.cancelled() => return self.finish_reconnect(ReconnectOutcome::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
            if self.state() != ConnectionState::Degraded {
                return self.finish_reconnect(ReconnectOutcome::Closed);
            }

            let _ = self.transport.close().await;
            let opened =
                tokio::time::timeout(self.settings.connect_timeout, self.transport.connect()).await;
            match opened {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(attempt, "reconnect failed: {:#}", e);
                    last_error = e.to_string();
                    continue;
                }
                Err(_) => {
                    tracing::warn!(attempt, "reconnect timed out");
                    last_error = "connect timed out".into();
                    continue;
                }
            }

            let generation = {
                let mut session = self.lock();
                session.generation += 1;
                session.generation
            };
            self.spawn_read_loop(generation);

            match self.negotiate().await {
                Ok(negotiated) => {
                    if self.resume(negotiated, generation).await {
                        tracing::info!(attempt, generation, "connection recovered");
                        return self.finish_reconnect(ReconnectOutcome::Recovered);
                    }
                    last_error = "connection lost while draining queue".into();
                }
                Err(e) => {
                    let fatal = matches!(
                        classify(&e),
                        Some(CapwireError::ProtocolVersionMismatch { .. })
                            | Some(CapwireError::NegotiationFailed(_))
                    );
                    if fatal {
                        tracing::error!("renegotiation rejected: {:#}", e);
                        self.terminate(&format!("renegotiation rejected: {}", e)).await;
                        return self.finish_reconnect(ReconnectOutcome::Closed);
                    }
                    if self.state() != ConnectionState::Degraded {
                        return self.finish_reconnect(ReconnectOutcome::Closed);
                    }
                    tracing::warn!(attempt, "renegotiation failed: {:#}", e);
                    last_error = e.to_string();
                }
            }
        }

        tracing::error!(
            attempts = policy.max_attempts,
            "giving up on reconnect: {}",
            last_error
        );
        self.terminate(&format!(
            "reconnect failed after {} attempts: {}",
            policy.max_attempts, last_error
        ))
        .await;
        self.finish_reconnect(ReconnectOutcome::Closed)
    }

    fn finish_reconnect(&self, outcome: ReconnectOutcome) -> ReconnectOutcome {
        self.lock().reconnect = None;
        outcome
    }

    /// Drain the recovery queue on a fresh connection, oldest first, then
    /// become `Ready`. Returns `false` if the connection failed again.
    async fn resume(&self, negotiated: Arc<NegotiatedCapabilities>, generation: u64) -> bool {
        {
            let mut session = self.lock();
            session.negotiated = Some(negotiated);
            let replay = self.settings.replay_policy == ReplayPolicy::Replay;
            session
                .table
                .settle_in_flight(generation, replay, "connection lost during recovery");
        }

        let _send = self.send_lock.lock().await;
        loop {
            let batch = {
                let mut session = self.lock();
                if session.generation != generation || session.state != ConnectionState::Degraded {
                    return false;
                }
                let batch = session
                    .table
                    .take_queued(self.settings.batch.max_size, generation);
                if batch.is_empty() {
                    self.heartbeat.record_success();
                    self.transition(&mut session, ConnectionState::Ready);
                    return true;
                }
                batch
            };
            if let Err(e) = self.transmit(&batch).await {
                tracing::warn!(count = batch.len(), "replaying queue failed: {:#}", e);
                let ids: Vec<u64> = batch.iter().map(|(id, _)| *id).collect();
                self.lock().table.requeue_front(&ids);
                return false;
            }
        }
    }

    /// Stop everything and fail whatever is still pending.
    async fn terminate(&self, reason: &str) {
        self.cancel.cancel();
        if let Err(e) = self.transport.close().await {
            tracing::debug!("transport close failed: {}", e);
        }
        let mut session = self.lock();
        let failed = session.table.fail_all(reason);
        session.negotiated = None;
        session.handshake_id = None;
        self.transition(&mut session, ConnectionState::Closed);
        if failed > 0 {
            tracing::info!(failed, reason, "failed pending requests");
        }
    }
}

/// Guard that cancels its request if the waiter goes away first.
struct CancelOnDrop {
    inner: Weak<ConnectionInner>,
    id: u64,
    armed: bool,
}

impl CancelOnDrop {
    /// Resolve the entry with `error`. Returns `false` if it had already
    /// resolved some other way.
    fn fire(&mut self, error: CapwireError) -> bool {
        self.armed = false;
        match self.inner.upgrade() {
            Some(inner) => inner.lock().table.cancel(self.id, error),
            None => false,
        }
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let id = self.id;
            self.fire(CapwireError::Cancelled(id));
        }
    }
}

/// A request that has been accepted by the manager.
///
/// Dropping it before it resolves cancels the request.
pub struct PendingCall {
    id: u64,
    method: String,
    timeout: Duration,
    rx: oneshot::Receiver<Outcome>,
    guard: CancelOnDrop,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish()
    }
}

impl PendingCall {
    fn new(
        inner: &Arc<ConnectionInner>,
        id: u64,
        method: &str,
        timeout: Duration,
        rx: oneshot::Receiver<Outcome>,
    ) -> Self {
        Self {
            id,
            method: method.to_string(),
            timeout,
            rx,
            guard: CancelOnDrop {
                inner: Arc::downgrade(inner),
                id,
                armed: true,
            },
        }
    }

    /// Correlation id of the request.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(self) -> Result<Value> {
        self.wait_with(None).await
    }

    /// Wait for the outcome, the deadline, or `cancel`, whichever is first.
    pub async fn wait_with(self, cancel: Option<CancellationToken>) -> Result<Value> {
        let PendingCall {
            id,
            method,
            timeout,
            mut rx,
            mut guard,
        } = self;

        let cancelled = async {
            match &cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let error = tokio::select! {
            outcome = tokio::time::timeout(timeout, &mut rx) => match outcome {
                Ok(Ok(outcome)) => {
                    guard.armed = false;
                    return outcome.map_err(Into::into);
                }
                Ok(Err(_)) => {
                    guard.armed = false;
                    return Err(CapwireError::ConnectionLost("connection dropped".into()).into());
                }
                Err(_) => CapwireError::Timeout {
                    method: method.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                },
            },
            _ = cancelled => CapwireError::Cancelled(id),
        };

        let retry = match &error {
            CapwireError::Timeout { method, timeout_ms } => CapwireError::Timeout {
                method: method.clone(),
                timeout_ms: *timeout_ms,
            },
            _ => CapwireError::Cancelled(id),
        };
        if guard.fire(error) {
            return Err(retry.into());
        }
        // Lost the race: the real outcome is already in the channel.
        match rx.try_recv() {
            Ok(outcome) => outcome.map_err(Into::into),
            Err(_) => Err(retry.into()),
        }
    }
}
