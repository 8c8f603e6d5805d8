//! Event-stream transport over HTTP
//!
//! [`HttpTransport`] sends every outbound frame as an HTTP POST. The
//! provider may reply with:
//!
//! - `application/json`: a direct response body, forwarded as one frame
//! - `text/event-stream`: an SSE stream whose `data:` events are frames
//! - `202 Accepted`: an acknowledgement with no body (notifications)
//!
//! # Session management
//!
//! A provider MAY return a session id header (`MCP-Session-Id`). It is
//! stored and echoed on every later request until `connect` or `close`
//! resets it. A `404` while a session is active means the session expired;
//! the id is cleared and the send fails with a transport error, which the
//! connection manager treats like any other transport loss.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::error::{CapwireError, Result};
use crate::transport::{inbox_stream, Inbox, Transport, TransportKind};
use crate::types::LATEST_PROTOCOL_VERSION;

/// Header carrying the provider-assigned session id.
pub const SESSION_HEADER: &str = "MCP-Session-Id";
/// Header carrying the protocol revision on every POST.
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

#[derive(Debug)]
struct Channel {
    tx: mpsc::UnboundedSender<String>,
    rx: Inbox,
}

/// HTTP POST + SSE transport.
///
/// # Examples
///
/// ```no_run
/// use std::collections::HashMap;
/// use std::time::Duration;
/// use capwire::transport::http::HttpTransport;
///
/// # fn main() -> anyhow::Result<()> {
/// let transport = HttpTransport::new(
///     url::Url::parse("http://localhost:3000/mcp")?,
///     HashMap::new(),
///     Duration::from_secs(30),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    endpoint: url::Url,
    /// Extra headers merged into every request (e.g. Authorization).
    headers: HashMap<String, String>,
    session_id: Arc<RwLock<Option<String>>>,
    /// Last SSE event id, sent back as `Last-Event-ID`.
    last_event_id: Arc<RwLock<Option<String>>>,
    channel: StdMutex<Option<Channel>>,
}

impl HttpTransport {
    /// Build a transport targeting `endpoint`. No network I/O happens until
    /// the first `send`.
    ///
    /// # Errors
    ///
    /// Returns [`CapwireError::Config`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: url::Url,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CapwireError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint,
            headers,
            session_id: Arc::new(RwLock::new(None)),
            last_event_id: Arc::new(RwLock::new(None)),
            channel: StdMutex::new(None),
        })
    }

    /// Current session id, if the provider assigned one.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<String>> {
        self.channel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|c| c.tx.clone())
            .ok_or_else(|| CapwireError::Transport("event-stream transport is not connected".into()).into())
    }

    async fn decorate(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(id) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, id);
        }
        if let Some(id) = self.last_event_id.read().await.as_deref() {
            req = req.header("Last-Event-ID", id);
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.channel.lock().unwrap_or_else(|p| p.into_inner()) = Some(Channel {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        });
        *self.session_id.write().await = None;
        *self.last_event_id.write().await = None;
        tracing::debug!(endpoint = %self.endpoint, "event-stream transport ready");
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<()> {
        let response_tx = self.sender()?;

        let req = self
            .http_client
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header(PROTOCOL_VERSION_HEADER, LATEST_PROTOCOL_VERSION)
            .body(frame);
        let req = self.decorate(req).await;

        let response = req
            .send()
            .await
            .map_err(|e| CapwireError::Transport(format!("HTTP POST failed: {}", e)))?;

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(CapwireError::Transport(format!("unauthorized: {}", challenge)).into());
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            let mut sid = self.session_id.write().await;
            if sid.take().is_some() {
                return Err(CapwireError::Transport("session expired".into()).into());
            }
            return Err(CapwireError::Transport("HTTP 404 Not Found".into()).into());
        }

        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        if !status.is_success() {
            return Err(
                CapwireError::Transport(format!("HTTP POST returned status {}", status)).into(),
            );
        }

        if let Some(new_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
        {
            let mut sid = self.session_id.write().await;
            if sid.is_none() {
                tracing::debug!(session = %new_id, "provider assigned session");
                *sid = Some(new_id);
            }
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let byte_stream = response.bytes_stream();
            let last_event_id = Arc::clone(&self.last_event_id);
            tokio::spawn(async move {
                forward_sse(byte_stream, response_tx, last_event_id).await;
            });
        } else {
            let body = response
                .text()
                .await
                .map_err(|e| CapwireError::Transport(format!("failed to read response body: {}", e)))?;
            if !body.trim().is_empty() {
                let _ = response_tx.send(body);
            }
        }

        Ok(())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let inbox = self
            .channel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|c| Arc::clone(&c.rx));
        inbox_stream(inbox)
    }

    async fn close(&self) -> Result<()> {
        let had_channel = self
            .channel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .is_some();
        let session = self.session_id.write().await.take();

        // Session termination is best-effort.
        if let (true, Some(sid)) = (had_channel, session) {
            let mut req = self
                .http_client
                .delete(self.endpoint.as_str())
                .header(SESSION_HEADER, sid.as_str());
            for (k, v) in &self.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Err(e) = req.send().await {
                tracing::debug!("session DELETE failed: {}", e);
            }
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }
}

// ---------------------------------------------------------------------------
// Event-stream decoding
// ---------------------------------------------------------------------------

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// `event: ping`, `data: [PING]` and data-less events carry no frame.
    pub fn is_keepalive(&self) -> bool {
        self.event
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case("ping"))
            || self.data.is_empty()
            || self.data.eq_ignore_ascii_case("[ping]")
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Chunks may split anywhere, including inside a UTF-8 sequence; bytes are
/// only decoded once a whole event block has arrived.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    /// Prefix of `pending` already searched for a blank line.
    scanned: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        let mut start = 0;
        // Back up one byte: the separator may straddle two chunks.
        let mut from = self.scanned.saturating_sub(1);
        while let Some(offset) = self.pending[from..].windows(2).position(|w| w == b"\n\n") {
            let end = from + offset;
            events.extend(parse_block(&String::from_utf8_lossy(&self.pending[start..end])));
            start = end + 2;
            from = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();
        events
    }

    /// The trailing event of a stream that ended without a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.pending);
        self.scanned = 0;
        parse_block(&String::from_utf8_lossy(&rest))
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    if block.trim().is_empty() {
        return None;
    }
    let mut event = SseEvent::default();
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "data" => data.push(value),
            "id" => event.id = Some(value.to_string()),
            "event" => event.event = Some(value.to_string()),
            // `retry` and comment lines (empty field name)
            _ => {}
        }
    }
    event.data = data.join("\n");
    Some(event)
}

/// Decode an event-stream body and forward each frame to `frames`.
///
/// Runs until the body ends or fails, or the receiver goes away. Event ids
/// are recorded in `last_event_id`; keep-alives are dropped.
pub async fn forward_sse(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    frames: mpsc::UnboundedSender<String>,
    last_event_id: Arc<RwLock<Option<String>>>,
) {
    use futures::StreamExt;

    tokio::pin!(byte_stream);
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!("event stream interrupted: {}", e);
                break;
            }
        };
        for event in decoder.push(&chunk) {
            if !deliver(event, &frames, &last_event_id).await {
                return;
            }
        }
    }

    if let Some(event) = decoder.finish() {
        deliver(event, &frames, &last_event_id).await;
    }
}

async fn deliver(
    event: SseEvent,
    frames: &mpsc::UnboundedSender<String>,
    last_event_id: &RwLock<Option<String>>,
) -> bool {
    if let Some(id) = &event.id {
        *last_event_id.write().await = Some(id.clone());
    }
    if event.is_keepalive() {
        return true;
    }
    frames.send(event.data).is_ok()
}
