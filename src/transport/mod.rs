//! Transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that every transport must
//! satisfy. Concrete implementations live in submodules:
//!
//! - [`stdio::StdioTransport`] spawns a child process and exchanges
//!   newline-delimited JSON over its stdin/stdout pipes.
//! - [`http::HttpTransport`] posts each frame over HTTP and reads replies
//!   from JSON bodies or server-sent event streams.
//! - [`socket::SocketTransport`] speaks newline-delimited JSON over TCP.
//! - [`fake::FakeTransport`] is an in-process channel pair for tests.
//!
//! # Design
//!
//! A transport is an opaque duplex of complete text frames. It carries no
//! retry logic: the connection manager decides when to `close` and
//! `connect` again. Each successful `connect` opens a fresh inbound stream;
//! [`Transport::receive`] returns the stream of the connection that is
//! current at call time and that stream ends when the connection does.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;

pub mod fake;
pub mod http;
pub mod socket;
pub mod stdio;

/// Which family a transport belongs to. Used in log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Child process stdin/stdout.
    Pipe,
    /// HTTP POST plus server-sent events.
    EventStream,
    /// TCP socket.
    Socket,
    /// In-process channels.
    InProcess,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Pipe => "pipe",
            TransportKind::EventStream => "event-stream",
            TransportKind::Socket => "socket",
            TransportKind::InProcess => "in-process",
        };
        f.write_str(s)
    }
}

/// Abstraction over the message duplex to a provider.
///
/// Used polymorphically through `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Open the underlying channel.
    ///
    /// Calling `connect` on an open transport replaces the previous
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CapwireError::Connect`] if the channel cannot
    /// be opened.
    async fn connect(&self) -> Result<()>;

    /// Send one complete frame (a single JSON object or a JSON array).
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CapwireError::Transport`] if the transport is
    /// not connected or the underlying write fails.
    async fn send(&self, frame: String) -> Result<()>;

    /// Returns the stream of inbound frames for the current connection.
    ///
    /// The stream is lazy and unbounded, ends when the connection closes,
    /// and cannot be restarted. Calling `receive` before `connect` yields an
    /// empty stream.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>>;

    /// Close the channel. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Transport family.
    fn kind(&self) -> TransportKind;
}

/// Shared receiver end of one connection's inbound frames.
pub(crate) type Inbox = Arc<Mutex<mpsc::UnboundedReceiver<String>>>;

/// Wrap a connection's inbox as a frame stream; `None` yields an empty
/// stream.
pub(crate) fn inbox_stream(
    inbox: Option<Inbox>,
) -> Pin<Box<dyn Stream<Item = String> + Send + 'static>> {
    match inbox {
        Some(rx) => Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        })),
        None => Box::pin(futures::stream::empty()),
    }
}
