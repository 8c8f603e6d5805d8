//! In-process fake transport for tests
//!
//! [`FakeTransport::new`] returns a `(FakeTransport, FakeTransportHandle)`
//! pair. Wire the transport into the code under test and drive the provider
//! side from the handle:
//!
//! ```text
//! client send() ------> outbound channel ------> handle.next_outbound()
//! control.inject() ---> per-connection inbox --> client receive()
//! ```
//!
//! Every successful `connect` opens a fresh inbox, so a forced
//! [`FakeControl::drop_connection`] ends the client's receive stream just
//! like a real disconnect. Connect failures can be scripted with
//! [`FakeControl::fail_next_connects`].
//!
//! # Example
//!
//! ```
//! use capwire::transport::fake::FakeTransport;
//! use capwire::transport::Transport;
//! use futures::StreamExt;
//!
//! # tokio_test::block_on(async {
//! let (transport, mut handle) = FakeTransport::new();
//! transport.connect().await.unwrap();
//!
//! transport.send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string()).await.unwrap();
//! assert!(handle.next_outbound().await.unwrap().contains("ping"));
//!
//! handle.control().inject_raw(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
//! let received = transport.receive().next().await.unwrap();
//! assert!(received.contains("result"));
//! # });
//! ```

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use futures::Stream;
use tokio::sync::{mpsc, Mutex};

use crate::error::{CapwireError, Result};
use crate::transport::{inbox_stream, Inbox, Transport, TransportKind};

#[derive(Debug, Default)]
struct FakeState {
    inbound_tx: Option<mpsc::UnboundedSender<String>>,
    inbox: Option<Inbox>,
    fail_connects: u32,
    fail_sends: u32,
    connect_attempts: u32,
}

impl FakeState {
    fn disconnect(&mut self) {
        self.inbound_tx = None;
        self.inbox = None;
    }
}

/// Channel-backed [`Transport`] for tests.
#[derive(Debug)]
pub struct FakeTransport {
    outbound_tx: mpsc::UnboundedSender<String>,
    state: Arc<StdMutex<FakeState>>,
}

/// Test-side end of a [`FakeTransport`].
#[derive(Debug)]
pub struct FakeTransportHandle {
    outbound_rx: mpsc::UnboundedReceiver<String>,
    control: FakeControl,
}

/// Cloneable provider-side controls: inject frames, force disconnects and
/// script connect failures.
#[derive(Debug, Clone)]
pub struct FakeControl {
    state: Arc<StdMutex<FakeState>>,
}

impl FakeTransport {
    /// Create a transport and the handle that plays the provider.
    pub fn new() -> (Self, FakeTransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let state = Arc::new(StdMutex::new(FakeState::default()));
        let transport = Self {
            outbound_tx,
            state: Arc::clone(&state),
        };
        let handle = FakeTransportHandle {
            outbound_rx,
            control: FakeControl { state },
        };
        (transport, handle)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<()> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(CapwireError::Connect("scripted connect failure".into()).into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound_tx = Some(tx);
        state.inbox = Some(Arc::new(Mutex::new(rx)));
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<()> {
        {
            let mut state = self.lock();
            if state.inbound_tx.is_none() {
                return Err(CapwireError::Transport("fake transport is not connected".into()).into());
            }
            if state.fail_sends > 0 {
                state.fail_sends -= 1;
                return Err(CapwireError::Transport("scripted send failure".into()).into());
            }
        }
        self.outbound_tx
            .send(frame)
            .map_err(|_| CapwireError::Transport("fake transport handle dropped".into()))?;
        Ok(())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let inbox = self.lock().inbox.clone();
        inbox_stream(inbox)
    }

    async fn close(&self) -> Result<()> {
        self.lock().disconnect();
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }
}

impl FakeTransportHandle {
    /// Wait for the next frame the client sent.
    pub async fn next_outbound(&mut self) -> Option<String> {
        self.outbound_rx.recv().await
    }

    /// Next sent frame, if one is already buffered.
    pub fn try_next_outbound(&mut self) -> Option<String> {
        self.outbound_rx.try_recv().ok()
    }

    /// Every frame sent so far that has not been read yet.
    pub fn drain_outbound(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound_rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn control(&self) -> FakeControl {
        self.control.clone()
    }
}

impl FakeControl {
    /// Deliver a JSON value to the client. Returns `false` if the transport
    /// is not connected.
    pub fn inject(&self, value: serde_json::Value) -> bool {
        self.inject_raw(value.to_string())
    }

    /// Deliver raw text to the client. Returns `false` if the transport is
    /// not connected.
    pub fn inject_raw(&self, frame: impl Into<String>) -> bool {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match &state.inbound_tx {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Simulate the provider going away: the client's receive stream ends
    /// and further sends fail until the next successful `connect`.
    pub fn drop_connection(&self) {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .disconnect();
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).fail_connects = n;
    }

    /// Make the next `n` sends fail while connected.
    pub fn fail_next_sends(&self, n: u32) {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).fail_sends = n;
    }

    /// How many times `connect` has been called, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .connect_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .inbound_tx
            .is_some()
    }
}
