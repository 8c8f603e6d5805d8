//! TCP socket transport
//!
//! [`SocketTransport`] connects to a provider listening on a TCP address
//! and exchanges newline-delimited JSON, one frame per line, the same
//! framing the pipe transport uses.

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{CapwireError, Result};
use crate::transport::{inbox_stream, Inbox, Transport, TransportKind};

#[derive(Debug)]
struct Session {
    writer_tx: mpsc::UnboundedSender<String>,
    inbox: Inbox,
    cancel: CancellationToken,
}

/// Newline-delimited JSON over TCP.
#[derive(Debug)]
pub struct SocketTransport {
    address: String,
    connect_timeout: Duration,
    session: StdMutex<Option<Session>>,
}

impl SocketTransport {
    /// `address` is anything `TcpStream::connect` accepts, e.g.
    /// `"127.0.0.1:7000"`.
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            session: StdMutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait::async_trait]
impl Transport for SocketTransport {
    async fn connect(&self) -> Result<()> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                CapwireError::Connect(format!(
                    "timed out connecting to {} after {}ms",
                    self.address,
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| CapwireError::Connect(format!("failed to connect to {}: {}", self.address, e)))?;
        stream.set_nodelay(true).ok();

        let (read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = writer_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let line = format!("{}\n", frame);
                        if let Err(e) = write_half.write_all(line.as_bytes()).await {
                            tracing::debug!("socket write failed: {}", e);
                            break;
                        }
                    }
                }
            }
            let _ = write_half.shutdown().await;
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            if inbound_tx.send(line.to_string()).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!("socket read failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        let previous = self
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(Session {
                writer_tx,
                inbox: Arc::new(Mutex::new(inbound_rx)),
                cancel,
            });
        if let Some(old) = previous {
            old.cancel.cancel();
        }
        tracing::debug!(address = %self.address, "socket transport connected");
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<()> {
        let tx = self
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|s| s.writer_tx.clone())
            .ok_or_else(|| CapwireError::Transport("socket transport is not connected".into()))?;
        tx.send(frame)
            .map_err(|_| CapwireError::Transport("socket writer has shut down".into()))?;
        Ok(())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let inbox = self
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|s| Arc::clone(&s.inbox));
        inbox_stream(inbox)
    }

    async fn close(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(session) = session {
            session.cancel.cancel();
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }
}
