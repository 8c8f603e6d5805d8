//! Pipe transport for child-process providers
//!
//! [`StdioTransport`] spawns a child process on `connect` and exchanges
//! newline-delimited JSON with it:
//!
//! - Outbound frames are written to the child's stdin followed by `\n`.
//! - Inbound frames are read from the child's stdout, one per line.
//! - The child's stderr is logged at `DEBUG` and never treated as an error.
//!
//! `close` kills the child; dropping the transport does the same because
//! the child is spawned with `kill_on_drop`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::error::{CapwireError, Result};
use crate::transport::{inbox_stream, Inbox, Transport, TransportKind};

/// How to launch the provider process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioConfig {
    /// Program to execute.
    pub executable: PathBuf,
    /// Command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables, applied on top of the inherited ones.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl StdioConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug)]
struct Session {
    stdin_tx: mpsc::UnboundedSender<String>,
    stdout_rx: Inbox,
    child: Child,
}

/// Pipe transport driving a child process.
///
/// # Examples
///
/// ```no_run
/// use capwire::transport::stdio::{StdioConfig, StdioTransport};
///
/// let transport = StdioTransport::new(
///     StdioConfig::new("npx").with_args(["-y", "@modelcontextprotocol/server-everything"]),
/// );
/// ```
#[derive(Debug)]
pub struct StdioTransport {
    config: StdioConfig,
    session: StdMutex<Option<Session>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            session: StdMutex::new(None),
        }
    }

    fn spawn(&self) -> Result<Session> {
        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            CapwireError::Connect(format!(
                "failed to spawn provider `{}`: {}",
                self.config.executable.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CapwireError::Connect("child stdin unavailable after spawn".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapwireError::Connect("child stdout unavailable after spawn".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CapwireError::Connect("child stderr unavailable after spawn".into()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = stdin_rx.recv().await {
                let line = format!("{}\n", frame);
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if stdout_tx.send(line.to_string()).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "capwire::transport::stdio", "provider stderr: {}", line);
            }
        });

        Ok(Session {
            stdin_tx,
            stdout_rx: Arc::new(Mutex::new(stdout_rx)),
            child,
        })
    }

    fn take_session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<()> {
        let session = self.spawn()?;
        tracing::debug!(
            executable = %self.config.executable.display(),
            pid = ?session.child.id(),
            "spawned provider process"
        );
        let previous = self
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(session);
        if let Some(mut old) = previous {
            let _ = old.child.start_kill();
        }
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<()> {
        let guard = self.session.lock().unwrap_or_else(|p| p.into_inner());
        let session = guard
            .as_ref()
            .ok_or_else(|| CapwireError::Transport("pipe transport is not connected".into()))?;
        session
            .stdin_tx
            .send(frame)
            .map_err(|e| CapwireError::Transport(format!("stdin channel closed: {}", e)))?;
        Ok(())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let inbox = self
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|s| Arc::clone(&s.stdout_rx));
        inbox_stream(inbox)
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut session) = self.take_session() {
            if let Err(e) = session.child.start_kill() {
                tracing::debug!("provider process already gone: {}", e);
            }
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }
}
