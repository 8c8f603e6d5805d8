//! capwire - resilient capability-protocol client runtime
//!
//! This library connects to a remote capability provider over an
//! interchangeable transport, negotiates protocol capabilities, and exposes
//! discovery and invocation of operations, resources and templates with
//! caching, validation, batching and connection recovery.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `transport`: the message duplex and its pipe, event-stream, socket and
//!   in-process implementations
//! - `codec`: JSON-RPC envelope encoding, decoding and fingerprints
//! - `connection`: lifecycle state machine, heartbeat and reconnection
//! - `negotiator`: handshake, capability registry and URI templates
//! - `correlator`: correlation ids, pending requests and batching
//! - `cache`: TTL-classed result cache
//! - `validation`: argument validation and content sanitizing
//! - `access`: permission, rate limit and quota checks
//! - `executor`: the discovery, read and call pipeline
//! - `config`, `error`, `logging`, `types`: supporting pieces
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use capwire::transport::stdio::{StdioConfig, StdioTransport};
//! use capwire::{Config, ConnectionManager, InvocationExecutor};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("capwire.yaml")?;
//!     let transport = StdioTransport::new(StdioConfig::new("my-provider"));
//!     let connection = ConnectionManager::new(Arc::new(transport), &config);
//!     let executor = InvocationExecutor::new(connection, &config);
//!
//!     executor.connect().await?;
//!     let result = executor.call("search", json!({ "query": "rust" })).await?;
//!     println!("{:?}", result.content);
//!     executor.close().await?;
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod executor;
pub mod logging;
pub mod negotiator;
pub mod transport;
pub mod types;
pub mod validation;

// Re-export commonly used types
pub use config::Config;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::{classify, CapwireError, Result};
pub use executor::{CallOptions, InvocationExecutor, ReadRange, ReadResult};
pub use negotiator::NegotiatedCapabilities;
pub use transport::Transport;
pub use types::{Capability, CapabilityKind};
