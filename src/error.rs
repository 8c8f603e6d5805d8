//! Error types for capwire
//!
//! This module defines the error taxonomy shared by every layer of the
//! runtime, using `thiserror` for ergonomic error handling. Fallible
//! functions return [`Result`], an `anyhow` alias; callers classify a
//! failure by downcasting to [`CapwireError`] (see [`classify`]).

use thiserror::Error;

use crate::validation::Violation;

/// Main error type for capwire operations
///
/// Local policy errors (`Validation`, `PermissionDenied`, `RateLimited`,
/// `QuotaExceeded`, `UnsupportedCapability`) are raised before anything is
/// written to the wire. Connection-level errors are absorbed by the
/// connection manager and only surface as the terminal outcome of a
/// specific request.
#[derive(Error, Debug)]
pub enum CapwireError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The transport could not be opened
    #[error("Connect error: {0}")]
    Connect(String),

    /// The transport failed while sending or receiving
    #[error("Transport error: {0}")]
    Transport(String),

    /// An outbound envelope violated the envelope invariant
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// An inbound frame was not a well-formed envelope or batch
    #[error("Decode error: {0}")]
    Decode(String),

    /// The peer used a protocol version this client does not speak
    #[error("Protocol version mismatch: expected one of {expected:?}, got {got}")]
    ProtocolVersionMismatch {
        /// Versions accepted locally
        expected: Vec<String>,
        /// Version received from the peer
        got: String,
    },

    /// The handshake was rejected; the connection is closed for good
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The capability kind was not part of the negotiated set
    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// No capability with this name is known to the provider
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// One or more arguments failed schema validation
    #[error("Validation failed for `{capability}`: {}", format_violations(.violations))]
    Validation {
        /// Capability the arguments were meant for
        capability: String,
        /// Every violation found, in schema order
        violations: Vec<Violation>,
    },

    /// The subject is not allowed to use the capability
    #[error("Permission denied: subject `{subject}` may not use `{capability}`")]
    PermissionDenied {
        /// Subject from the access policy
        subject: String,
        /// Capability that was requested
        capability: String,
    },

    /// Rate limit exceeded for a capability
    #[error("Rate limit exceeded for `{capability}`: limit={limit} per {window_ms}ms")]
    RateLimited {
        /// Capability that was requested
        capability: String,
        /// Maximum calls per window
        limit: u32,
        /// Window length in milliseconds
        window_ms: u64,
    },

    /// Quota exhausted for the current period
    #[error("Quota exceeded for `{capability}`: limit={limit} per period")]
    QuotaExceeded {
        /// Capability that was requested
        capability: String,
        /// Maximum calls per quota period
        limit: u64,
    },

    /// No response arrived before the request deadline
    #[error("Request timeout: method={method} after {timeout_ms}ms")]
    Timeout {
        /// Method of the timed-out request
        method: String,
        /// Deadline that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// The connection was lost and could not be recovered for this request
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The outgoing queue is full while the connection is degraded
    #[error("Overloaded: degraded queue is full (capacity={capacity})")]
    Overloaded {
        /// Configured queue capacity
        capacity: usize,
    },

    /// The connection is not in a state that accepts requests
    #[error("Not connected: connection is {0}")]
    NotConnected(String),

    /// The request was cancelled by the caller
    #[error("Request cancelled: id={0}")]
    Cancelled(u64),

    /// A malformed or unmatched message was received
    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    /// The provider answered with a JSON-RPC error object
    #[error("Remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code
        code: i64,
        /// Provider-supplied message
        message: String,
        /// Optional structured details
        data: Option<serde_json::Value>,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CapwireError {
    /// Whether a caller may reasonably choose to retry after this error.
    ///
    /// Nothing in the runtime retries on its own; this only informs the
    /// caller's decision.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CapwireError::Timeout { .. }
                | CapwireError::ConnectionLost(_)
                | CapwireError::Overloaded { .. }
                | CapwireError::RateLimited { .. }
        )
    }

    /// Whether the error was produced locally without touching the wire.
    pub fn is_local_rejection(&self) -> bool {
        matches!(
            self,
            CapwireError::Validation { .. }
                | CapwireError::PermissionDenied { .. }
                | CapwireError::RateLimited { .. }
                | CapwireError::QuotaExceeded { .. }
                | CapwireError::UnsupportedCapability(_)
                | CapwireError::Overloaded { .. }
        )
    }
}

impl CapwireError {
    /// Copy the error so every waiter on a shared request gets the same
    /// kind. Wrapped library errors are rebuilt from their message.
    pub fn replicate(&self) -> CapwireError {
        use serde::de::Error as _;

        match self {
            CapwireError::Config(s) => CapwireError::Config(s.clone()),
            CapwireError::Connect(s) => CapwireError::Connect(s.clone()),
            CapwireError::Transport(s) => CapwireError::Transport(s.clone()),
            CapwireError::Encoding(s) => CapwireError::Encoding(s.clone()),
            CapwireError::Decode(s) => CapwireError::Decode(s.clone()),
            CapwireError::ProtocolVersionMismatch { expected, got } => {
                CapwireError::ProtocolVersionMismatch {
                    expected: expected.clone(),
                    got: got.clone(),
                }
            }
            CapwireError::NegotiationFailed(s) => CapwireError::NegotiationFailed(s.clone()),
            CapwireError::UnsupportedCapability(s) => {
                CapwireError::UnsupportedCapability(s.clone())
            }
            CapwireError::UnknownCapability(s) => CapwireError::UnknownCapability(s.clone()),
            CapwireError::Validation {
                capability,
                violations,
            } => CapwireError::Validation {
                capability: capability.clone(),
                violations: violations.clone(),
            },
            CapwireError::PermissionDenied {
                subject,
                capability,
            } => CapwireError::PermissionDenied {
                subject: subject.clone(),
                capability: capability.clone(),
            },
            CapwireError::RateLimited {
                capability,
                limit,
                window_ms,
            } => CapwireError::RateLimited {
                capability: capability.clone(),
                limit: *limit,
                window_ms: *window_ms,
            },
            CapwireError::QuotaExceeded { capability, limit } => CapwireError::QuotaExceeded {
                capability: capability.clone(),
                limit: *limit,
            },
            CapwireError::Timeout { method, timeout_ms } => CapwireError::Timeout {
                method: method.clone(),
                timeout_ms: *timeout_ms,
            },
            CapwireError::ConnectionLost(s) => CapwireError::ConnectionLost(s.clone()),
            CapwireError::Overloaded { capacity } => CapwireError::Overloaded {
                capacity: *capacity,
            },
            CapwireError::NotConnected(s) => CapwireError::NotConnected(s.clone()),
            CapwireError::Cancelled(id) => CapwireError::Cancelled(*id),
            CapwireError::ProtocolAnomaly(s) => CapwireError::ProtocolAnomaly(s.clone()),
            CapwireError::Remote {
                code,
                message,
                data,
            } => CapwireError::Remote {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            CapwireError::Io(e) => CapwireError::Io(std::io::Error::new(e.kind(), e.to_string())),
            CapwireError::Serialization(e) => {
                CapwireError::Serialization(serde_json::Error::custom(e.to_string()))
            }
            CapwireError::Yaml(e) => CapwireError::Yaml(serde_yaml::Error::custom(e.to_string())),
        }
    }
}

fn format_violations(violations: &[Violation]) -> String {
    let parts: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
    format!("{} violation(s): {}", violations.len(), parts.join("; "))
}

/// Result type alias for capwire operations
///
/// Uses `anyhow::Error` so context can be attached while the
/// [`CapwireError`] kind stays recoverable through [`classify`].
pub type Result<T> = anyhow::Result<T>;

/// Recover the [`CapwireError`] kind from an `anyhow` error, if any.
pub fn classify(err: &anyhow::Error) -> Option<&CapwireError> {
    err.downcast_ref::<CapwireError>()
}
