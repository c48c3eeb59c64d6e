//! Error Types
//!
//! Three layers of failure, from the bottom up:
//!
//! - [`EngineError`]: the container engine could not resolve, exec or stream
//! - [`TransportError`]: one strategy failed to set up, write or listen
//! - [`BridgeError`]: what the caller of the Bridge finally sees
//!
//! Transport errors are recovered inside the Bridge by retry and (in auto
//! mode) fallback. Only `ContainerNotFound`, a fixed-strategy failure or the
//! final aggregate failure reach the caller.

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::Strategy;

/// Failures reported by a container engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The identity does not name a running container
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The exec call could not be created or was rejected by the engine
    #[error("exec failed: {0}")]
    ExecFailed(String),

    /// The attached output stream failed mid-flight
    #[error("exec stream error: {0}")]
    Stream(String),

    /// Local I/O failure talking to the engine
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single transport attempt
#[derive(Debug, Error)]
pub enum TransportError {
    /// The primitive (pipe, inbox, device, listener) could not be prepared
    #[error("{strategy} setup failed: {reason}")]
    Setup {
        /// Strategy that failed
        strategy: Strategy,
        /// What went wrong
        reason: String,
    },

    /// The payload could not be written or acknowledged
    #[error("{strategy} write failed: {reason}")]
    Write {
        /// Strategy that failed
        strategy: Strategy,
        /// What went wrong
        reason: String,
    },

    /// The transport does not implement the operation
    #[error("{strategy} does not support {operation}")]
    Unsupported {
        /// Strategy asked
        strategy: Strategy,
        /// Operation name (e.g. "listen")
        operation: &'static str,
    },

    /// The envelope could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The engine rejected the underlying call
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors surfaced by the [`Bridge`](crate::Bridge)
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Target identity does not resolve. Never retried.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// A fixed strategy exhausted its retries
    #[error("delivery via {strategy} failed: {source}")]
    Transport {
        /// The configured strategy
        strategy: Strategy,
        /// Last underlying cause
        #[source]
        source: TransportError,
    },

    /// Every candidate strategy exhausted its retries (auto mode only)
    #[error("all strategies failed for {target} after {attempts} attempts: {last}")]
    AggregateDeliveryFailure {
        /// Recipient identity
        target: String,
        /// Total attempts made across all strategies
        attempts: u32,
        /// Last underlying cause
        #[source]
        last: TransportError,
    },

    /// `listen` was called without an identity and none could be inferred
    #[error("no listen identity: pass one, set self_identity or HOSTNAME")]
    NoListenIdentity,

    /// No listen-capable transport could start a watcher
    #[error("listen failed: {0}")]
    ListenFailed(String),

    /// The payload could not be serialised
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The container engine failed outside any transport attempt
    #[error(transparent)]
    Engine(EngineError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Whether retrying the same call could plausibly succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::AggregateDeliveryFailure { .. }
                | Self::ListenFailed(_)
                | Self::Engine(_)
        )
    }
}

impl From<EngineError> for BridgeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ContainerNotFound(id) => Self::ContainerNotFound(id),
            other => Self::Engine(other),
        }
    }
}
