//! Transport Layer
//!
//! Five ways to get an envelope into a sandbox, all behind one trait:
//!
//! | Strategy             | Primitive                       | Listen |
//! |----------------------|---------------------------------|--------|
//! | `named-pipe`         | FIFO per recipient              | yes    |
//! | `terminal-injection` | write to the terminal device    | no     |
//! | `signal`             | drop file + Unix signal         | yes    |
//! | `exec`               | one-shot remote command         | no     |
//! | `shared-volume`      | file per message in an inbox    | yes    |
//!
//! # Design Philosophy
//!
//! Every primitive is reached through the container engine's exec call, so a
//! transport is nothing more than a script template plus a parser for what
//! its watcher prints. Setup is idempotent ("create if missing"); delivery is
//! not, and each `send` is a fresh attempt.
//!
//! Listen-capable transports share [`WatcherRegistry`]: at most one watcher
//! per (transport, identity), replaced rather than duplicated on a second
//! `listen`.

pub mod exec;
pub mod factory;
pub mod named_pipe;
pub mod shared_volume;
pub mod signal;
pub mod terminal;
pub mod watcher;

pub use exec::ExecTransport;
pub use factory::create_transport;
pub use named_pipe::NamedPipeTransport;
pub use shared_volume::SharedVolumeTransport;
pub use signal::SignalTransport;
pub use terminal::TerminalTransport;
pub use watcher::{WatcherRegistry, WATCHER_TAG_PREFIX};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::engine::ContainerRef;
use crate::envelope::{Envelope, EnvelopeId};
use crate::error::TransportError;

/// Delivery strategy name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Unix FIFO in the target sandbox
    NamedPipe,
    /// Direct write to the sandbox's terminal device
    TerminalInjection,
    /// Drop file plus a Unix signal to a tagged listener
    Signal,
    /// One-shot remote command
    Exec,
    /// Polled per-recipient inbox directory
    SharedVolume,
}

impl Strategy {
    /// Priority order used by auto mode
    pub const AUTO_ORDER: [Strategy; 5] = [
        Strategy::NamedPipe,
        Strategy::TerminalInjection,
        Strategy::Signal,
        Strategy::Exec,
        Strategy::SharedVolume,
    ];

    /// Canonical name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NamedPipe => "named-pipe",
            Self::TerminalInjection => "terminal-injection",
            Self::Signal => "signal",
            Self::Exec => "exec",
            Self::SharedVolume => "shared-volume",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "named-pipe" | "pipe" | "fifo" => Ok(Self::NamedPipe),
            "terminal-injection" | "terminal" | "pty" | "tty" => Ok(Self::TerminalInjection),
            "signal" => Ok(Self::Signal),
            "exec" => Ok(Self::Exec),
            "shared-volume" | "volume" | "file" => Ok(Self::SharedVolume),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// Transport-specific detail of a delivery
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DeliveryDetail {
    /// Written to a FIFO
    Pipe {
        /// FIFO path inside the sandbox
        path: PathBuf,
    },
    /// Written to a terminal device
    Terminal {
        /// Device path inside the sandbox
        device: PathBuf,
    },
    /// Dropped as a file and signalled
    Signal {
        /// Drop file path inside the sandbox
        path: PathBuf,
        /// Signal name raised
        signal: String,
    },
    /// Handed to a one-shot command
    Exec {
        /// Exit code of the command
        exit_code: i32,
    },
    /// Written into an inbox
    Inbox {
        /// Inbox file path inside the sandbox
        path: PathBuf,
    },
}

/// Outcome of one successful attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// Strategy that delivered the envelope
    pub strategy_used: Strategy,
    /// Always true for a returned result; failures are errors
    pub success: bool,
    /// Recipient identity
    pub target: String,
    /// Envelope id
    pub message_id: EnvelopeId,
    /// When the delivery completed
    pub timestamp: DateTime<Utc>,
    /// Transport-specific detail
    pub detail: DeliveryDetail,
}

impl DeliveryResult {
    /// Successful delivery of `envelope` via `strategy`
    #[must_use]
    pub fn delivered(strategy: Strategy, envelope: &Envelope, detail: DeliveryDetail) -> Self {
        Self {
            strategy_used: strategy,
            success: true,
            target: envelope.to().to_string(),
            message_id: envelope.id().clone(),
            timestamp: Utc::now(),
            detail,
        }
    }
}

/// A message picked up by a watcher
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Transport whose watcher produced it
    pub strategy: Strategy,
    /// Identity the watcher listens for
    pub identity: String,
    /// The envelope as written by the sender
    pub envelope: Envelope,
    /// When the watcher parsed it
    pub received_at: DateTime<Utc>,
}

/// Where watchers push parsed messages
pub type MessageSink = mpsc::Sender<InboundMessage>;

/// One delivery mechanism
#[async_trait]
pub trait Transport: Send + Sync {
    /// Strategy this transport implements
    fn strategy(&self) -> Strategy;

    /// Deliver `envelope` into `target`
    ///
    /// # Errors
    ///
    /// `TransportError` when the primitive could not be created, written or
    /// acknowledged inside the sandbox.
    async fn send(
        &self,
        target: &ContainerRef,
        envelope: &Envelope,
    ) -> Result<DeliveryResult, TransportError>;

    /// Whether [`Transport::listen`] is implemented
    fn can_listen(&self) -> bool {
        false
    }

    /// Start a watcher in `container` pushing parsed messages into `sink`
    ///
    /// Replaces any watcher this transport already runs for the container.
    async fn listen(&self, container: &ContainerRef, sink: MessageSink) -> Result<(), TransportError> {
        let _ = (container, sink);
        Err(TransportError::Unsupported {
            strategy: self.strategy(),
            operation: "listen",
        })
    }

    /// Tear down every watcher. Safe to call repeatedly.
    async fn stop(&self) {}
}

/// Map a failed exec into a setup error
pub(crate) fn setup_error(strategy: Strategy, reason: impl Into<String>) -> TransportError {
    TransportError::Setup {
        strategy,
        reason: reason.into(),
    }
}

/// Map a failed exec into a write error
pub(crate) fn write_error(strategy: Strategy, reason: impl Into<String>) -> TransportError {
    TransportError::Write {
        strategy,
        reason: reason.into(),
    }
}

/// Render a path for a shell script, quoted
pub(crate) fn quoted_path(path: &std::path::Path) -> String {
    crate::shell::quote(&path.to_string_lossy())
}
