//! Bridge Core - Multi-Strategy Message Delivery into Container Sandboxes
//!
//! Gets a payload into a sandbox's running session without the caller knowing
//! which low-level mechanism works for a given sandbox image. Sandboxes are
//! reached only through the container engine's exec capability; every
//! transport is built on top of it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Coordinator                              │
//! │   send / broadcast / listen / stop / is_alive                     │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  │
//! ┌────────────────────────────────┼─────────────────────────────────┐
//! │                         BRIDGE CORE                               │
//! │  ┌─────────────────────────────┴──────────────────────────────┐  │
//! │  │                  Bridge (retry + fallback)                  │  │
//! │  └──┬──────────┬────────────┬────────────┬──────────────┬─────┘  │
//! │  ┌──┴───┐  ┌───┴────┐  ┌────┴───┐  ┌─────┴──┐  ┌────────┴─────┐  │
//! │  │ pipe │  │terminal│  │ signal │  │  exec  │  │shared-volume │  │
//! │  └──┬───┘  └───┬────┘  └────┬───┘  └────┬───┘  └──────┬───────┘  │
//! │     └──────────┴────────────┼───────────┴─────────────┘          │
//! │                    ContainerEngine (exec)                         │
//! └─────────────────────────────┼────────────────────────────────────┘
//!                               │
//!                      docker / podman / fake
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use bridge_core::{Bridge, BridgeConfig, DockerCli, SendOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Arc::new(DockerCli::default());
//!     let bridge = Bridge::new(engine, BridgeConfig::from_env())?;
//!
//!     let result = bridge
//!         .send("worker-1", serde_json::json!({"action": "ping"}), SendOptions::default())
//!         .await?;
//!     println!("delivered via {}", result.strategy_used);
//!
//!     let mut messages = bridge.listen(Some("coordinator")).await?;
//!     while let Some(msg) = messages.recv().await {
//!         println!("{} -> {}", msg.envelope.from(), msg.envelope.payload());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`bridge`]: Dispatcher, broadcast and merged listening
//! - [`transport`]: The five delivery strategies and their watcher registry
//! - [`engine`]: Container engine seam (Docker CLI, in-memory fake)
//! - [`envelope`]: Message envelope and wire format
//! - [`config`]: Layered configuration
//! - [`error`]: Error types
//! - [`shell`]: POSIX shell quoting and identity sanitising

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bridge;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod shell;
pub mod transport;

// Re-exports for convenience
pub use bridge::{Bridge, BroadcastReport, MessageStream, SendOptions, SettledResult};
pub use config::{default_config_path, BridgeConfig, ConfigError, StrategyMode};
pub use engine::{
    ContainerEngine, ContainerRef, DockerCli, ExecCommand, ExecOutput, ExecStream, FakeEngine,
};
pub use envelope::{Envelope, EnvelopeId, Payload};
pub use error::{BridgeError, EngineError, TransportError};
pub use transport::{
    DeliveryDetail, DeliveryResult, InboundMessage, Strategy, Transport, WatcherRegistry,
};
