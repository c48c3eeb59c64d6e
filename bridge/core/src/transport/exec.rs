//! Exec Transport
//!
//! Runs a one-shot command inside the sandbox with the envelope line in
//! `$BRIDGE_MESSAGE`. With no `exec_handler` configured the command appends
//! the line to `exec_log`, which gives sandboxes without a long-lived listener
//! a place to find their mail.
//!
//! Always available wherever exec is, but costs a process spawn per message
//! and has no listener of its own.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::{quoted_path, write_error, DeliveryDetail, DeliveryResult, Strategy, Transport};
use crate::config::BridgeConfig;
use crate::engine::{ContainerEngine, ContainerRef, ExecCommand};
use crate::envelope::Envelope;
use crate::error::TransportError;

/// Environment variable carrying the envelope line
pub const MESSAGE_ENV: &str = "BRIDGE_MESSAGE";

/// One-shot command transport
pub struct ExecTransport {
    engine: Arc<dyn ContainerEngine>,
    handler: Option<String>,
    exec_log: PathBuf,
}

impl ExecTransport {
    /// Create from the Bridge configuration
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &BridgeConfig) -> Self {
        Self {
            engine,
            handler: config.exec_handler.clone(),
            exec_log: config.exec_log.clone(),
        }
    }

    /// Script run per message
    #[must_use]
    pub fn script(&self) -> String {
        match &self.handler {
            Some(handler) => handler.clone(),
            None => {
                let dir = self
                    .exec_log
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("/"));
                format!(
                    "mkdir -p {dir} && printf '%s\\n' \"${MESSAGE_ENV}\" >> {log}",
                    dir = quoted_path(&dir),
                    log = quoted_path(&self.exec_log),
                )
            }
        }
    }
}

#[async_trait]
impl Transport for ExecTransport {
    fn strategy(&self) -> Strategy {
        Strategy::Exec
    }

    async fn send(
        &self,
        target: &ContainerRef,
        envelope: &Envelope,
    ) -> Result<DeliveryResult, TransportError> {
        let line = envelope.to_line()?;
        let command = ExecCommand::shell(self.script()).with_env(MESSAGE_ENV, line);
        let output = self.engine.exec(target, command).await?;

        if !output.success() {
            return Err(write_error(Strategy::Exec, output.failure_reason()));
        }
        tracing::debug!(target = %target, "Handled by exec");
        Ok(DeliveryResult::delivered(
            Strategy::Exec,
            envelope,
            DeliveryDetail::Exec {
                exit_code: output.exit_code,
            },
        ))
    }
}
