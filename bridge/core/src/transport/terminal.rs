//! Terminal-Injection Transport
//!
//! Writes the payload text straight to the sandbox's terminal device, for
//! foreground processes (an interactive REPL, an agent CLI) that only read
//! their terminal. Meant for urgent, human-visible interrupts.
//!
//! Send-only: reading back from the same device would interleave with the
//! echo of what was just written.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::{quoted_path, setup_error, write_error, DeliveryDetail, DeliveryResult, Strategy, Transport};
use crate::config::BridgeConfig;
use crate::engine::{ContainerEngine, ContainerRef, ExecCommand};
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::shell::quote;

/// Exit status the script uses when the device is missing or read-only
const DEVICE_UNAVAILABLE: i32 = 3;

/// Terminal device writer
pub struct TerminalTransport {
    engine: Arc<dyn ContainerEngine>,
    device: PathBuf,
}

impl TerminalTransport {
    /// Create from the Bridge configuration
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &BridgeConfig) -> Self {
        Self {
            engine,
            device: config.tty_path.clone(),
        }
    }

    /// Device this transport writes to
    #[must_use]
    pub fn device(&self) -> &PathBuf {
        &self.device
    }

    fn inject_script(&self, text: &str) -> String {
        let device = quoted_path(&self.device);
        format!(
            "[ -c {device} ] && [ -w {device} ] || exit {DEVICE_UNAVAILABLE}\n\
             printf '%s\\n' {text} > {device}",
            text = quote(text),
        )
    }
}

#[async_trait]
impl Transport for TerminalTransport {
    fn strategy(&self) -> Strategy {
        Strategy::TerminalInjection
    }

    async fn send(
        &self,
        target: &ContainerRef,
        envelope: &Envelope,
    ) -> Result<DeliveryResult, TransportError> {
        let output = self
            .engine
            .exec(target, ExecCommand::shell(self.inject_script(envelope.payload())))
            .await?;

        if output.exit_code == DEVICE_UNAVAILABLE {
            return Err(setup_error(
                Strategy::TerminalInjection,
                format!("{} is not a writable terminal", self.device.display()),
            ));
        }
        if !output.success() {
            return Err(write_error(Strategy::TerminalInjection, output.failure_reason()));
        }

        tracing::debug!(target = %target, device = %self.device.display(), "Injected into terminal");
        Ok(DeliveryResult::delivered(
            Strategy::TerminalInjection,
            envelope,
            DeliveryDetail::Terminal {
                device: self.device.clone(),
            },
        ))
    }
}
