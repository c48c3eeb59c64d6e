//! Named-Pipe Transport
//!
//! One FIFO per recipient at `<pipe_dir>/<identity>.fifo`.
//!
//! - `send` makes sure the FIFO exists, then writes the envelope line into it.
//!   Opening a FIFO for writing blocks until a reader shows up, so the write
//!   runs under `timeout`: no listener means a failed attempt, not a hang.
//! - `listen` starts a remote loop that blocks reading the FIFO and echoes
//!   every line prefixed with the sentinel.
//!
//! Lowest latency of the listen-capable strategies: the reader sleeps in
//! `open`/`read` rather than polling.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    quoted_path, setup_error, write_error, DeliveryDetail, DeliveryResult, MessageSink, Strategy,
    Transport, WatcherRegistry,
};
use crate::config::BridgeConfig;
use crate::engine::{ContainerEngine, ContainerRef, ExecCommand};
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::shell::{quote, sanitize_identity, SENTINEL};

/// Exit status of `timeout` when the command timed out
const TIMEOUT_EXIT_CODE: i32 = 124;

/// FIFO-based transport
pub struct NamedPipeTransport {
    engine: Arc<dyn ContainerEngine>,
    watchers: WatcherRegistry,
    pipe_dir: PathBuf,
    write_timeout_secs: u64,
}

impl NamedPipeTransport {
    /// Create from the Bridge configuration
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &BridgeConfig) -> Self {
        Self {
            watchers: WatcherRegistry::new(Strategy::NamedPipe, Arc::clone(&engine)),
            engine,
            pipe_dir: config.pipe_dir.clone(),
            write_timeout_secs: config.write_timeout_secs.max(1),
        }
    }

    /// FIFO path for `identity`
    #[must_use]
    pub fn pipe_path(&self, identity: &str) -> PathBuf {
        self.pipe_dir
            .join(format!("{}.fifo", sanitize_identity(identity)))
    }

    /// Watchers owned by this transport
    #[must_use]
    pub fn watchers(&self) -> &WatcherRegistry {
        &self.watchers
    }

    /// `mkdir -p` plus "mkfifo if missing"
    fn ensure_script(&self, identity: &str) -> String {
        let path = quoted_path(&self.pipe_path(identity));
        format!(
            "mkdir -p {dir} && {{ [ -p {path} ] || mkfifo {path}; }}",
            dir = quoted_path(&self.pipe_dir),
        )
    }

    fn write_script(&self, identity: &str, line: &str) -> String {
        format!(
            "printf '%s\\n' {line} | timeout {secs} tee {path} > /dev/null",
            line = quote(line),
            secs = self.write_timeout_secs,
            path = quoted_path(&self.pipe_path(identity)),
        )
    }

    fn listen_script(&self, identity: &str) -> String {
        format!(
            "{ensure} || exit 1\n\
             while :; do\n  \
               while IFS= read -r line; do printf '%s%s\\n' {sentinel} \"$line\"; done < {path}\n\
             done",
            ensure = self.ensure_script(identity),
            sentinel = quote(SENTINEL),
            path = quoted_path(&self.pipe_path(identity)),
        )
    }
}

#[async_trait]
impl Transport for NamedPipeTransport {
    fn strategy(&self) -> Strategy {
        Strategy::NamedPipe
    }

    async fn send(
        &self,
        target: &ContainerRef,
        envelope: &Envelope,
    ) -> Result<DeliveryResult, TransportError> {
        let setup = self
            .engine
            .exec(target, ExecCommand::shell(self.ensure_script(&target.name)))
            .await?;
        if !setup.success() {
            return Err(setup_error(Strategy::NamedPipe, setup.failure_reason()));
        }

        let line = envelope.to_line()?;
        let output = self
            .engine
            .exec(target, ExecCommand::shell(self.write_script(&target.name, &line)))
            .await?;
        if !output.success() {
            let reason = if output.exit_code == TIMEOUT_EXIT_CODE {
                "no reader on pipe".to_string()
            } else {
                output.failure_reason()
            };
            return Err(write_error(Strategy::NamedPipe, reason));
        }

        Ok(DeliveryResult::delivered(
            Strategy::NamedPipe,
            envelope,
            DeliveryDetail::Pipe {
                path: self.pipe_path(&target.name),
            },
        ))
    }

    fn can_listen(&self) -> bool {
        true
    }

    async fn listen(&self, container: &ContainerRef, sink: MessageSink) -> Result<(), TransportError> {
        self.watchers
            .start(container, self.listen_script(&container.name), sink)
            .await
    }

    async fn stop(&self) {
        self.watchers.stop_all().await;
    }
}
