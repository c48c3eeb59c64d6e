//! Signal Transport
//!
//! Drop file plus a Unix signal:
//!
//! 1. `send` writes the envelope to `<signal_dir>/<identity>/<id>.msg`
//!    (atomically, through a `.tmp` + `mv`)
//! 2. then raises the configured signal (default `USR1`) at the listener,
//!    found by its process tag with `pkill -f`
//! 3. the listener's `trap` drains every pending `.msg` file, printing and
//!    deleting each
//!
//! If no tagged listener exists, `pkill` matches nothing; the drop file is
//! removed again and the attempt fails. Needs POSIX signals and `pkill` in
//! the sandbox image.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    quoted_path, setup_error, write_error, DeliveryDetail, DeliveryResult, MessageSink, Strategy,
    Transport, WatcherRegistry,
};
use crate::config::{BridgeConfig, ConfigError};
use crate::engine::{ContainerEngine, ContainerRef, ExecCommand};
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::shell::{quote, sanitize_identity, self_excluding_pattern, SENTINEL};

const DROP_FAILED: i32 = 2;
const NO_LISTENER: i32 = 3;

/// Drop-file-and-signal transport
pub struct SignalTransport {
    engine: Arc<dyn ContainerEngine>,
    watchers: WatcherRegistry,
    signal_dir: PathBuf,
    signal: String,
}

impl SignalTransport {
    /// Create from the Bridge configuration
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` if the configured signal is unknown.
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &BridgeConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            watchers: WatcherRegistry::new(Strategy::Signal, Arc::clone(&engine)),
            engine,
            signal_dir: config.signal_dir.clone(),
            signal: config.signal_name()?,
        })
    }

    /// Drop directory for `identity`
    #[must_use]
    pub fn drop_dir(&self, identity: &str) -> PathBuf {
        self.signal_dir.join(sanitize_identity(identity))
    }

    /// Drop file for one envelope
    #[must_use]
    pub fn drop_file(&self, identity: &str, envelope: &Envelope) -> PathBuf {
        self.drop_dir(identity)
            .join(format!("{}.msg", sanitize_identity(envelope.id().as_str())))
    }

    /// Signal name raised, without the `SIG` prefix
    #[must_use]
    pub fn signal(&self) -> &str {
        &self.signal
    }

    /// Watchers owned by this transport
    #[must_use]
    pub fn watchers(&self) -> &WatcherRegistry {
        &self.watchers
    }

    fn send_script(&self, identity: &str, envelope: &Envelope, line: &str) -> String {
        let file = self.drop_file(identity, envelope);
        let tmp = file.with_extension("tmp");
        let pattern = self_excluding_pattern(&self.watchers.tag_for(identity));
        format!(
            "mkdir -p {dir} && printf '%s\\n' {line} > {tmp} && mv {tmp} {file} || exit {DROP_FAILED}\n\
             pkill -{signal} -f {pattern} || {{ rm -f {file}; exit {NO_LISTENER}; }}",
            dir = quoted_path(&self.drop_dir(identity)),
            line = quote(line),
            tmp = quoted_path(&tmp),
            file = quoted_path(&file),
            signal = self.signal,
            pattern = quote(&pattern),
        )
    }

    fn listen_script(&self, identity: &str) -> String {
        let dir = quoted_path(&self.drop_dir(identity));
        format!(
            "mkdir -p {dir} || exit 1\n\
             drain() {{\n  \
               for f in {dir}/*.msg; do\n    \
                 [ -f \"$f\" ] || continue\n    \
                 printf '%s%s\\n' {sentinel} \"$(cat \"$f\")\"\n    \
                 rm -f \"$f\"\n  \
               done\n\
             }}\n\
             trap drain {signal}\n\
             drain\n\
             while :; do sleep 1 & wait $!; done",
            sentinel = quote(SENTINEL),
            signal = self.signal,
        )
    }
}

#[async_trait]
impl Transport for SignalTransport {
    fn strategy(&self) -> Strategy {
        Strategy::Signal
    }

    async fn send(
        &self,
        target: &ContainerRef,
        envelope: &Envelope,
    ) -> Result<DeliveryResult, TransportError> {
        let line = envelope.to_line()?;
        let script = self.send_script(&target.name, envelope, &line);
        let output = self.engine.exec(target, ExecCommand::shell(script)).await?;

        match output.exit_code {
            0 => {}
            DROP_FAILED => {
                return Err(setup_error(
                    Strategy::Signal,
                    format!("could not write drop file: {}", output.failure_reason()),
                ))
            }
            NO_LISTENER => {
                return Err(write_error(
                    Strategy::Signal,
                    format!("no listener to signal in {}", target.name),
                ))
            }
            _ => return Err(write_error(Strategy::Signal, output.failure_reason())),
        }

        Ok(DeliveryResult::delivered(
            Strategy::Signal,
            envelope,
            DeliveryDetail::Signal {
                path: self.drop_file(&target.name, envelope),
                signal: self.signal.clone(),
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
