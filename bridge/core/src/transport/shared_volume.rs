//! Shared-Volume Transport
//!
//! One inbox directory per recipient, one file per message:
//!
//! ```text
//! <inbox_dir>/
//!   worker-1/
//!     3f0c…e1.json      ← pending envelope, named by sanitised id
//!     .9ab2…44.tmp      ← being written, never picked up
//!   worker-2/
//! ```
//!
//! `send` writes `.<id>.tmp` and renames it to `<id>.json`, so a poller only
//! ever sees complete files. `listen` runs a remote loop that polls the inbox
//! every `poll_interval_ms`, printing and deleting each file it finds.
//!
//! Slowest strategy (bounded by the poll interval) but the most portable, and
//! the only one whose deliveries survive on disk until consumed. That makes it
//! the last resort in auto mode.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    quoted_path, setup_error, write_error, DeliveryDetail, DeliveryResult, MessageSink, Strategy,
    Transport, WatcherRegistry,
};
use super::watcher::parse_line;
use crate::config::BridgeConfig;
use crate::engine::{ContainerEngine, ContainerRef, ExecCommand};
use crate::envelope::{Envelope, EnvelopeId};
use crate::error::TransportError;
use crate::shell::{quote, sanitize_identity, SENTINEL};

/// Exit status when the inbox directory cannot be created
const INBOX_UNAVAILABLE: i32 = 2;

/// Polled inbox transport
pub struct SharedVolumeTransport {
    engine: Arc<dyn ContainerEngine>,
    watchers: WatcherRegistry,
    inbox_dir: PathBuf,
    poll_interval: Duration,
}

impl SharedVolumeTransport {
    /// Create from the Bridge configuration
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &BridgeConfig) -> Self {
        Self {
            watchers: WatcherRegistry::new(Strategy::SharedVolume, Arc::clone(&engine)),
            engine,
            inbox_dir: config.inbox_dir.clone(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Inbox directory for `identity`
    #[must_use]
    pub fn inbox(&self, identity: &str) -> PathBuf {
        self.inbox_dir.join(sanitize_identity(identity))
    }

    /// Final path of one envelope in `identity`'s inbox
    #[must_use]
    pub fn inbox_file(&self, identity: &str, id: &EnvelopeId) -> PathBuf {
        self.inbox(identity)
            .join(format!("{}.json", sanitize_identity(id.as_str())))
    }

    /// Poll interval of the remote listener loop
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Watchers owned by this transport
    #[must_use]
    pub fn watchers(&self) -> &WatcherRegistry {
        &self.watchers
    }

    /// Ids of envelopes waiting in `container`'s inbox, sorted
    ///
    /// Ids are read from the envelopes themselves, not from file names, so
    /// an id that had to be rewritten for the file system comes back as the
    /// caller wrote it. Unreadable files are skipped.
    pub async fn pending(&self, container: &ContainerRef) -> Result<Vec<EnvelopeId>, TransportError> {
        let script = format!(
            "for f in {dir}/*.json; do\n  \
               [ -f \"$f\" ] && printf '%s%s\\n' {sentinel} \"$(cat \"$f\")\"\n\
             done; true",
            dir = quoted_path(&self.inbox(&container.name)),
            sentinel = quote(SENTINEL),
        );
        let output = self.engine.exec(container, ExecCommand::shell(script)).await?;
        if !output.success() {
            return Err(setup_error(Strategy::SharedVolume, output.failure_reason()));
        }

        let mut ids = Vec::new();
        for line in output.stdout.lines() {
            match parse_line(line) {
                Some(Ok(envelope)) => ids.push(envelope.id().clone()),
                Some(Err(e)) => {
                    tracing::warn!(container = %container, error = %e, "Skipping unreadable inbox file");
                }
                None => {}
            }
        }
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ids)
    }

    /// Delete every pending and half-written file in `container`'s inbox
    pub async fn purge(&self, container: &ContainerRef) -> Result<(), TransportError> {
        let dir = quoted_path(&self.inbox(&container.name));
        let script = format!("rm -f {dir}/*.json {dir}/.*.tmp");
        let output = self.engine.exec(container, ExecCommand::shell(script)).await?;
        if !output.success() {
            return Err(write_error(Strategy::SharedVolume, output.failure_reason()));
        }
        tracing::info!(container = %container, "Inbox purged");
        Ok(())
    }

    fn send_script(&self, identity: &str, envelope: &Envelope, line: &str) -> String {
        let dir = self.inbox(identity);
        let tmp = dir.join(format!(".{}.tmp", sanitize_identity(envelope.id().as_str())));
        format!(
            "mkdir -p {dir} || exit {INBOX_UNAVAILABLE}\n\
             printf '%s\\n' {line} > {tmp} && mv {tmp} {file}",
            dir = quoted_path(&dir),
            line = quote(line),
            tmp = quoted_path(&tmp),
            file = quoted_path(&self.inbox_file(identity, envelope.id())),
        )
    }

    fn listen_script(&self, identity: &str) -> String {
        format!(
            "mkdir -p {dir} || exit 1\n\
             while :; do\n  \
               for f in {dir}/*.json; do\n    \
                 [ -f \"$f\" ] || continue\n    \
                 printf '%s%s\\n' {sentinel} \"$(cat \"$f\")\"\n    \
                 rm -f \"$f\"\n  \
               done\n  \
               sleep {interval}\n\
             done",
            dir = quoted_path(&self.inbox(identity)),
            sentinel = quote(SENTINEL),
            interval = format_seconds(self.poll_interval),
        )
    }
}

/// `sleep` argument for a duration: `500ms` → `0.5`, `2s` → `2`
fn format_seconds(duration: Duration) -> String {
    let millis = duration.as_millis();
    let (secs, rem) = (millis / 1000, millis % 1000);
    if rem == 0 {
        secs.to_string()
    } else {
        let text = format!("{secs}.{rem:03}");
        text.trim_end_matches('0').to_string()
    }
}

#[async_trait]
impl Transport for SharedVolumeTransport {
    fn strategy(&self) -> Strategy {
        Strategy::SharedVolume
    }

    async fn send(
        &self,
        target: &ContainerRef,
        envelope: &Envelope,
    ) -> Result<DeliveryResult, TransportError> {
        let line = envelope.to_line()?;
        let script = self.send_script(&target.name, envelope, &line);
        let output = self.engine.exec(target, ExecCommand::shell(script)).await?;

        if output.exit_code == INBOX_UNAVAILABLE {
            return Err(setup_error(
                Strategy::SharedVolume,
                format!(
                    "cannot create inbox {}: {}",
                    self.inbox(&target.name).display(),
                    output.failure_reason()
                ),
            ));
        }
        if !output.success() {
            return Err(write_error(Strategy::SharedVolume, output.failure_reason()));
        }

        let path = self.inbox_file(&target.name, envelope.id());
        tracing::debug!(target = %target, path = %path.display(), "Dropped into inbox");
        Ok(DeliveryResult::delivered(
            Strategy::SharedVolume,
            envelope,
            DeliveryDetail::Inbox { path },
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
