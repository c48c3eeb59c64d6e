//! Watcher Registry
//!
//! Bookkeeping for the long-lived remote loops started by `listen`.
//!
//! A watcher is three things:
//! - a remote shell loop inside the sandbox, tagged through `$0` so that
//!   `pkill -f` can find it later
//! - the local exec stream attached to that loop's stdout
//! - a reader task turning sentinel lines into [`InboundMessage`]s
//!
//! ```text
//!   sandbox                          coordinator
//!  ┌──────────────────────┐        ┌──────────────────────────────┐
//!  │ sh -c '<loop>' <tag> │ stdout │ ExecStream ─► reader task ─► sink
//!  └──────────────────────┘ ─────► └──────────────────────────────┘
//! ```
//!
//! Starts and stops for one identity are serialised, so overlapping `listen`
//! calls leave exactly one loop behind. If the coordinator exits without
//! `stop()`, the remote loops keep running.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{setup_error, InboundMessage, MessageSink, Strategy};
use crate::engine::{ContainerEngine, ContainerRef, ExecCommand, ExecLines, KillHandle};
use crate::envelope::Envelope;
use crate::shell::{self, sanitize_identity};

/// Prefix of every watcher process tag
pub const WATCHER_TAG_PREFIX: &str = "sandbox-bridge-watch";

struct Watcher {
    container: ContainerRef,
    tag: String,
    reader: JoinHandle<()>,
    kill: KillHandle,
}

/// Active watchers of one transport, keyed by sanitised identity
pub struct WatcherRegistry {
    strategy: Strategy,
    engine: Arc<dyn ContainerEngine>,
    watchers: DashMap<String, Watcher>,
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl WatcherRegistry {
    /// Empty registry for `strategy`
    pub fn new(strategy: Strategy, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            strategy,
            engine,
            watchers: DashMap::new(),
            gates: DashMap::new(),
        }
    }

    /// Process tag for this strategy's watcher on `identity`
    ///
    /// Ends in `:` so `worker-1` never matches `worker-10`.
    #[must_use]
    pub fn tag_for(&self, identity: &str) -> String {
        format!(
            "{WATCHER_TAG_PREFIX}-{}-{}:",
            self.strategy,
            sanitize_identity(identity)
        )
    }

    /// Start the remote loop `script` in `container`, replacing any watcher
    /// already registered for it
    pub async fn start(
        &self,
        container: &ContainerRef,
        script: String,
        sink: MessageSink,
    ) -> Result<(), crate::error::TransportError> {
        let key = sanitize_identity(&container.name);
        let gate = self.gate(&key);
        let _guard = gate.lock().await;

        if let Some((_, previous)) = self.watchers.remove(&key) {
            tracing::info!(
                strategy = %self.strategy,
                container = %container,
                "Replacing existing watcher"
            );
            self.teardown(previous).await;
        }

        let tag = self.tag_for(&container.name);
        let command = ExecCommand::shell(script).with_tag(tag.clone());
        let stream = self
            .engine
            .exec_stream(container, command)
            .await
            .map_err(|e| setup_error(self.strategy, e.to_string()))?;
        let (lines, kill) = stream.split();

        let reader = tokio::spawn(read_loop(
            self.strategy,
            container.name.clone(),
            lines,
            sink,
        ));

        self.watchers.insert(
            key,
            Watcher {
                container: container.clone(),
                tag,
                reader,
                kill,
            },
        );
        tracing::info!(strategy = %self.strategy, container = %container, "Watcher started");
        Ok(())
    }

    /// Stop the watcher for `identity`, if any
    pub async fn stop(&self, identity: &str) {
        self.stop_key(&sanitize_identity(identity)).await;
    }

    /// Stop every watcher, waiting out starts in flight. A no-op when none
    /// are running.
    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.gates.iter().map(|g| g.key().clone()).collect();
        for key in keys {
            self.stop_key(&key).await;
        }
    }

    async fn stop_key(&self, key: &str) {
        let gate = self.gate(key);
        let _guard = gate.lock().await;
        if let Some((_, watcher)) = self.watchers.remove(key) {
            self.teardown(watcher).await;
        }
    }

    fn gate(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.gates.entry(key.to_string()).or_default().value())
    }

    /// Identities with an active watcher
    #[must_use]
    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .watchers
            .iter()
            .map(|w| w.value().container.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Whether a watcher runs for `identity`
    #[must_use]
    pub fn is_watching(&self, identity: &str) -> bool {
        self.watchers.contains_key(&sanitize_identity(identity))
    }

    async fn teardown(&self, mut watcher: Watcher) {
        watcher.reader.abort();
        watcher.kill.kill();

        let pattern = shell::self_excluding_pattern(&watcher.tag);
        let script = format!("pkill -f {} || true", shell::quote(&pattern));
        match self
            .engine
            .exec(&watcher.container, ExecCommand::shell(script))
            .await
        {
            Ok(_) => tracing::debug!(
                strategy = %self.strategy,
                container = %watcher.container,
                "Watcher stopped"
            ),
            // Container may already be gone; the local side is down either way
            Err(e) => tracing::debug!(
                strategy = %self.strategy,
                container = %watcher.container,
                error = %e,
                "Remote watcher cleanup failed"
            ),
        }
    }
}

/// Parse one watcher line
///
/// `None` for incidental output, `Some(Err)` for a sentinel line that does
/// not hold an envelope.
pub(crate) fn parse_line(line: &str) -> Option<Result<Envelope, crate::error::TransportError>> {
    shell::strip_sentinel(line).map(Envelope::from_line)
}

async fn read_loop(strategy: Strategy, identity: String, mut lines: ExecLines, sink: MessageSink) {
    while let Some(item) = lines.recv().await {
        let line = match item {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(%strategy, identity = %identity, error = %e, "Watcher stream error");
                continue;
            }
        };

        match parse_line(&line) {
            Some(Ok(envelope)) => {
                tracing::debug!(
                    %strategy,
                    identity = %identity,
                    message_id = %envelope.id(),
                    "Message received"
                );
                let message = InboundMessage {
                    strategy,
                    identity: identity.clone(),
                    envelope,
                    received_at: Utc::now(),
                };
                if sink.send(message).await.is_err() {
                    tracing::debug!(%strategy, "Message receiver dropped");
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(%strategy, identity = %identity, error = %e, "Dropping malformed message");
            }
            None => tracing::trace!(%strategy, line = %line, "Ignoring watcher output"),
        }
    }
    tracing::debug!(%strategy, identity = %identity, "Watcher stream ended");
}
