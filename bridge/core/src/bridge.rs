//! Bridge Dispatcher
//!
//! Owns one instance of every transport and decides which ones a delivery
//! goes through.
//!
//! ```text
//!   send(target, payload)
//!        │
//!        ▼
//!   resolve target ──── not live ────► ContainerNotFound (never retried)
//!        │
//!        ▼
//!   ┌─────────────┐  fail × N   ┌────────────────────┐  fail × N   ┌────────┐
//!   │ named-pipe  │ ──────────► │ terminal-injection │ ──────────► │ signal │ ─► …
//!   └─────────────┘             └────────────────────┘             └────────┘
//!        │ ok                           │ ok                           │ ok
//!        ▼                              ▼                              ▼
//!                          DeliveryResult (first success wins)
//! ```
//!
//! In auto mode every strategy gets `retry_attempts` tries, `retry_delay`
//! apart, before the next one is considered. A fixed strategy gets the same
//! retry wrapper but no fallback.
//!
//! `listen` starts every listen-capable transport for one identity and merges
//! what they receive into a single [`MessageStream`]. The same envelope can
//! arrive more than once (for example through both the pipe and the inbox);
//! consumers that care deduplicate by [`Envelope::id`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::config::{BridgeConfig, StrategyMode};
use crate::engine::{ContainerEngine, ContainerRef};
use crate::envelope::{Envelope, EnvelopeId, Payload};
use crate::error::{BridgeError, TransportError};
use crate::transport::{
    create_transport, DeliveryResult, InboundMessage, SharedVolumeTransport, Strategy, Transport,
};

/// Buffered inbound messages before watchers apply backpressure
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Sender label used when neither the call nor the config names one
pub const DEFAULT_SENDER: &str = "coordinator";

/// Per-call options for [`Bridge::send`] and [`Bridge::broadcast`]
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Sender label
    pub from: Option<String>,
    /// Caller-supplied envelope id
    pub id: Option<EnvelopeId>,
    /// Use exactly this strategy instead of the configured mode
    pub strategy: Option<Strategy>,
}

impl SendOptions {
    /// Set the sender label
    #[must_use]
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Set the envelope id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<EnvelopeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Pin the strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Outcome for one target of a broadcast
#[derive(Debug)]
pub struct SettledResult {
    /// Target identity as passed by the caller
    pub target: String,
    /// Delivery result or the error that send would have returned
    pub outcome: Result<DeliveryResult, BridgeError>,
}

impl SettledResult {
    /// Whether this target was reached
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Result of broadcasting to several targets
///
/// One entry per target, in the order the targets were given.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Per-target outcomes
    pub results: Vec<SettledResult>,
}

impl BroadcastReport {
    /// Check if every target received the message
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(SettledResult::is_fulfilled)
    }

    /// Check if no target received the message
    #[must_use]
    pub fn all_failed(&self) -> bool {
        !self.results.iter().any(SettledResult::is_fulfilled)
    }

    /// Successful deliveries
    #[must_use]
    pub fn fulfilled(&self) -> Vec<&DeliveryResult> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok())
            .collect()
    }

    /// Failed targets with their errors
    #[must_use]
    pub fn rejected(&self) -> Vec<(&str, &BridgeError)> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|e| (r.target.as_str(), e)))
            .collect()
    }
}

/// Merged inbound messages of every started watcher
///
/// Yields nothing once [`Bridge::stop`] has been called, even if messages
/// were still buffered.
pub struct MessageStream {
    rx: mpsc::Receiver<InboundMessage>,
    stopped: Arc<AtomicBool>,
}

impl MessageStream {
    /// Next message, `None` after stop or once every watcher has ended
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        if self.is_stopped() {
            self.rx.close();
            return None;
        }
        let message = self.rx.recv().await?;
        if self.is_stopped() {
            self.rx.close();
            return None;
        }
        Some(message)
    }

    /// Next message if one is already buffered
    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        if self.is_stopped() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Whether the Bridge stopped this stream
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Adapt into a [`Stream`]
    pub fn into_stream(self) -> impl Stream<Item = InboundMessage> {
        let stopped = self.stopped;
        ReceiverStream::new(self.rx).take_while(move |_| !stopped.load(Ordering::SeqCst))
    }
}

/// Multi-strategy delivery bridge
pub struct Bridge {
    engine: Arc<dyn ContainerEngine>,
    config: BridgeConfig,
    transports: BTreeMap<Strategy, Arc<dyn Transport>>,
    inbox: Arc<SharedVolumeTransport>,
    listening: AtomicBool,
    streams: Mutex<Vec<Arc<AtomicBool>>>,
}

impl Bridge {
    /// Validate `config` and build one transport per strategy
    ///
    /// # Errors
    ///
    /// `BridgeError::Config` if the configuration is invalid.
    pub fn new(engine: Arc<dyn ContainerEngine>, config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;

        let inbox = Arc::new(SharedVolumeTransport::new(Arc::clone(&engine), &config));
        let mut transports: BTreeMap<Strategy, Arc<dyn Transport>> = BTreeMap::new();
        for strategy in Strategy::AUTO_ORDER {
            let transport = match strategy {
                Strategy::SharedVolume => Arc::clone(&inbox) as Arc<dyn Transport>,
                other => create_transport(other, Arc::clone(&engine), &config)?,
            };
            transports.insert(strategy, transport);
        }

        tracing::debug!(
            engine = engine.name(),
            strategy = %config.strategy,
            retry_attempts = config.retry_attempts,
            "Bridge created"
        );
        Ok(Self {
            engine,
            config,
            transports,
            inbox,
            listening: AtomicBool::new(false),
            streams: Mutex::new(Vec::new()),
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Registered transport for `strategy`
    #[must_use]
    pub fn transport(&self, strategy: Strategy) -> Option<Arc<dyn Transport>> {
        self.transports.get(&strategy).cloned()
    }

    /// The shared-volume transport, for inbox inspection
    #[must_use]
    pub fn shared_volume(&self) -> &SharedVolumeTransport {
        &self.inbox
    }

    /// Whether `listen` has started watchers that `stop` has not torn down
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Deliver `payload` to `target`
    ///
    /// # Errors
    ///
    /// - `ContainerNotFound` if `target` does not resolve
    /// - `Transport` if a fixed strategy exhausted its retries
    /// - `AggregateDeliveryFailure` if every strategy failed in auto mode
    pub async fn send(
        &self,
        target: &str,
        payload: impl Into<Payload>,
        options: SendOptions,
    ) -> Result<DeliveryResult, BridgeError> {
        let wire = payload
            .into()
            .into_wire()
            .map_err(|e| BridgeError::InvalidPayload(e.to_string()))?;
        self.deliver(target, wire, &options).await
    }

    /// Deliver `payload` to every target concurrently
    ///
    /// Never fails as a whole; inspect the report for per-target outcomes.
    pub async fn broadcast<I, S>(
        &self,
        targets: I,
        payload: impl Into<Payload>,
        options: SendOptions,
    ) -> BroadcastReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets: Vec<String> = targets.into_iter().map(Into::into).collect();
        let wire = match payload.into().into_wire() {
            Ok(wire) => wire,
            Err(e) => {
                let results = targets
                    .into_iter()
                    .map(|target| SettledResult {
                        target,
                        outcome: Err(BridgeError::InvalidPayload(e.to_string())),
                    })
                    .collect();
                return BroadcastReport { results };
            }
        };

        let options = &options;
        let wire = &wire;
        let results = join_all(targets.into_iter().map(|target| async move {
            let outcome = self.deliver(&target, wire.clone(), options).await;
            SettledResult { target, outcome }
        }))
        .await;

        let report = BroadcastReport { results };
        tracing::info!(
            targets = report.results.len(),
            delivered = report.fulfilled().len(),
            "Broadcast settled"
        );
        report
    }

    /// Start every listen-capable transport for `identity` and merge their
    /// messages
    ///
    /// `identity` falls back to `self_identity`, then `$HOSTNAME`. Succeeds if
    /// at least one transport started a watcher.
    ///
    /// # Errors
    ///
    /// - `NoListenIdentity` if no identity could be determined
    /// - `ContainerNotFound` if the identity does not resolve
    /// - `ListenFailed` if no transport could start
    pub async fn listen(&self, identity: Option<&str>) -> Result<MessageStream, BridgeError> {
        let identity = listen_identity(
            identity,
            self.config.self_identity.as_deref(),
            std::env::var("HOSTNAME").ok(),
        )?;
        let container = self.engine.resolve(&identity).await?;
        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);

        let container = &container;
        let outcomes = join_all(
            self.transports
                .values()
                .filter(|t| t.can_listen())
                .map(|transport| {
                    let sink = tx.clone();
                    async move { (transport.strategy(), transport.listen(container, sink).await) }
                }),
        )
        .await;
        drop(tx);

        let mut started = Vec::new();
        let mut failures = Vec::new();
        for (strategy, outcome) in outcomes {
            match outcome {
                Ok(()) => started.push(strategy),
                Err(e) => {
                    tracing::warn!(%strategy, identity = %identity, error = %e, "Listener failed to start");
                    failures.push(format!("{strategy}: {e}"));
                }
            }
        }
        if started.is_empty() {
            return Err(BridgeError::ListenFailed(failures.join("; ")));
        }

        let stopped = Arc::new(AtomicBool::new(false));
        self.streams.lock().push(Arc::clone(&stopped));
        self.listening.store(true, Ordering::SeqCst);
        tracing::info!(identity = %identity, strategies = ?started, "Listening");
        Ok(MessageStream { rx, stopped })
    }

    /// Tear down every watcher of every transport
    ///
    /// Idempotent. Does not cancel an in-flight `send`.
    pub async fn stop(&self) {
        let streams = std::mem::take(&mut *self.streams.lock());
        for stopped in &streams {
            stopped.store(true, Ordering::SeqCst);
        }
        join_all(self.transports.values().map(|t| t.stop())).await;

        if self.listening.swap(false, Ordering::SeqCst) {
            tracing::info!("Bridge stopped");
        }
    }

    /// Whether `target` resolves to a running container
    pub async fn is_alive(&self, target: &str) -> bool {
        let container = match self.engine.resolve(target).await {
            Ok(container) => container,
            Err(e) => {
                tracing::debug!(target = %target, error = %e, "Target does not resolve");
                return false;
            }
        };
        match self.engine.is_running(&container).await {
            Ok(running) => running,
            Err(e) => {
                tracing::debug!(target = %target, error = %e, "Run state unavailable");
                false
            }
        }
    }

    /// Envelope ids waiting in `identity`'s shared-volume inbox
    ///
    /// # Errors
    ///
    /// `ContainerNotFound`, or `Transport` if the inbox could not be listed.
    pub async fn pending(&self, identity: &str) -> Result<Vec<EnvelopeId>, BridgeError> {
        let container = self.engine.resolve(identity).await?;
        self.inbox
            .pending(&container)
            .await
            .map_err(|source| BridgeError::Transport {
                strategy: Strategy::SharedVolume,
                source,
            })
    }

    /// Clear `identity`'s shared-volume inbox
    ///
    /// # Errors
    ///
    /// `ContainerNotFound`, or `Transport` if the inbox could not be cleared.
    pub async fn purge(&self, identity: &str) -> Result<(), BridgeError> {
        let container = self.engine.resolve(identity).await?;
        self.inbox
            .purge(&container)
            .await
            .map_err(|source| BridgeError::Transport {
                strategy: Strategy::SharedVolume,
                source,
            })
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn deliver(
        &self,
        target: &str,
        wire: String,
        options: &SendOptions,
    ) -> Result<DeliveryResult, BridgeError> {
        let container = self.engine.resolve(target).await?;
        let envelope = Envelope::new(options.id.clone(), self.sender(options), target, wire);
        let mode = options
            .strategy
            .map_or(self.config.strategy, StrategyMode::Fixed);

        tracing::debug!(
            target = %target,
            message_id = %envelope.id(),
            mode = %mode,
            "Dispatching"
        );

        match mode {
            StrategyMode::Fixed(strategy) => self
                .attempt(strategy, &container, &envelope)
                .await
                .map_err(|source| BridgeError::Transport { strategy, source }),
            StrategyMode::Auto => self.deliver_auto(&container, &envelope).await,
        }
    }

    async fn deliver_auto(
        &self,
        container: &ContainerRef,
        envelope: &Envelope,
    ) -> Result<DeliveryResult, BridgeError> {
        let [first, rest @ ..] = Strategy::AUTO_ORDER;

        let mut last = match self.attempt(first, container, envelope).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        let mut exhausted = first;
        for strategy in rest {
            tracing::warn!(
                target = %container,
                %exhausted,
                next = %strategy,
                "Falling back"
            );
            exhausted = strategy;
            last = match self.attempt(strategy, container, envelope).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };
        }

        let attempts = self.retry_attempts() * Strategy::AUTO_ORDER.len() as u32;
        tracing::warn!(target = %container, attempts, error = %last, "All strategies failed");
        Err(BridgeError::AggregateDeliveryFailure {
            target: container.name.clone(),
            attempts,
            last,
        })
    }

    /// Run up to `retry_attempts` sends through one transport
    async fn attempt(
        &self,
        strategy: Strategy,
        container: &ContainerRef,
        envelope: &Envelope,
    ) -> Result<DeliveryResult, TransportError> {
        let Some(transport) = self.transports.get(&strategy) else {
            return Err(TransportError::Unsupported {
                strategy,
                operation: "send",
            });
        };

        let max = self.retry_attempts();
        let mut attempt = 1;
        loop {
            match transport.send(container, envelope).await {
                Ok(result) => {
                    tracing::info!(
                        target = %container,
                        %strategy,
                        attempt,
                        message_id = %envelope.id(),
                        "Delivered"
                    );
                    return Ok(result);
                }
                Err(e) => {
                    if self.config.verbose {
                        tracing::warn!(target = %container, %strategy, attempt, error = %e, "Attempt failed");
                    } else {
                        tracing::debug!(target = %container, %strategy, attempt, error = %e, "Attempt failed");
                    }
                    if attempt >= max {
                        return Err(e);
                    }
                }
            }
            attempt += 1;
            tokio::time::sleep(self.config.retry_delay()).await;
        }
    }

    fn retry_attempts(&self) -> u32 {
        self.config.retry_attempts.max(1)
    }

    fn sender(&self, options: &SendOptions) -> String {
        options
            .from
            .clone()
            .or_else(|| self.config.self_identity.clone())
            .unwrap_or_else(|| DEFAULT_SENDER.to_string())
    }
}

/// Pick the identity `listen` watches for
fn listen_identity(
    explicit: Option<&str>,
    configured: Option<&str>,
    hostname: Option<String>,
) -> Result<String, BridgeError> {
    explicit
        .map(str::to_string)
        .or_else(|| configured.map(str::to_string))
        .or(hostname)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(BridgeError::NoListenIdentity)
}
