//! Scriptable in-memory engine
//!
//! Stands in for a real container engine in tests. It records every exec,
//! answers according to pattern rules, and hands out exec streams the test
//! can feed lines into.
//!
//! ```ignore
//! let engine = FakeEngine::new().with_container("worker-1");
//! engine.fail_matching_times("mkfifo", 1);
//! // ... drive the Bridge ...
//! assert_eq!(engine.count_matching("mkfifo"), 1);
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use super::{ContainerEngine, ContainerRef, ExecCommand, ExecOutput, ExecStream, KillHandle};
use crate::error::EngineError;

const FAKE_STREAM_CAPACITY: usize = 64;

/// One recorded exec
#[derive(Clone, Debug)]
pub struct ExecCall {
    /// Container name the exec targeted
    pub container: String,
    /// The command as issued
    pub command: ExecCommand,
    /// Whether this was a streaming exec
    pub streaming: bool,
}

impl ExecCall {
    /// Command line as one string (argv joined by spaces)
    #[must_use]
    pub fn command_line(&self) -> String {
        self.command.argv.join(" ")
    }
}

struct Rule {
    pattern: String,
    remaining: Option<usize>,
    output: Result<ExecOutput, String>,
}

struct OpenStream {
    container: String,
    command_line: String,
    tx: Option<mpsc::Sender<Result<String, EngineError>>>,
    kill_rx: oneshot::Receiver<()>,
}

impl OpenStream {
    fn is_killed(&mut self) -> bool {
        !matches!(self.kill_rx.try_recv(), Err(TryRecvError::Empty))
    }
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, bool>,
    calls: Vec<ExecCall>,
    rules: Vec<Rule>,
    streams: Vec<OpenStream>,
}

/// In-memory [`ContainerEngine`] for tests
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    /// Empty engine with no containers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`FakeEngine::add_container`]
    #[must_use]
    pub fn with_container(self, name: &str) -> Self {
        self.add_container(name);
        self
    }

    /// Register a running container
    pub fn add_container(&self, name: &str) {
        self.state.lock().containers.insert(name.to_string(), true);
    }

    /// Register a container that exists but is stopped
    pub fn add_stopped_container(&self, name: &str) {
        self.state.lock().containers.insert(name.to_string(), false);
    }

    /// Remove a container entirely
    pub fn remove_container(&self, name: &str) {
        self.state.lock().containers.remove(name);
    }

    /// Execs whose command line contains `pattern` exit 1 forever
    pub fn fail_matching(&self, pattern: &str) {
        self.push_rule(pattern, None, Ok(failed_output()));
    }

    /// Execs whose command line contains `pattern` exit 1, `times` times
    pub fn fail_matching_times(&self, pattern: &str, times: usize) {
        self.push_rule(pattern, Some(times), Ok(failed_output()));
    }

    /// Execs whose command line contains `pattern` exit with `exit_code` forever
    pub fn exit_matching(&self, pattern: &str, exit_code: i32) {
        self.push_rule(
            pattern,
            None,
            Ok(ExecOutput {
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
            }),
        );
    }

    /// Execs whose command line contains `pattern` are rejected by the engine
    pub fn reject_matching(&self, pattern: &str) {
        self.push_rule(pattern, None, Err(format!("rejected: {pattern}")));
    }

    /// Execs whose command line contains `pattern` succeed with `stdout`
    pub fn respond_matching(&self, pattern: &str, stdout: &str) {
        self.push_rule(
            pattern,
            None,
            Ok(ExecOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }),
        );
    }

    fn push_rule(&self, pattern: &str, remaining: Option<usize>, output: Result<ExecOutput, String>) {
        self.state.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            remaining,
            output,
        });
    }

    /// All recorded execs, in order
    #[must_use]
    pub fn calls(&self) -> Vec<ExecCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded execs whose command line contains `pattern`
    #[must_use]
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.command_line().contains(pattern))
            .count()
    }

    /// Number of live (not killed, not closed) streams matching `pattern`
    #[must_use]
    pub fn live_streams(&self, pattern: &str) -> usize {
        let mut state = self.state.lock();
        let mut live = 0;
        for stream in &mut state.streams {
            if stream.tx.is_some() && stream.command_line.contains(pattern) && !stream.is_killed() {
                live += 1;
            }
        }
        live
    }

    /// Push `line` into every live stream on `container` matching `pattern`
    ///
    /// Returns how many streams accepted the line.
    pub fn feed(&self, container: &str, pattern: &str, line: &str) -> usize {
        let mut state = self.state.lock();
        let mut delivered = 0;
        for stream in &mut state.streams {
            if stream.container != container || !stream.command_line.contains(pattern) {
                continue;
            }
            if stream.is_killed() {
                stream.tx = None;
                continue;
            }
            if let Some(tx) = &stream.tx {
                if tx.try_send(Ok(line.to_string())).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Push a mid-flight stream error into matching streams
    pub fn feed_error(&self, container: &str, pattern: &str, message: &str) -> usize {
        let mut state = self.state.lock();
        let mut delivered = 0;
        for stream in &mut state.streams {
            if stream.container == container && stream.command_line.contains(pattern) {
                if let Some(tx) = &stream.tx {
                    if tx
                        .try_send(Err(EngineError::Stream(message.to_string())))
                        .is_ok()
                    {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    fn lookup(&self, name: &str) -> Result<bool, EngineError> {
        self.state
            .lock()
            .containers
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::ContainerNotFound(name.to_string()))
    }

    fn lookup_running(&self, name: &str) -> Result<(), EngineError> {
        if self.lookup(name)? {
            Ok(())
        } else {
            Err(EngineError::ContainerNotFound(name.to_string()))
        }
    }

    fn apply_rules(&self, call: ExecCall) -> Result<ExecOutput, EngineError> {
        let mut state = self.state.lock();
        let line = call.command_line();
        state.calls.push(call);

        for rule in &mut state.rules {
            if !line.contains(&rule.pattern) || rule.remaining == Some(0) {
                continue;
            }
            if let Some(left) = rule.remaining.as_mut() {
                *left -= 1;
            }
            return rule.output.clone().map_err(EngineError::ExecFailed);
        }
        Ok(ExecOutput::default())
    }
}

fn failed_output() -> ExecOutput {
    ExecOutput {
        exit_code: 1,
        stdout: String::new(),
        stderr: "scripted failure".to_string(),
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn resolve(&self, identity: &str) -> Result<ContainerRef, EngineError> {
        self.lookup_running(identity)?;
        Ok(ContainerRef::new(format!("fake-{identity}"), identity))
    }

    async fn exec(
        &self,
        container: &ContainerRef,
        command: ExecCommand,
    ) -> Result<ExecOutput, EngineError> {
        self.lookup_running(&container.name)?;
        self.apply_rules(ExecCall {
            container: container.name.clone(),
            command,
            streaming: false,
        })
    }

    async fn exec_stream(
        &self,
        container: &ContainerRef,
        command: ExecCommand,
    ) -> Result<ExecStream, EngineError> {
        self.lookup_running(&container.name)?;
        let command_line = command.argv.join(" ");
        let output = self.apply_rules(ExecCall {
            container: container.name.clone(),
            command,
            streaming: true,
        })?;
        if !output.success() {
            return Err(EngineError::ExecFailed(output.failure_reason()));
        }

        let (tx, rx) = mpsc::channel(FAKE_STREAM_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();
        self.state.lock().streams.push(OpenStream {
            container: container.name.clone(),
            command_line,
            tx: Some(tx),
            kill_rx,
        });
        Ok(ExecStream::new(rx, KillHandle::new(kill_tx)))
    }

    async fn is_running(&self, container: &ContainerRef) -> Result<bool, EngineError> {
        self.lookup(&container.name)
    }
}
