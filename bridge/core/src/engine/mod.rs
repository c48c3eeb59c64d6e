//! Container Engine Seam
//!
//! The Bridge never talks to Docker (or anything else) directly. Everything
//! it needs from the engine fits in four calls:
//!
//! - [`ContainerEngine::resolve`]: identity → live container reference
//! - [`ContainerEngine::exec`]: run a one-shot command, collect its output
//! - [`ContainerEngine::exec_stream`]: run a long-lived command, stream lines
//! - [`ContainerEngine::is_running`]: inspect run state
//!
//! Implementations:
//! - [`DockerCli`]: drives the `docker` / `podman` binaries
//! - [`FakeEngine`]: scriptable in-memory engine for tests

mod docker;
mod fake;

pub use docker::DockerCli;
pub use fake::{ExecCall, FakeEngine};

use std::fmt;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::EngineError;

/// A resolved container
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    /// Engine-level id
    pub id: String,
    /// Logical identity the caller used
    pub name: String,
}

impl ContainerRef {
    /// Create a reference
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A command to run inside a container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecCommand {
    /// Program and arguments
    pub argv: Vec<String>,
    /// Extra environment for the command
    pub env: Vec<(String, String)>,
}

impl ExecCommand {
    /// `sh -c <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            argv: vec!["sh".into(), "-c".into(), script.into()],
            env: Vec::new(),
        }
    }

    /// Set `$0` of a shell command so the process can be found by `pkill -f`
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.argv.push(tag.into());
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The script of a `sh -c` command, if this is one
    #[must_use]
    pub fn script(&self) -> Option<&str> {
        match self.argv.as_slice() {
            [sh, flag, script, ..] if sh == "sh" && flag == "-c" => Some(script),
            _ => None,
        }
    }
}

/// Collected output of a one-shot exec
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code (non-zero means the command failed)
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited with status 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Best short description of a failure
    #[must_use]
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {}", self.exit_code)
        } else {
            format!("exit code {}: {stderr}", self.exit_code)
        }
    }
}

/// Kills the local side of a streaming exec when fired or dropped
#[derive(Debug)]
pub struct KillHandle(Option<oneshot::Sender<()>>);

impl KillHandle {
    /// Wrap the sender half the engine listens on
    #[must_use]
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self(Some(tx))
    }

    /// Request termination. Idempotent.
    pub fn kill(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }

    /// Whether [`KillHandle::kill`] has been called
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.0.is_none()
    }
}

/// Lines (or mid-flight errors) of a streaming exec
pub type ExecLines = mpsc::Receiver<Result<String, EngineError>>;

/// Attached output of a long-running exec
pub struct ExecStream {
    lines: ExecLines,
    kill: KillHandle,
}

impl ExecStream {
    /// Assemble a stream from its parts
    #[must_use]
    pub fn new(lines: ExecLines, kill: KillHandle) -> Self {
        Self { lines, kill }
    }

    /// Next line, `None` once the remote command's output has ended
    pub async fn next_line(&mut self) -> Option<Result<String, EngineError>> {
        self.lines.recv().await
    }

    /// Separate the line receiver from the kill handle
    #[must_use]
    pub fn split(self) -> (ExecLines, KillHandle) {
        (self.lines, self.kill)
    }
}

/// Container engine capability consumed by the Bridge
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine name for diagnostics
    fn name(&self) -> &str;

    /// Resolve a logical identity to a live container
    ///
    /// # Errors
    ///
    /// `EngineError::ContainerNotFound` if nothing answers to `identity` or
    /// the container is not running.
    async fn resolve(&self, identity: &str) -> Result<ContainerRef, EngineError>;

    /// Run a command to completion and collect its output
    ///
    /// A non-zero exit code is not an error at this level; callers inspect
    /// [`ExecOutput::exit_code`].
    async fn exec(
        &self,
        container: &ContainerRef,
        command: ExecCommand,
    ) -> Result<ExecOutput, EngineError>;

    /// Start a command and attach to its output line by line
    async fn exec_stream(
        &self,
        container: &ContainerRef,
        command: ExecCommand,
    ) -> Result<ExecStream, EngineError>;

    /// Whether the container is currently running
    async fn is_running(&self, container: &ContainerRef) -> Result<bool, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_command_shape() {
        let cmd = ExecCommand::shell("echo hi").with_tag("bridge-tag");
        assert_eq!(cmd.argv, vec!["sh", "-c", "echo hi", "bridge-tag"]);
        assert_eq!(cmd.script(), Some("echo hi"));
    }

    #[test]
    fn test_script_of_non_shell_command() {
        let cmd = ExecCommand {
            argv: vec!["cat".into(), "/etc/hostname".into()],
            env: Vec::new(),
        };
        assert_eq!(cmd.script(), None);
    }

    #[test]
    fn test_failure_reason() {
        let out = ExecOutput {
            exit_code: 124,
            stdout: String::new(),
            stderr: "  \n".into(),
        };
        assert_eq!(out.failure_reason(), "exit code 124");

        let out = ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "mkfifo: Permission denied\n".into(),
        };
        assert_eq!(out.failure_reason(), "exit code 1: mkfifo: Permission denied");
    }

    #[tokio::test]
    async fn test_kill_handle_is_idempotent() {
        let (tx, rx) = oneshot::channel();
        let mut handle = KillHandle::new(tx);
        handle.kill();
        handle.kill();
        assert!(handle.is_killed());
        assert!(rx.await.is_ok());
    }
}
