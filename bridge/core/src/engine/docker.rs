//! Docker / Podman CLI engine
//!
//! Shells out to the runtime binary with `tokio::process`. Works wherever the
//! `docker` (or `podman`) CLI works, including remote contexts.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use super::{ContainerEngine, ContainerRef, ExecCommand, ExecOutput, ExecStream, KillHandle};
use crate::error::EngineError;

/// Buffered lines per streaming exec
const STREAM_CAPACITY: usize = 256;

/// Id and run state in one inspect round trip
const RESOLVE_FORMAT: &str = "{{.Id}} {{.State.Running}}";

/// Engine backed by the `docker` or `podman` command line
#[derive(Clone, Debug)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// Use the given runtime binary (`docker`, `podman`, or a path)
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runtime binary in use
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn exec_args(container: &ContainerRef, command: &ExecCommand, interactive: bool) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        for (key, value) in &command.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(container.id.clone());
        args.extend(command.argv.iter().cloned());
        args
    }

    fn inspect_args<'a>(target: &'a str, format: &'a str) -> [&'a str; 6] {
        ["inspect", "--type", "container", "--format", format, target]
    }

    async fn inspect(&self, target: &str, format: &str) -> Result<ExecOutput, EngineError> {
        let output = Command::new(&self.binary)
            .args(Self::inspect_args(target, format))
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Split `<id> <running>` inspect output
fn parse_resolve(stdout: &str) -> Option<(&str, bool)> {
    let mut fields = stdout.split_whitespace();
    let id = fields.next()?;
    let running = fields.next()? == "true";
    Some((id, running))
}

#[async_trait]
impl ContainerEngine for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn resolve(&self, identity: &str) -> Result<ContainerRef, EngineError> {
        let output = self.inspect(identity, RESOLVE_FORMAT).await?;
        if !output.success() {
            tracing::debug!(
                identity,
                reason = %output.failure_reason(),
                "Container did not resolve"
            );
            return Err(EngineError::ContainerNotFound(identity.to_string()));
        }
        match parse_resolve(&output.stdout) {
            Some((id, true)) => Ok(ContainerRef::new(id, identity)),
            Some((_, false)) => {
                tracing::debug!(identity, "Container exists but is not running");
                Err(EngineError::ContainerNotFound(identity.to_string()))
            }
            None => Err(EngineError::ContainerNotFound(identity.to_string())),
        }
    }

    async fn exec(
        &self,
        container: &ContainerRef,
        command: ExecCommand,
    ) -> Result<ExecOutput, EngineError> {
        let args = Self::exec_args(container, &command, false);
        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::ExecFailed(format!("{}: {e}", self.binary)))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn exec_stream(
        &self,
        container: &ContainerRef,
        command: ExecCommand,
    ) -> Result<ExecStream, EngineError> {
        let args = Self::exec_args(container, &command, true);
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::ExecFailed(format!("{}: {e}", self.binary)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::ExecFailed("stdout not captured".into()))?;

        let (line_tx, line_rx) = mpsc::channel(STREAM_CAPACITY);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let container_name = container.name.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    // Fired or dropped: either way the owner is gone
                    _ = &mut kill_rx => {
                        if let Err(e) = child.kill().await {
                            tracing::debug!(error = %e, container = %container_name, "Exec child already gone");
                        }
                        break;
                    }
                    next = lines.next_line() => match next {
                        Ok(Some(line)) => {
                            if line_tx.send(Ok(line)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = line_tx.send(Err(EngineError::Stream(e.to_string()))).await;
                            break;
                        }
                    }
                }
            }
            let _ = child.wait().await;
            tracing::debug!(container = %container_name, "Exec stream closed");
        });

        Ok(ExecStream::new(line_rx, KillHandle::new(kill_tx)))
    }

    async fn is_running(&self, container: &ContainerRef) -> Result<bool, EngineError> {
        let output = self.inspect(&container.id, "{{.State.Running}}").await?;
        if !output.success() {
            return Err(EngineError::ContainerNotFound(container.name.clone()));
        }
        Ok(output.stdout.trim() == "true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_args_layout() {
        let container = ContainerRef::new("abc123", "worker-1");
        let command = ExecCommand::shell("echo hi").with_env("BRIDGE_MESSAGE", "{}");
        let args = DockerCli::exec_args(&container, &command, false);
        assert_eq!(
            args,
            vec!["exec", "-e", "BRIDGE_MESSAGE={}", "abc123", "sh", "-c", "echo hi"]
        );
    }

    #[test]
    fn test_streaming_exec_is_interactive() {
        let container = ContainerRef::new("abc123", "worker-1");
        let args = DockerCli::exec_args(&container, &ExecCommand::shell("true"), true);
        assert_eq!(args[..2], ["exec".to_string(), "-i".to_string()]);
    }

    #[test]
    fn test_inspect_is_limited_to_containers() {
        let args = DockerCli::inspect_args("worker-1", RESOLVE_FORMAT);
        assert_eq!(args[..3], ["inspect", "--type", "container"]);
        assert_eq!(args[5], "worker-1");
    }

    #[test]
    fn test_parse_resolve_output() {
        assert_eq!(parse_resolve("abc123 true\n"), Some(("abc123", true)));
        assert_eq!(parse_resolve("abc123 false\n"), Some(("abc123", false)));
        assert_eq!(parse_resolve(""), None);
        assert_eq!(parse_resolve("abc123"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let engine = DockerCli::new("/nonexistent/sandbox-bridge-docker");
        let result = engine.resolve("worker-1").await;
        assert!(matches!(result, Err(EngineError::Io(_))));
    }
}
