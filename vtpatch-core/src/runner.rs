//! External command execution with explicit timeouts.
//!
//! The apply strategies and the rollback engine only see [`CommandRunner`],
//! so tests can substitute a scripted runner for the real `patch` binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct CommandRequest<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    pub cwd: &'a Path,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<&'a str>,
    pub timeout: Duration,
}

impl CommandRequest<'_> {
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last non-empty line of stderr, falling back to stdout, for error
    /// messages.
    pub fn diagnostics(&self) -> String {
        let pick = |text: &str| {
            text.lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map(|line| line.trim().to_string())
        };
        pick(&self.stderr)
            .or_else(|| pick(&self.stdout))
            .unwrap_or_else(|| "no output".to_string())
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. A timeout is an error, not an output.
    async fn run(&self, request: CommandRequest<'_>) -> Result<CommandOutput>;
}

/// Runs commands as child processes on the tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, request: CommandRequest<'_>) -> Result<CommandOutput> {
        let command_line = request.display();
        let mut cmd = Command::new(request.program);
        cmd.args(&request.args)
            .current_dir(request.cwd)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to run command: {command_line}"))?;
        let stdin_pipe = child.stdin.take();
        let input = request.stdin;
        let limit = request.timeout;

        let feed = async move {
            if let (Some(input), Some(mut pipe)) = (input, stdin_pipe) {
                // The child may exit before reading everything; its exit
                // status is what counts.
                if let Err(err) = pipe.write_all(input.as_bytes()).await {
                    debug!(error = %err, "Child closed stdin early");
                }
                drop(pipe);
            }
        };

        let (_, output) = timeout(limit, async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .map_err(|_| {
            warn!(command = %command_line, timeout_ms = limit.as_millis() as u64, "Command timed out");
            anyhow!("command '{command_line}' timed out after {:.1}s", limit.as_secs_f64())
        })?;
        let output = output.with_context(|| format!("failed to run command: {command_line}"))?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        debug!(command = %command_line, exit_code = ?result.exit_code, "Command finished");
        Ok(result)
    }
}

/// Locate `program` on `PATH` (or accept it as given when it is a path).
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    match which::which(program) {
        Ok(path) => {
            debug!(command = program, path = %path.display(), "Resolved external tool");
            Some(path)
        }
        Err(_) => {
            warn!(command = program, "Command not found in PATH");
            None
        }
    }
}
