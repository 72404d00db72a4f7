//! Command runner abstraction over `tokio::process`.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info};

use super::InstallerError;

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> = Pin<Box<dyn Future<Output = Result<CommandOutput, InstallerError>> + Send + 'a>>;

/// A single external command invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables for the child process.
    pub env: Vec<(String, String)>,
    /// The child is killed when it runs past this instant.
    pub deadline: Instant,
    /// Tag attached to every forwarded output line, usually the host.
    pub log_tag: String,
}

impl CommandSpec {
    /// Returns a shell-like command string for logs and assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Set when the process was killed at the deadline.
    pub timed_out: bool,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0)) && !self.timed_out
    }

    /// Output of a process killed at its deadline.
    #[must_use]
    pub const fn timed_out() -> Self {
        Self {
            code: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        }
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion or until its deadline.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Spawn`] if the command cannot be started.
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a>;
}

/// Runner that spawns real processes and streams their output to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a> {
        Box::pin(async move {
            debug!(host = %spec.log_tag, program = %spec.program, "running command");
            timeout_at(spec.deadline, run_child(spec))
                .await
                .unwrap_or_else(|_| Ok(CommandOutput::timed_out()))
        })
    }
}

async fn run_child(spec: &CommandSpec) -> Result<CommandOutput, InstallerError> {
    let spawn_error = |err: std::io::Error| InstallerError::Spawn {
        program: spec.program.clone(),
        message: err.to_string(),
    };

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .envs(spec.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(spawn_error)?;

    let (stdout, stderr) = tokio::join!(
        forward_lines(child.stdout.take(), &spec.log_tag, "stdout"),
        forward_lines(child.stderr.take(), &spec.log_tag, "stderr"),
    );
    let status = child.wait().await.map_err(spawn_error)?;

    Ok(CommandOutput {
        code: status.code(),
        stdout,
        stderr,
        timed_out: false,
    })
}

async fn forward_lines<R>(reader: Option<R>, tag: &str, stream: &'static str) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(source) = reader else {
        return String::new();
    };
    let mut lines = BufReader::new(source).lines();
    let mut captured = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(host = tag, stream, "{line}");
        captured.push_str(&line);
        captured.push('\n');
    }
    captured
}
