/// External process collaborator
///
/// Contract: `exec(command, input?, timeout?) -> {exit_code, stdout, stderr, elapsed}`.
/// A timeout surfaces as `ExecError::Timeout`, a command that cannot be started
/// as `ExecError::Spawn`. Both convert into declared grading failures.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("`{command}` exceeded the time limit of {}ms", .limit.as_millis())]
    Timeout { command: String, limit: Duration },
    #[error("cannot start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error while running process: {0}")]
    Io(#[from] std::io::Error),
}

/// A command line plus the directory it runs in
#[derive(Debug, Clone)]
pub struct ExecCommand {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
}

impl ExecCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Run a shell command line through `sh -c`
    pub fn shell(line: &str) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Human-readable form used in logs and comments
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `command`, feeding `input` on stdin, bounded by `timeout`.
///
/// The child is killed when the limit is hit (the future owning it is dropped
/// with `kill_on_drop`).
pub async fn exec(
    command: &ExecCommand,
    input: Option<&str>,
    timeout: Option<Duration>,
) -> Result<ExecOutput, ExecError> {
    let shown = command.display();
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.cwd {
        cmd.current_dir(dir);
    }

    debug!(command = %shown, "Spawning process");
    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        command: shown.clone(),
        source,
    })?;

    if let (Some(bytes), Some(mut stdin)) = (input.map(str::to_owned), child.stdin.take()) {
        tokio::spawn(async move {
            // A child that exits without reading stdin closes the pipe early
            let _ = stdin.write_all(bytes.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ExecError::Timeout {
                    command: shown,
                    limit,
                })
            }
        },
        None => child.wait_with_output().await?,
    };

    Ok(ExecOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        elapsed: start.elapsed(),
    })
}
