//! Built-in phase handlers and the helpers they share.

mod metric;
mod stdio;

use metric::MetricPhase;
use stdio::StdioPhase;

use anyhow::{anyhow, Context};
use grader_common::config::JobConfig;
use grader_common::types::TestCase;
use grader_kernel::process::{self, ExecCommand, ExecError, ExecOutput};
use grader_kernel::{CaseContext, GradingFailure, Job, PhaseError, PhaseRegistry};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Shell line building the submission inside `submit_dir` (optional)
pub const COMPILE_COMMAND: &str = "compile_command";
/// Shell line run once per case with the case input on stdin
pub const RUN_COMMAND: &str = "run_command";
/// Total points split across discovered cases
pub const TOTAL_SCORE: &str = "total_score";

/// Exit status a POSIX shell reports when the command does not exist
const SHELL_NOT_FOUND: i32 = 127;

pub fn registry() -> PhaseRegistry {
    let mut registry = PhaseRegistry::new();
    registry
        .register(Arc::new(StdioPhase))
        .register(Arc::new(MetricPhase));
    registry
}

/// Run the configured compile command, if any, in the submit directory
pub(crate) async fn compile_submission(job: &mut Job) -> Result<(), PhaseError> {
    let Some(line) = job.config().get_str(COMPILE_COMMAND) else {
        debug!(job_id = %job.id(), "No compile command configured");
        return Ok(());
    };

    let command = ExecCommand::shell(line).current_dir(job.config().submit_dir());
    info!(job_id = %job.id(), command = %line, "Compiling submission");
    let output = process::exec(&command, None, None)
        .await
        .map_err(|e| GradingFailure::compile(e.to_string()))?;

    job.annotate("compile_ms", output.elapsed.as_millis() as u64)?;
    if !output.success() {
        return Err(GradingFailure::compile(failure_text(&output)).into());
    }
    Ok(())
}

pub(crate) async fn read_case_file(path: Option<&Path>) -> anyhow::Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        None => Ok(String::new()),
    }
}

/// Run `run_command` on the case input within the configured time limit.
///
/// A command that cannot be started at all terminates the job.
pub(crate) async fn execute_case(ctx: &CaseContext, case: &TestCase) -> Result<ExecOutput, PhaseError> {
    let config: &JobConfig = ctx.config();
    let line = config
        .get_str(RUN_COMMAND)
        .ok_or_else(|| anyhow!("`{RUN_COMMAND}` is not configured"))?;
    let input = read_case_file(case.input_src.as_deref()).await?;

    let command = ExecCommand::shell(line).current_dir(config.submit_dir());
    let output = match process::exec(&command, Some(&input), Some(config.time_limit())).await {
        Ok(output) => output,
        Err(err @ ExecError::Spawn { .. }) => {
            let failure = GradingFailure::runtime(err.to_string());
            ctx.terminate(failure.clone());
            return Err(failure.into());
        }
        Err(err) => return Err(err.into()),
    };

    ctx.annotate("exit_code", output.exit_code);
    ctx.annotate("run_ms", output.elapsed.as_millis() as u64);

    match output.exit_code {
        Some(0) => Ok(output),
        Some(SHELL_NOT_FOUND) => {
            let failure = GradingFailure::runtime(format!("`{line}` could not be started: {}", output.stderr.trim()));
            ctx.terminate(failure.clone());
            Err(failure.into())
        }
        _ => Err(GradingFailure::runtime(failure_text(&output)).into()),
    }
}

/// Exit status plus the tail of stderr, for comments and details
fn failure_text(output: &ExecOutput) -> String {
    let status = match output.exit_code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    };
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        return status;
    }

    let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    format!("{status}\n{}", tail.join("\n"))
}
