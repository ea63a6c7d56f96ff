/// Verdict Classifier
///
/// **Core Responsibility:**
/// Map a failure returned by a phase handler into a verdict, a comment and a
/// termination decision.
///
/// **Declared vs undeclared:**
/// - Declared failures (`GradingFailure`) are grading outcomes: they carry a
///   verdict and a human-readable comment.
/// - Anything else is undeclared and is never classified; it is handed back
///   untouched so the orchestrator can propagate it.
///
/// Classification is a pure function. Handlers return failures as values,
/// there is no non-local control transfer.

use crate::process::ExecError;
use grader_common::types::Verdict;
use thiserror::Error;

/// A declared grading failure
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{verdict}: {comment}")]
pub struct GradingFailure {
    pub verdict: Verdict,
    pub comment: String,
}

impl GradingFailure {
    pub fn new(verdict: Verdict, comment: impl Into<String>) -> Self {
        Self {
            verdict,
            comment: comment.into(),
        }
    }

    pub fn runtime(comment: impl Into<String>) -> Self {
        Self::new(Verdict::RuntimeError, comment)
    }

    pub fn compile(comment: impl Into<String>) -> Self {
        Self::new(Verdict::CompileError, comment)
    }

    pub fn wrong_answer(comment: impl Into<String>) -> Self {
        Self::new(Verdict::WrongAnswer, comment)
    }

    pub fn unknown(comment: impl Into<String>) -> Self {
        Self::new(Verdict::UnknownError, comment)
    }

    /// Surfaced by the process collaborator when a wall-clock limit is hit
    pub fn time_limit(comment: impl Into<String>) -> Self {
        Self::new(Verdict::TimeLimitExceeded, comment)
    }
}

impl From<ExecError> for GradingFailure {
    fn from(err: ExecError) -> Self {
        match &err {
            ExecError::Timeout { .. } => GradingFailure::time_limit(err.to_string()),
            ExecError::Spawn { .. } | ExecError::Io(_) => GradingFailure::runtime(err.to_string()),
        }
    }
}

/// What a phase handler can fail with
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error(transparent)]
    Grading(#[from] GradingFailure),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl From<crate::KernelError> for PhaseError {
    fn from(err: crate::KernelError) -> Self {
        PhaseError::Fatal(err.into())
    }
}

impl From<ExecError> for PhaseError {
    fn from(err: ExecError) -> Self {
        PhaseError::Grading(err.into())
    }
}

/// Where the failure was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prework,
    Case,
    Postwork,
}

#[derive(Debug)]
pub enum Classification {
    /// A grading outcome; `terminate_job` decides whether the whole job stops
    Declared {
        failure: GradingFailure,
        terminate_job: bool,
    },
    /// Not a grading outcome; must reach the caller unmodified
    Undeclared(anyhow::Error),
}

/// Classify a phase failure.
///
/// Declared failures raised in prework are terminal for the job; those raised
/// by a single case are local to that case. A `GradingFailure` that travelled
/// inside an `anyhow::Error` (e.g. via `?` in a helper) is still recognised.
pub fn classify(err: PhaseError, stage: Stage) -> Classification {
    let failure = match err {
        PhaseError::Grading(failure) => failure,
        PhaseError::Fatal(err) => match err.downcast::<GradingFailure>() {
            Ok(failure) => failure,
            Err(err) => return Classification::Undeclared(err),
        },
    };

    Classification::Declared {
        failure,
        terminate_job: stage == Stage::Prework,
    }
}
