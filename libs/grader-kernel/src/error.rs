use crate::job::JobState;
use thiserror::Error;

/// Misuse of the kernel API. Never a grading outcome.
#[derive(Debug, Error, PartialEq)]
pub enum KernelError {
    #[error("duplicate test case name `{0}`")]
    DuplicateTestCase(String),

    #[error("job can no longer be modified in state {0:?}")]
    Sealed(JobState),

    #[error("job was already started (state {0:?})")]
    AlreadyStarted(JobState),

    #[error("no phase registered under `{0}`")]
    UnknownPhase(String),

    #[error("configuration does not select a phase")]
    MissingPhase,
}
