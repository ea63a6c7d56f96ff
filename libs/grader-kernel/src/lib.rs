pub mod aggregate;
pub mod error;
pub mod job;
pub mod phase;
pub mod process;
pub mod report;
pub mod runner;
pub mod scoring;
pub mod tracker;
pub mod verdict;


pub use error::KernelError;
pub use job::{Job, JobState, TestCases};
pub use phase::{Phase, PhaseRegistry};
pub use runner::CaseContext;
pub use tracker::{ActivityTracker, Statement, StatementDraft, Verb};
pub use verdict::{GradingFailure, PhaseError};
