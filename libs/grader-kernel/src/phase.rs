/// Phase Handlers - the per-assignment grading strategy
///
/// A phase supplies three callbacks:
/// - `prework`: populate test cases and job-wide settings (may terminate)
/// - `run`: grade one case, called once per case, possibly concurrently
/// - `postwork`: aggregate the summary into the job's verdict and score
///
/// Handlers are registered by name and resolved from the job configuration.

use crate::aggregate;
use crate::error::KernelError;
use crate::job::Job;
use crate::report::TextReport;
use crate::runner::CaseContext;
use crate::verdict::PhaseError;
use async_trait::async_trait;
use grader_common::config::JobConfig;
use grader_common::types::{ResultRecord, TestCase};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait Phase: Send + Sync {
    /// Name used in the `phase` configuration key
    fn name(&self) -> &str;

    async fn prework(&self, job: &mut Job) -> Result<(), PhaseError>;

    /// Grade one case. Must not touch job-wide state beyond what `ctx` offers.
    async fn run(&self, ctx: &CaseContext, case: &TestCase) -> Result<ResultRecord, PhaseError>;

    /// Defaults to a plain sum of clipped case scores
    async fn postwork(&self, job: &mut Job) -> Result<(), PhaseError> {
        aggregate::finalize_plain_sum(job, &TextReport)?;
        Ok(())
    }
}

/// Name → handler lookup
#[derive(Default, Clone)]
pub struct PhaseRegistry {
    phases: HashMap<String, Arc<dyn Phase>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `phase` under its own name, replacing any previous entry
    pub fn register(&mut self, phase: Arc<dyn Phase>) -> &mut Self {
        let name = phase.name().to_string();
        debug!(phase = %name, "Registering phase handler");
        self.phases.insert(name, phase);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Phase>, KernelError> {
        self.phases
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::UnknownPhase(name.to_string()))
    }

    /// Resolve the handler named by the `phase` key
    pub fn resolve_for(&self, config: &JobConfig) -> Result<Arc<dyn Phase>, KernelError> {
        let name = config.phase().ok_or(KernelError::MissingPhase)?;
        self.resolve(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.phases.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
