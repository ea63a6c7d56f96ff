/// Job Orchestrator - High-Level Phase Sequencing
///
/// **Responsibility:**
/// Own the job-wide state and drive `prework → run → postwork`.
///
/// **State machine:**
/// `Init → Prework → Run → Postwork → Done`, with `Terminated` absorbing from
/// `Prework` or `Run`, and `Failed` when an undeclared failure propagates.
///
/// **Failure handling:**
/// - Declared failure in prework: verdict/comment from the failure, score 0,
///   `Terminated`, run and postwork skipped
/// - Undeclared failure anywhere: propagated to the caller of `start`
/// - Termination requested by a run callback: stop dispatching, skip postwork
///
/// Prework and postwork run on the calling task; only the run phase fans out.

use crate::error::KernelError;
use crate::phase::Phase;
use crate::runner::{self, RunShared, Termination};
use crate::tracker::{job_activity, ActivityTracker, StatementDraft, Verb};
use crate::verdict::{classify, Classification, GradingFailure, Stage};
use chrono::Utc;
use grader_common::config::JobConfig;
use grader_common::types::{Extensions, JobOutcome, ResultRecord, TestCase, Verdict};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Init,
    Prework,
    Run,
    Postwork,
    Done,
    Terminated,
    Failed,
}

impl JobState {
    /// Job-wide fields may only change outside the run phase and before settling
    fn is_mutable(&self) -> bool {
        matches!(self, JobState::Init | JobState::Prework | JobState::Postwork)
    }
}

/// Ordered test cases with unique names
#[derive(Debug, Clone, Default)]
pub struct TestCases {
    cases: Vec<Arc<TestCase>>,
}

impl TestCases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cases(cases: impl IntoIterator<Item = TestCase>) -> Result<Self, KernelError> {
        let mut collection = Self::new();
        for case in cases {
            collection.push(case)?;
        }
        Ok(collection)
    }

    pub fn push(&mut self, case: TestCase) -> Result<(), KernelError> {
        if self.get(&case.name).is_some() {
            return Err(KernelError::DuplicateTestCase(case.name));
        }
        self.cases.push(Arc::new(case));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TestCase> {
        self.cases.iter().map(Arc::as_ref).find(|case| case.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.iter().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Sum of weights
    pub fn max_score(&self) -> f64 {
        self.cases.iter().map(|case| case.weight).sum()
    }

    pub(crate) fn shared(&self) -> Vec<Arc<TestCase>> {
        self.cases.clone()
    }
}

pub struct Job {
    id: Uuid,
    config: JobConfig,
    phase: Arc<dyn Phase>,
    tracker: Arc<ActivityTracker>,
    testcases: TestCases,
    summary: Vec<ResultRecord>,
    verdict: Verdict,
    score: f64,
    comment: String,
    detail: Option<Value>,
    state: JobState,
    termination: Arc<Termination>,
    root_statement: Uuid,
    root_extensions: Extensions,
}

impl Job {
    pub fn new(config: JobConfig, phase: Arc<dyn Phase>, tracker: Arc<ActivityTracker>) -> Self {
        let root_statement = tracker.allocate_id();
        Self {
            id: Uuid::new_v4(),
            config,
            phase,
            tracker,
            testcases: TestCases::new(),
            summary: Vec::new(),
            verdict: Verdict::UnknownError,
            score: 0.0,
            comment: String::new(),
            detail: None,
            state: JobState::Init,
            termination: Arc::new(Termination::default()),
            root_statement,
            root_extensions: Extensions::new(),
        }
    }

    /// Run all phases.
    ///
    /// `workers <= 1` grades cases sequentially in collection order; larger
    /// values grade up to `workers` cases concurrently.
    ///
    /// ## Returns
    /// `Ok(())` once the job is `Done` or `Terminated`; the undeclared failure
    /// otherwise, after every case already in flight has been recorded.
    pub async fn start(&mut self, workers: usize) -> anyhow::Result<()> {
        if self.state != JobState::Init {
            return Err(KernelError::AlreadyStarted(self.state).into());
        }

        let phase = Arc::clone(&self.phase);
        info!(job_id = %self.id, phase = phase.name(), workers, "Starting job");

        // Step 1: prework
        self.state = JobState::Prework;
        if let Err(err) = phase.prework(self).await {
            match classify(err, Stage::Prework) {
                Classification::Declared { failure, terminate_job } => {
                    if terminate_job {
                        self.termination.request(failure);
                    } else {
                        self.apply_failure(failure);
                    }
                }
                Classification::Undeclared(err) => return Err(self.settle_failed(err)),
            }
        }
        if self.termination.is_set() {
            self.settle_terminated();
            return Ok(());
        }
        if self.testcases.is_empty() {
            warn!(job_id = %self.id, "Prework produced no test cases");
        }
        info!(
            job_id = %self.id,
            test_cases = self.testcases.len(),
            max_score = self.testcases.max_score(),
            "Prework complete"
        );

        // Step 2: run every case
        self.state = JobState::Run;
        let shared = Arc::new(RunShared {
            job_id: self.id,
            config: self.config.clone(),
            actor: self.config.actor().to_string(),
            root_statement: self.root_statement,
            tracker: Arc::clone(&self.tracker),
            termination: Arc::clone(&self.termination),
        });
        let report = runner::run_cases(shared, self.testcases.shared(), Arc::clone(&phase), workers).await;
        self.summary = report.records;
        info!(
            job_id = %self.id,
            dispatched = report.dispatched,
            recorded = self.summary.len(),
            "Run phase complete"
        );

        if let Some(err) = report.fatal {
            return Err(self.settle_failed(err));
        }
        if self.termination.is_set() {
            self.settle_terminated();
            return Ok(());
        }

        // Step 3: postwork
        self.state = JobState::Postwork;
        if let Err(err) = phase.postwork(self).await {
            match classify(err, Stage::Postwork) {
                Classification::Declared { failure, terminate_job } => {
                    warn!(job_id = %self.id, verdict = %failure.verdict, "Postwork reported a grading failure");
                    if terminate_job {
                        self.termination.request(failure);
                        self.settle_terminated();
                        return Ok(());
                    }
                    self.apply_failure(failure);
                }
                Classification::Undeclared(err) => return Err(self.settle_failed(err)),
            }
        }

        self.state = JobState::Done;
        self.record_root(StatementDraft::new(Verb::graded(), self.config.actor(), job_activity(&self.id)));
        info!(
            job_id = %self.id,
            verdict = %self.verdict,
            score = self.score,
            max_score = self.testcases.max_score(),
            "Job complete"
        );
        Ok(())
    }

    fn apply_failure(&mut self, failure: GradingFailure) {
        self.verdict = failure.verdict;
        self.comment = failure.comment;
        self.score = 0.0;
    }

    fn settle_terminated(&mut self) {
        let failure = self
            .termination
            .reason()
            .unwrap_or_else(|| GradingFailure::unknown("grading was terminated"));
        warn!(
            job_id = %self.id,
            state = ?self.state,
            verdict = %failure.verdict,
            comment = %failure.comment,
            "Job terminated"
        );
        self.apply_failure(failure);
        self.state = JobState::Terminated;
        self.record_root(
            StatementDraft::new(Verb::graded(), self.config.actor(), job_activity(&self.id))
                .result_extension("terminated", true),
        );
    }

    fn settle_failed(&mut self, err: anyhow::Error) -> anyhow::Error {
        error!(job_id = %self.id, state = ?self.state, error = %err, "Job aborted by undeclared failure");
        self.state = JobState::Failed;
        self.record_root(
            StatementDraft::new(Verb::graded(), self.config.actor(), job_activity(&self.id))
                .result_extension("exception", err.to_string()),
        );
        err
    }

    fn record_root(&self, draft: StatementDraft) {
        let draft = draft
            .score(self.score)
            .result_extension("verdict", self.verdict.as_str())
            .context_extensions(self.root_extensions.clone());
        self.tracker.record(self.root_statement, draft);
    }

    fn ensure_mutable(&self) -> Result<(), KernelError> {
        if self.state.is_mutable() {
            Ok(())
        } else {
            Err(KernelError::Sealed(self.state))
        }
    }

    pub fn set_testcases(&mut self, testcases: TestCases) -> Result<(), KernelError> {
        self.ensure_mutable()?;
        self.testcases = testcases;
        Ok(())
    }

    pub fn add_testcase(&mut self, case: TestCase) -> Result<(), KernelError> {
        self.ensure_mutable()?;
        self.testcases.push(case)
    }

    pub fn set_verdict(&mut self, verdict: Verdict) -> Result<(), KernelError> {
        self.ensure_mutable()?;
        self.verdict = verdict;
        Ok(())
    }

    pub fn set_score(&mut self, score: f64) -> Result<(), KernelError> {
        self.ensure_mutable()?;
        self.score = score;
        Ok(())
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) -> Result<(), KernelError> {
        self.ensure_mutable()?;
        self.comment = comment.into();
        Ok(())
    }

    pub fn set_detail(&mut self, detail: Value) -> Result<(), KernelError> {
        self.ensure_mutable()?;
        self.detail = Some(detail);
        Ok(())
    }

    pub fn config_mut(&mut self) -> Result<&mut JobConfig, KernelError> {
        self.ensure_mutable()?;
        Ok(&mut self.config)
    }

    /// Attach a context extension to the job's root statement
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), KernelError> {
        self.ensure_mutable()?;
        self.root_extensions.insert(key.into(), value.into());
        Ok(())
    }

    /// Stop the job without raising; takes effect at the next phase boundary
    pub fn terminate(&mut self, failure: GradingFailure) -> Result<(), KernelError> {
        self.ensure_mutable()?;
        self.termination.request(failure);
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn phase_name(&self) -> &str {
        self.phase.name()
    }

    pub fn get_testcases(&self) -> &TestCases {
        &self.testcases
    }

    /// Results in arrival order; sort explicitly for deterministic reporting
    pub fn get_summary(&self) -> &[ResultRecord] {
        &self.summary
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn detail(&self) -> Option<&Value> {
        self.detail.as_ref()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_set()
    }

    pub fn root_statement_id(&self) -> Uuid {
        self.root_statement
    }

    pub fn tracker(&self) -> &Arc<ActivityTracker> {
        &self.tracker
    }

    /// The committed outputs the platform reads back
    pub fn outcome(&self) -> JobOutcome {
        JobOutcome {
            job_id: self.id,
            verdict: self.verdict,
            score: self.score,
            comment: self.comment.clone(),
            detail: self.detail.clone(),
            finished_at: Utc::now(),
        }
    }
}
