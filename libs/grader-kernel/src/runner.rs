/// Concurrent Runner - per-case execution across a bounded worker pool
///
/// **Contract:**
/// - `workers <= 1`: cases run one after another on the calling task, in
///   collection order
/// - `workers > 1`: up to `workers` cases in flight; completion order is
///   unspecified
/// - one statement per dispatched case, and one result record unless the
///   case failed with an undeclared error
/// - the termination flag is checked before every dispatch (best effort)
///
/// **Undeclared failures (drain-then-raise):**
/// Once a case fails with an undeclared error no new case is dispatched.
/// Cases already in flight run to completion and keep their records and
/// statements; the first undeclared error is then handed back. A panic inside
/// a run callback counts as an undeclared failure of that case.

use crate::phase::Phase;
use crate::tracker::{case_activity, ActivityTracker, Statement, StatementDraft, Verb};
use crate::verdict::{classify, Classification, GradingFailure, PhaseError, Stage};
use futures_util::FutureExt;
use grader_common::config::JobConfig;
use grader_common::types::{Extensions, ResultRecord, TestCase};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared termination flag plus the first reason given for it
#[derive(Debug, Default)]
pub(crate) struct Termination {
    flag: AtomicBool,
    reason: Mutex<Option<GradingFailure>>,
}

impl Termination {
    /// First reason wins; later requests only keep the flag raised
    pub(crate) fn request(&self, failure: GradingFailure) {
        let mut reason = self.reason.lock().unwrap_or_else(|p| p.into_inner());
        if reason.is_none() {
            *reason = Some(failure);
        }
        self.flag.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub(crate) fn reason(&self) -> Option<GradingFailure> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Read-mostly job state visible to every worker during the run phase
pub(crate) struct RunShared {
    pub job_id: Uuid,
    pub config: JobConfig,
    pub actor: String,
    pub root_statement: Uuid,
    pub tracker: Arc<ActivityTracker>,
    pub termination: Arc<Termination>,
}

/// What a run callback sees of its job while grading one case
pub struct CaseContext {
    shared: Arc<RunShared>,
    statement_id: Uuid,
    annotations: Mutex<Extensions>,
}

impl CaseContext {
    fn new(shared: Arc<RunShared>, statement_id: Uuid) -> Self {
        Self {
            shared,
            statement_id,
            annotations: Mutex::new(Extensions::new()),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.shared.job_id
    }

    pub fn config(&self) -> &JobConfig {
        &self.shared.config
    }

    pub fn actor(&self) -> &str {
        &self.shared.actor
    }

    /// Id the case statement will be recorded under
    pub fn statement_id(&self) -> Uuid {
        self.statement_id
    }

    /// Attach a context extension to this case's statement
    pub fn annotate(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.annotations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.into(), value.into());
    }

    /// Record an ad-hoc event as a child of this case's statement
    pub fn track(&self, draft: StatementDraft) -> Arc<Statement> {
        self.shared.tracker.new_statement(draft.parent(self.statement_id))
    }

    /// Ask the runner to stop issuing new cases and the job to settle as
    /// terminated with `failure`
    pub fn terminate(&self, failure: GradingFailure) {
        warn!(
            job_id = %self.shared.job_id,
            verdict = %failure.verdict,
            comment = %failure.comment,
            "Termination requested by run callback"
        );
        self.shared.termination.request(failure);
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.termination.is_set()
    }

    fn into_annotations(self) -> Extensions {
        self.annotations.into_inner().unwrap_or_else(|p| p.into_inner())
    }
}

/// Outcome of the run phase
pub(crate) struct RunReport {
    /// One record per case that produced one, in arrival order
    pub records: Vec<ResultRecord>,
    pub dispatched: usize,
    /// First undeclared failure, if any
    pub fatal: Option<anyhow::Error>,
}

enum CaseRun {
    Recorded(ResultRecord),
    Fatal(anyhow::Error),
}

/// Grade one case: invoke the callback, classify, record the statement
async fn execute_case(shared: Arc<RunShared>, phase: Arc<dyn Phase>, case: Arc<TestCase>) -> CaseRun {
    let statement_id = shared.tracker.allocate_id();
    let ctx = CaseContext::new(Arc::clone(&shared), statement_id);

    debug!(job_id = %shared.job_id, case = %case.name, "Dispatching test case");
    let start = Instant::now();
    // A panicking callback is an undeclared failure of its own case, whatever the pool size
    let outcome = match AssertUnwindSafe(phase.run(&ctx, &case)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(PhaseError::Fatal(anyhow::anyhow!(
            "test case `{}` panicked: {}",
            case.name,
            panic_message(payload.as_ref())
        ))),
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let draft = StatementDraft::new(Verb::tested(), shared.actor.as_str(), case_activity(&case.name))
        .parent(shared.root_statement)
        .context_extensions(ctx.into_annotations())
        .result_extension("elapsed_ms", elapsed_ms);

    let record = match outcome {
        Ok(record) => record,
        Err(err) => match classify(err, Stage::Case) {
            Classification::Declared { failure, terminate_job } => {
                if terminate_job {
                    shared.termination.request(failure.clone());
                }
                ResultRecord::for_case(&case, failure.verdict, 0.0).with_detail(failure.comment)
            }
            Classification::Undeclared(err) => {
                error!(job_id = %shared.job_id, case = %case.name, error = %err, "Test case raised an undeclared failure");
                shared
                    .tracker
                    .record(statement_id, draft.result_extension("exception", err.to_string()));
                return CaseRun::Fatal(err);
            }
        },
    };

    debug!(
        job_id = %shared.job_id,
        case = %case.name,
        verdict = %record.verdict,
        score = record.score,
        elapsed_ms,
        "Test case graded"
    );
    shared.tracker.record(
        statement_id,
        draft
            .score(record.score)
            .result_extension("verdict", record.verdict.as_str()),
    );
    CaseRun::Recorded(record)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Grade `cases` with up to `workers` in flight
pub(crate) async fn run_cases(
    shared: Arc<RunShared>,
    cases: Vec<Arc<TestCase>>,
    phase: Arc<dyn Phase>,
    workers: usize,
) -> RunReport {
    if workers <= 1 {
        run_sequential(shared, cases, phase).await
    } else {
        run_pooled(shared, cases, phase, workers).await
    }
}

async fn run_sequential(shared: Arc<RunShared>, cases: Vec<Arc<TestCase>>, phase: Arc<dyn Phase>) -> RunReport {
    let total = cases.len();
    let mut report = RunReport {
        records: Vec::with_capacity(total),
        dispatched: 0,
        fatal: None,
    };

    for case in cases {
        if shared.termination.is_set() {
            info!(job_id = %shared.job_id, completed = report.dispatched, total, "Termination flag set, stopping dispatch");
            break;
        }

        report.dispatched += 1;
        match execute_case(Arc::clone(&shared), Arc::clone(&phase), case).await {
            CaseRun::Recorded(record) => report.records.push(record),
            CaseRun::Fatal(err) => {
                report.fatal = Some(err);
                break;
            }
        }
    }

    report
}

async fn run_pooled(
    shared: Arc<RunShared>,
    cases: Vec<Arc<TestCase>>,
    phase: Arc<dyn Phase>,
    workers: usize,
) -> RunReport {
    let total = cases.len();
    let mut report = RunReport {
        records: Vec::with_capacity(total),
        dispatched: 0,
        fatal: None,
    };
    let mut pending = cases.into_iter();
    let mut in_flight = JoinSet::new();

    loop {
        // Refill the pool unless a stop condition has been observed
        while in_flight.len() < workers && report.fatal.is_none() {
            if shared.termination.is_set() {
                debug!(job_id = %shared.job_id, dispatched = report.dispatched, total, "Termination flag set, not dispatching");
                break;
            }
            let Some(case) = pending.next() else { break };
            report.dispatched += 1;
            in_flight.spawn(execute_case(Arc::clone(&shared), Arc::clone(&phase), case));
        }

        let Some(joined) = in_flight.join_next().await else { break };
        let err = match joined {
            Ok(CaseRun::Recorded(record)) => {
                report.records.push(record);
                continue;
            }
            Ok(CaseRun::Fatal(err)) => err,
            Err(join_err) => anyhow::anyhow!("test case worker panicked: {join_err}"),
        };

        if report.fatal.is_none() {
            warn!(
                job_id = %shared.job_id,
                in_flight = in_flight.len(),
                "Undeclared failure, draining in-flight cases before raising"
            );
            report.fatal = Some(err);
        } else {
            warn!(job_id = %shared.job_id, error = %err, "Additional undeclared failure while draining");
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use async_trait::async_trait;
    use grader_common::types::Verdict;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Records dispatch order and peak concurrency
    #[derive(Default)]
    struct Probe {
        order: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait]
    impl Phase for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        async fn prework(&self, _job: &mut Job) -> Result<(), PhaseError> {
            Ok(())
        }

        async fn run(&self, _ctx: &CaseContext, case: &TestCase) -> Result<ResultRecord, PhaseError> {
            self.order.lock().unwrap().push(case.name.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(ResultRecord::for_case(case, Verdict::Accept, case.weight))
        }
    }

    fn make_shared(tracker: Arc<ActivityTracker>) -> Arc<RunShared> {
        Arc::new(RunShared {
            job_id: Uuid::new_v4(),
            config: JobConfig::new(),
            actor: "tester".to_string(),
            root_statement: Uuid::new_v4(),
            tracker,
            termination: Arc::new(Termination::default()),
        })
    }

    fn make_cases(n: usize) -> Vec<Arc<TestCase>> {
        (1..=n)
            .map(|i| Arc::new(TestCase::new(format!("case{i:02}"), 10.0)))
            .collect()
    }

    #[tokio::test]
    async fn test_sequential_keeps_collection_order() {
        let tracker = ActivityTracker::shared();
        let probe = Arc::new(Probe::default());
        let report = run_cases(make_shared(Arc::clone(&tracker)), make_cases(5), probe.clone(), 1).await;

        let names: Vec<String> = report.records.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, ["case01", "case02", "case03", "case04", "case05"]);
        assert_eq!(*probe.order.lock().unwrap(), names);
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
        assert_eq!(report.dispatched, 5);
        assert_eq!(tracker.len(), 5);
        assert!(report.fatal.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_respects_worker_bound() {
        let tracker = ActivityTracker::shared();
        let probe = Arc::new(Probe {
            delay_ms: 20,
            ..Default::default()
        });
        let report = run_cases(make_shared(Arc::clone(&tracker)), make_cases(12), probe.clone(), 3).await;

        assert_eq!(report.records.len(), 12);
        assert_eq!(report.dispatched, 12);
        let peak = probe.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeded pool size");
        assert!(peak >= 2, "pool never ran cases concurrently");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_one_task_per_case() {
        let tracker = ActivityTracker::shared();
        let probe = Arc::new(Probe {
            delay_ms: 5,
            ..Default::default()
        });
        let report = run_cases(make_shared(Arc::clone(&tracker)), make_cases(4), probe, 64).await;

        let names: HashSet<String> = report.records.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names.len(), 4);
        assert_eq!(tracker.len(), 4);
    }

    #[tokio::test]
    async fn test_termination_flag_stops_dispatch() {
        let tracker = ActivityTracker::shared();
        let shared = make_shared(Arc::clone(&tracker));
        shared.termination.request(GradingFailure::unknown("stop"));

        let report = run_cases(Arc::clone(&shared), make_cases(3), Arc::new(Probe::default()), 2).await;
        assert_eq!(report.dispatched, 0);
        assert!(report.records.is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_termination_first_reason_wins() {
        let termination = Termination::default();
        assert!(!termination.is_set());

        termination.request(GradingFailure::runtime("first"));
        termination.request(GradingFailure::compile("second"));

        assert!(termination.is_set());
        assert_eq!(termination.reason(), Some(GradingFailure::runtime("first")));
    }
}
