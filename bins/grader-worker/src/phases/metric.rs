//! `metric`: correct output earns partial credit scaled by a metric the
//! submission prints on stderr (cycle counts, instruction counts, ...).
//!
//! Test cases come from `caseconfig.json` in the test-case directory:
//!
//! ```json
//! {
//!   "idx": 0,
//!   "base_fraction": 30,
//!   "testcaseList": [
//!     {"name": "loop", "score": 4, "input": "loop.in", "output": "loop.out", "min": 9000, "max": 1200}
//!   ]
//! }
//! ```
//!
//! Scores are computed in hundredths of a point: the ceiling is `score * 100`
//! and the floor for a correct answer is `base_fraction * score`.

use super::{compile_submission, execute_case, read_case_file};
use anyhow::Context;
use async_trait::async_trait;
use grader_common::types::{ResultRecord, TestCase, Verdict};
use grader_kernel::scoring::{self, InterpolationBounds};
use grader_kernel::{CaseContext, GradingFailure, Job, Phase, PhaseError, TestCases};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CASE_CONFIG: &str = "caseconfig.json";
const BOUNDS_KEY: &str = "bounds";
const METRIC_IDX_KEY: &str = "metric_idx";

#[derive(Debug, Deserialize)]
struct CaseConfig {
    #[serde(rename = "testcaseList")]
    testcase_list: Vec<MetricCase>,
    /// Line of stderr holding the metric, counted from the end
    #[serde(default)]
    idx: usize,
    /// Percentage of a case's score awarded for a correct but unoptimized answer
    #[serde(default)]
    base_fraction: i64,
}

#[derive(Debug, Deserialize)]
struct MetricCase {
    name: String,
    score: i64,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    /// Metric of the baseline solution
    min: i64,
    /// Metric of the reference optimum
    max: i64,
    #[serde(default)]
    hidden: bool,
}

impl MetricCase {
    fn into_test_case(self, dir: &Path, idx: usize, base_fraction: i64) -> anyhow::Result<TestCase> {
        let bounds = InterpolationBounds {
            base_val: self.min,
            max_val: self.max,
            floor: base_fraction * self.score,
            ceiling: self.score * 100,
        };

        let mut case = TestCase::new(self.name, self.score as f64)
            .with_extension(BOUNDS_KEY, serde_json::to_value(bounds)?)
            .with_extension(METRIC_IDX_KEY, idx)
            .with_extension("hidden", self.hidden);
        if let Some(input) = self.input {
            case = case.with_input(dir.join(input));
        }
        if let Some(output) = self.output {
            case = case.with_output(dir.join(output));
        }
        Ok(case)
    }
}

pub struct MetricPhase;

async fn load_case_config(path: &Path) -> anyhow::Result<CaseConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Hundredths of a point earned by a correct answer reporting `metric`
fn credit(bounds: &InterpolationBounds, metric: Option<i64>) -> i64 {
    if bounds.base_val == bounds.max_val || bounds.floor >= bounds.ceiling {
        return bounds.ceiling;
    }
    match metric {
        Some(observed) => scoring::interpolate(bounds, observed),
        None => bounds.floor,
    }
}

#[async_trait]
impl Phase for MetricPhase {
    fn name(&self) -> &str {
        "metric"
    }

    async fn prework(&self, job: &mut Job) -> Result<(), PhaseError> {
        let dir = job.config().testcase_dir();
        let path = dir.join(CASE_CONFIG);
        if !path.exists() {
            return Err(GradingFailure::unknown(format!("{} not found", path.display())).into());
        }
        let case_config = load_case_config(&path).await?;
        let CaseConfig {
            mut testcase_list,
            idx,
            base_fraction,
        } = case_config;
        testcase_list.sort_by(|a, b| a.name.cmp(&b.name));

        let mut cases = TestCases::new();
        for entry in testcase_list {
            cases.push(entry.into_test_case(&dir, idx, base_fraction)?)?;
        }

        info!(
            job_id = %job.id(),
            test_cases = cases.len(),
            max_score = cases.max_score(),
            idx,
            base_fraction,
            "Loaded metric test cases"
        );
        job.annotate("metric_idx", idx)?;
        job.set_testcases(cases)?;
        compile_submission(job).await
    }

    async fn run(&self, ctx: &CaseContext, case: &TestCase) -> Result<ResultRecord, PhaseError> {
        let bounds: InterpolationBounds = case
            .extension
            .get(BOUNDS_KEY)
            .cloned()
            .map(serde_json::from_value::<InterpolationBounds>)
            .transpose()
            .context("invalid interpolation bounds")?
            .ok_or_else(|| anyhow::anyhow!("test case `{}` has no interpolation bounds", case.name))?;
        let idx = case
            .extension
            .get(METRIC_IDX_KEY)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as usize;

        let output = execute_case(ctx, case).await?;
        let expected = read_case_file(case.output_src.as_deref()).await?;
        if !scoring::outputs_match(&output.stdout, &expected) {
            return Ok(ResultRecord::for_case(case, Verdict::WrongAnswer, 0.0).with_detail(json!({
                "expected": scoring::normalize_output(&expected),
                "actual": scoring::normalize_output(&output.stdout),
            })));
        }

        let metric = scoring::metric_from_stderr(&output.stderr, idx)
            .map_err(|e| GradingFailure::runtime(format!("metric on stderr is not an integer: {e}")))?;
        let hundredths = credit(&bounds, metric);
        if let Some(observed) = metric {
            ctx.annotate("metric", observed);
        }
        debug!(case = %case.name, metric = ?metric, hundredths, "Metric credit");

        let record = ResultRecord::for_case(case, Verdict::Accept, hundredths as f64 / 100.0);
        Ok(match metric {
            Some(observed) => record.with_detail(json!({ "metric": observed })),
            None => record.with_detail("invalid stderr output"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::RUN_COMMAND;
    use grader_common::config::{self, JobConfig};
    use grader_kernel::{ActivityTracker, JobState};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn bounds(base_val: i64, max_val: i64, floor: i64, ceiling: i64) -> InterpolationBounds {
        InterpolationBounds {
            base_val,
            max_val,
            floor,
            ceiling,
        }
    }

    #[test]
    fn test_credit() {
        let b = bounds(1000, 200, 3000, 7000);
        assert_eq!(credit(&b, Some(600)), 5000);
        assert_eq!(credit(&b, None), 3000);
        assert_eq!(credit(&bounds(5, 5, 3000, 7000), None), 7000);
    }

    /// Test data whose "submission" echoes the input and prints the metric
    /// found in `metric.txt` on stderr
    fn make_job(case_config: serde_json::Value) -> (Job, TempDir, TempDir) {
        let testdata = TempDir::new().unwrap();
        let submit = TempDir::new().unwrap();
        fs::write(testdata.path().join("a.in"), "7\n").unwrap();
        fs::write(testdata.path().join("a.out"), "7\n").unwrap();
        fs::write(testdata.path().join("b.in"), "8\n").unwrap();
        fs::write(testdata.path().join("b.out"), "9\n").unwrap();
        fs::write(testdata.path().join(CASE_CONFIG), case_config.to_string()).unwrap();
        fs::write(submit.path().join("metric.txt"), "550").unwrap();

        let mut job_config = JobConfig::new();
        job_config.insert(config::PHASE, "metric");
        job_config.insert(config::TESTCASE_DIR, testdata.path().to_string_lossy().into_owned());
        job_config.insert(config::SUBMIT_DIR, submit.path().to_string_lossy().into_owned());
        job_config.insert(RUN_COMMAND, "cat; cat metric.txt >&2");
        let job = Job::new(job_config, Arc::new(MetricPhase), ActivityTracker::shared());
        (job, testdata, submit)
    }

    #[tokio::test]
    async fn test_metric_partial_credit() {
        let (mut job, _testdata, _submit) = make_job(json!({
            "idx": 0,
            "base_fraction": 20,
            "testcaseList": [
                {"name": "b", "score": 1, "input": "b.in", "output": "b.out", "min": 100, "max": 1000},
                {"name": "a", "score": 1, "input": "a.in", "output": "a.out", "min": 100, "max": 1000},
            ]
        }));

        job.start(2).await.unwrap();

        assert_eq!(job.state(), JobState::Done);
        let names: Vec<&str> = job.get_testcases().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);

        // floor 20, ceiling 100: T = 900, U = 80 * 450 = 36000 → 40 + 20 = 60 hundredths
        let a = job.get_summary().iter().find(|r| r.name == "a").unwrap();
        assert_eq!(a.verdict, Verdict::Accept);
        assert_eq!(a.score, 0.6);
        let b = job.get_summary().iter().find(|r| r.name == "b").unwrap();
        assert_eq!(b.verdict, Verdict::WrongAnswer);
        assert_eq!(job.score(), 0.6);
    }

    fn single_case() -> serde_json::Value {
        json!({
            "idx": 0,
            "base_fraction": 20,
            "testcaseList": [
                {"name": "a", "score": 1, "input": "a.in", "output": "a.out", "min": 100, "max": 1000},
            ]
        })
    }

    #[tokio::test]
    async fn test_non_integer_metric_is_runtime_error() {
        let (mut job, _testdata, submit) = make_job(single_case());
        fs::write(submit.path().join("metric.txt"), "abc").unwrap();

        job.start(1).await.unwrap();

        assert_eq!(job.state(), JobState::Done);
        let a = &job.get_summary()[0];
        assert_eq!(a.verdict, Verdict::RuntimeError);
        assert_eq!(a.score, 0.0);
        assert_eq!(job.score(), 0.0);
    }

    #[tokio::test]
    async fn test_missing_metric_line_earns_floor() {
        let (mut job, _testdata, submit) = make_job(single_case());
        fs::write(submit.path().join("metric.txt"), "").unwrap();

        job.start(1).await.unwrap();

        let a = &job.get_summary()[0];
        assert_eq!(a.verdict, Verdict::Accept);
        assert_eq!(a.score, 0.2);
        assert_eq!(a.detail, "invalid stderr output");
    }

    #[tokio::test]
    async fn test_extreme_metric_is_clamped() {
        for (metric, expected) in [("9223372036854775807", 1.0), ("-9223372036854775808", 0.2)] {
            let (mut job, _testdata, submit) = make_job(single_case());
            fs::write(submit.path().join("metric.txt"), metric).unwrap();

            job.start(1).await.unwrap();

            assert_eq!(job.state(), JobState::Done, "metric = {metric}");
            assert_eq!(job.get_summary()[0].score, expected, "metric = {metric}");
        }
    }

    #[tokio::test]
    async fn test_missing_case_config_terminates() {
        let testdata = TempDir::new().unwrap();
        let mut job_config = JobConfig::new();
        job_config.insert(config::TESTCASE_DIR, testdata.path().to_string_lossy().into_owned());
        let mut job = Job::new(job_config, Arc::new(MetricPhase), ActivityTracker::shared());

        job.start(1).await.unwrap();

        assert_eq!(job.state(), JobState::Terminated);
        assert_eq!(job.verdict(), Verdict::UnknownError);
        assert!(job.comment().contains(CASE_CONFIG));
    }

    #[tokio::test]
    async fn test_malformed_case_config_is_undeclared() {
        let (mut job, _testdata, _submit) = make_job(json!({ "idx": 0 }));

        let err = job.start(1).await.unwrap_err();
        assert!(format!("{err:#}").contains(CASE_CONFIG));
        assert_eq!(job.state(), JobState::Failed);
    }
}
