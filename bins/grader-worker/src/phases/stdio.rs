//! `stdio`: feed `input<N>.txt` to the submission, compare against `output<N>.txt`.

use super::{compile_submission, execute_case, read_case_file, TOTAL_SCORE};
use anyhow::Context;
use async_trait::async_trait;
use grader_common::types::{ResultRecord, TestCase, Verdict};
use grader_kernel::scoring;
use grader_kernel::{CaseContext, GradingFailure, Job, Phase, PhaseError, TestCases};
use serde_json::{json, Value};
use std::path::Path;
use tracing::{info, warn};

const DEFAULT_TOTAL_SCORE: f64 = 100.0;

pub struct StdioPhase;

/// Case numbers of every `input<N>.txt` in `dir`, ascending
async fn discover_inputs(dir: &Path) -> anyhow::Result<Vec<u32>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to list {}", dir.display()))?;

    let mut numbers = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let number = name
            .to_str()
            .and_then(|n| n.strip_prefix("input"))
            .and_then(|n| n.strip_suffix(".txt"))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(number) = number {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

#[async_trait]
impl Phase for StdioPhase {
    fn name(&self) -> &str {
        "stdio"
    }

    async fn prework(&self, job: &mut Job) -> Result<(), PhaseError> {
        let dir = job.config().testcase_dir();
        let numbers = match discover_inputs(&dir).await {
            Ok(numbers) => numbers,
            Err(e) => return Err(GradingFailure::unknown(format!("{e:#}")).into()),
        };
        if numbers.is_empty() {
            warn!(job_id = %job.id(), dir = %dir.display(), "No input files found");
        }

        let total = job
            .config()
            .get(TOTAL_SCORE)
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_TOTAL_SCORE);
        let weight = total / numbers.len().max(1) as f64;

        let mut cases = TestCases::new();
        for number in numbers {
            let input = dir.join(format!("input{number}.txt"));
            let output = dir.join(format!("output{number}.txt"));
            if !output.exists() {
                return Err(GradingFailure::unknown(format!("missing expected output {}", output.display())).into());
            }
            cases.push(
                TestCase::new(format!("case{number}"), weight)
                    .with_input(input)
                    .with_output(output),
            )?;
        }

        info!(job_id = %job.id(), test_cases = cases.len(), weight, "Discovered stdio test cases");
        job.set_testcases(cases)?;
        compile_submission(job).await
    }

    async fn run(&self, ctx: &CaseContext, case: &TestCase) -> Result<ResultRecord, PhaseError> {
        let output = execute_case(ctx, case).await?;
        let expected = read_case_file(case.output_src.as_deref()).await?;

        let passed = scoring::outputs_match(&output.stdout, &expected);
        let score = scoring::binary(passed, case.weight);
        if passed {
            return Ok(ResultRecord::for_case(case, Verdict::Accept, score));
        }

        Ok(ResultRecord::for_case(case, Verdict::WrongAnswer, score).with_detail(json!({
            "expected": scoring::normalize_output(&expected),
            "actual": scoring::normalize_output(&output.stdout),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::{COMPILE_COMMAND, RUN_COMMAND};
    use grader_common::config::{self, JobConfig};
    use grader_kernel::{ActivityTracker, JobState};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn make_dirs(pairs: &[(&str, Option<&str>)]) -> (TempDir, TempDir) {
        let testdata = TempDir::new().unwrap();
        let submit = TempDir::new().unwrap();
        for (i, (input, output)) in pairs.iter().enumerate() {
            fs::write(testdata.path().join(format!("input{}.txt", i + 1)), input).unwrap();
            if let Some(output) = output {
                fs::write(testdata.path().join(format!("output{}.txt", i + 1)), output).unwrap();
            }
        }
        (testdata, submit)
    }

    fn make_job(testdata: &TempDir, submit: &TempDir, extra: &[(&str, Value)]) -> Job {
        let mut job_config = JobConfig::new();
        job_config.insert(config::PHASE, "stdio");
        job_config.insert(config::TESTCASE_DIR, testdata.path().to_string_lossy().into_owned());
        job_config.insert(config::SUBMIT_DIR, submit.path().to_string_lossy().into_owned());
        job_config.insert(RUN_COMMAND, "cat");
        for (key, value) in extra {
            job_config.insert(*key, value.clone());
        }
        Job::new(job_config, Arc::new(StdioPhase), ActivityTracker::shared())
    }

    #[tokio::test]
    async fn test_discover_inputs_sorted_numerically() {
        let (testdata, _submit) = make_dirs(&[("a", Some("a")); 11]);
        fs::write(testdata.path().join("notes.txt"), "x").unwrap();

        let numbers = discover_inputs(testdata.path()).await.unwrap();
        assert_eq!(numbers, (1..=11).collect::<Vec<u32>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_echo_submission_scores_matching_cases() {
        let (testdata, submit) = make_dirs(&[("1 2\n", Some("1 2")), ("hello\n", Some("goodbye\n"))]);
        let mut job = make_job(&testdata, &submit, &[]);

        job.start(2).await.unwrap();

        assert_eq!(job.state(), JobState::Done);
        assert_eq!(job.score(), 50.0);
        assert_eq!(job.verdict(), Verdict::WrongAnswer);
        let failed = job.get_summary().iter().find(|r| r.name == "case2").unwrap();
        assert_eq!(failed.detail["expected"], json!(["goodbye"]));
    }

    #[tokio::test]
    async fn test_total_score_split_evenly() {
        let (testdata, submit) = make_dirs(&[("x", Some("x")), ("y", Some("y")), ("z", Some("z")), ("w", Some("w"))]);
        let mut job = make_job(&testdata, &submit, &[(TOTAL_SCORE, json!(76))]);

        job.start(1).await.unwrap();

        assert_eq!(job.get_testcases().get("case1").unwrap().weight, 19.0);
        assert_eq!(job.score(), 76.0);
        assert_eq!(job.verdict(), Verdict::Accept);
    }

    #[tokio::test]
    async fn test_missing_output_terminates() {
        let (testdata, submit) = make_dirs(&[("x", Some("x")), ("y", None)]);
        let mut job = make_job(&testdata, &submit, &[]);

        job.start(1).await.unwrap();

        assert_eq!(job.state(), JobState::Terminated);
        assert_eq!(job.verdict(), Verdict::UnknownError);
        assert!(job.comment().contains("output2.txt"));
    }

    #[tokio::test]
    async fn test_compile_failure_terminates() {
        let (testdata, submit) = make_dirs(&[("x", Some("x"))]);
        let mut job = make_job(
            &testdata,
            &submit,
            &[(COMPILE_COMMAND, json!("echo 'syntax error' >&2; exit 1"))],
        );

        job.start(1).await.unwrap();

        assert_eq!(job.state(), JobState::Terminated);
        assert_eq!(job.verdict(), Verdict::CompileError);
        assert!(job.comment().contains("syntax error"));
        assert!(job.get_summary().is_empty());
    }

    #[tokio::test]
    async fn test_missing_program_terminates_job() {
        let (testdata, submit) = make_dirs(&[("x", Some("x")), ("y", Some("y")), ("z", Some("z"))]);
        let mut job = make_job(
            &testdata,
            &submit,
            &[(RUN_COMMAND, json!("no-such-grader-binary-4711"))],
        );

        job.start(1).await.unwrap();

        assert_eq!(job.state(), JobState::Terminated);
        assert_eq!(job.verdict(), Verdict::RuntimeError);
        assert_eq!(job.get_summary().len(), 1);
    }

    #[tokio::test]
    async fn test_time_limit_exceeded() {
        let (testdata, submit) = make_dirs(&[("x", Some("x"))]);
        let mut job = make_job(
            &testdata,
            &submit,
            &[
                (RUN_COMMAND, json!("sleep 5")),
                (config::TIME_LIMIT_MS, json!(100)),
            ],
        );

        job.start(1).await.unwrap();

        assert_eq!(job.state(), JobState::Done);
        assert_eq!(job.verdict(), Verdict::TimeLimitExceeded);
        assert_eq!(job.score(), 0.0);
    }
}
