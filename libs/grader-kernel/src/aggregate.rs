//! Summary aggregation helpers for postwork handlers.
//!
//! Records are never modified here; clipping to `[0, weight]` happens only
//! while summing.

use crate::error::KernelError;
use crate::job::{Job, TestCases};
use crate::report::ReportRenderer;
use grader_common::types::{ResultRecord, Verdict};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryInfo {
    pub all: usize,
    pub passed: usize,
    pub score: f64,
    pub max_score: f64,
    /// First non-Accept verdict in name order, if any
    pub err_type: Option<Verdict>,
}

impl SummaryInfo {
    pub fn all_passed(&self) -> bool {
        self.passed == self.all
    }
}

/// A record's score clipped to its case's weight. Records for unknown cases
/// only get the lower bound.
pub fn clipped_score(record: &ResultRecord, cases: &TestCases) -> f64 {
    let score = record.score.max(0.0);
    match cases.get(&record.name) {
        Some(case) => score.min(case.weight),
        None => score,
    }
}

pub fn total_score(records: &[ResultRecord], cases: &TestCases) -> f64 {
    records.iter().map(|record| clipped_score(record, cases)).sum()
}

/// Records sorted by case name, for deterministic reporting
pub fn sorted_by_name(records: &[ResultRecord]) -> Vec<&ResultRecord> {
    let mut sorted: Vec<&ResultRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    sorted
}

pub fn summarize(records: &[ResultRecord], cases: &TestCases) -> SummaryInfo {
    let sorted = sorted_by_name(records);
    SummaryInfo {
        all: records.len(),
        passed: records.iter().filter(|r| r.verdict.is_accept()).count(),
        score: total_score(records, cases),
        max_score: cases.max_score(),
        err_type: sorted
            .iter()
            .map(|record| record.verdict)
            .find(|verdict| !verdict.is_accept()),
    }
}

/// Plain-sum postwork: score is the clipped sum, verdict is Accept when every
/// case passed and the first failing verdict otherwise.
pub fn finalize_plain_sum(job: &mut Job, renderer: &dyn ReportRenderer) -> Result<SummaryInfo, KernelError> {
    let info = summarize(job.get_summary(), job.get_testcases());
    let verdict = match info.err_type {
        Some(verdict) if !info.all_passed() => verdict,
        _ => Verdict::Accept,
    };
    let comment = renderer.render(job.get_summary(), job.get_testcases(), &info);

    job.set_score(info.score)?;
    job.set_verdict(verdict)?;
    job.set_comment(comment)?;
    job.set_detail(serde_json::to_value(&info).unwrap_or_default())?;

    info!(
        job_id = %job.id(),
        passed = info.passed,
        all = info.all,
        score = info.score,
        max_score = info.max_score,
        "Summary aggregated"
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grader_common::types::TestCase;

    fn cases() -> TestCases {
        TestCases::from_cases([
            TestCase::new("a", 20.0),
            TestCase::new("b", 30.0),
            TestCase::new("c", 26.0),
        ])
        .unwrap()
    }

    fn record(name: &str, verdict: Verdict, score: f64) -> ResultRecord {
        ResultRecord::for_case(&TestCase::new(name, 0.0), verdict, score)
    }

    #[test]
    fn test_summarize_all_passed() {
        let records = vec![
            record("c", Verdict::Accept, 26.0),
            record("a", Verdict::Accept, 20.0),
            record("b", Verdict::Accept, 30.0),
        ];
        let info = summarize(&records, &cases());

        assert_eq!(info.all, 3);
        assert_eq!(info.passed, 3);
        assert_eq!(info.score, 76.0);
        assert_eq!(info.max_score, 76.0);
        assert_eq!(info.err_type, None);
        assert!(info.all_passed());
    }

    #[test]
    fn test_err_type_is_first_failure_by_name() {
        let records = vec![
            record("c", Verdict::RuntimeError, 0.0),
            record("a", Verdict::Accept, 20.0),
            record("b", Verdict::WrongAnswer, 0.0),
        ];
        let info = summarize(&records, &cases());

        assert_eq!(info.passed, 1);
        assert_eq!(info.err_type, Some(Verdict::WrongAnswer));
    }

    #[test]
    fn test_scores_clipped_to_weight() {
        let records = vec![
            record("a", Verdict::Accept, 500.0),
            record("b", Verdict::WrongAnswer, -4.0),
        ];
        assert_eq!(total_score(&records, &cases()), 20.0);
        // The records themselves keep what the handler reported
        assert_eq!(records[0].score, 500.0);
    }

    #[test]
    fn test_sorted_by_name() {
        let records = vec![
            record("b", Verdict::Accept, 1.0),
            record("a", Verdict::Accept, 1.0),
        ];
        let names: Vec<&str> = sorted_by_name(&records).iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }
}
