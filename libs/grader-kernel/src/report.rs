//! Report interface consumed by postwork handlers.

use crate::aggregate::{sorted_by_name, SummaryInfo};
use crate::job::TestCases;
use grader_common::types::ResultRecord;
use serde_json::Value;
use std::fmt::Write;

/// Turns a summary into the human-readable comment stored on the job
pub trait ReportRenderer: Send + Sync {
    fn render(&self, summary: &[ResultRecord], cases: &TestCases, info: &SummaryInfo) -> String;
}

/// Plain-text table, one line per case in name order
#[derive(Debug, Clone, Copy, Default)]
pub struct TextReport;

impl TextReport {
    fn detail_text(detail: &Value) -> Option<String> {
        match detail {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl ReportRenderer for TextReport {
    fn render(&self, summary: &[ResultRecord], cases: &TestCases, info: &SummaryInfo) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "passed {}/{}, score {}/{}",
            info.passed, info.all, info.score, info.max_score
        );

        for record in sorted_by_name(summary) {
            let weight = cases.get(&record.name).map(|case| case.weight);
            let hidden = cases.get(&record.name).is_some_and(|case| case.is_hidden());

            let _ = match weight {
                Some(weight) => writeln!(out, "{}\t{}\t{}/{}", record.name, record.verdict, record.score, weight),
                None => writeln!(out, "{}\t{}\t{}", record.name, record.verdict, record.score),
            };

            if hidden || record.verdict.is_accept() {
                continue;
            }
            if let Some(detail) = Self::detail_text(&record.detail) {
                for line in detail.lines() {
                    let _ = writeln!(out, "    {line}");
                }
            }
        }

        out
    }
}
