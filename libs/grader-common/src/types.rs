use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Free-form per-case or per-statement data
pub type Extensions = Map<String, Value>;

/// Outcome classification attached to a job or to a single test case.
///
/// Serialized as the human-readable label the surrounding platform reads back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "Accept")]
    Accept,
    #[serde(rename = "Wrong Answer")]
    WrongAnswer,
    #[serde(rename = "Compile Error")]
    CompileError,
    #[serde(rename = "Runtime Error")]
    RuntimeError,
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "Unknown Error")]
    UnknownError,
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "Accept",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::CompileError => "Compile Error",
            Verdict::RuntimeError => "Runtime Error",
            Verdict::TimeLimitExceeded => "Time Limit Exceeded",
            Verdict::UnknownError => "Unknown Error",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single test case descriptor, read-only once dispatched to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    /// Case weight; the job's maximum score is the sum of weights
    pub weight: f64,
    #[serde(default)]
    pub input_src: Option<PathBuf>,
    #[serde(default)]
    pub output_src: Option<PathBuf>,
    #[serde(default)]
    pub extension: Extensions,
}

impl TestCase {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            input_src: None,
            output_src: None,
            extension: Extensions::new(),
        }
    }

    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_src = Some(path.into());
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_src = Some(path.into());
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extension.insert(key.into(), value.into());
        self
    }

    /// Hidden cases keep their details out of rendered reports
    pub fn is_hidden(&self) -> bool {
        self.extension
            .get("hidden")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// One graded test case, appended to the job summary exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub name: String,
    pub verdict: Verdict,
    pub score: f64,
    #[serde(default)]
    pub detail: Value,
    #[serde(default)]
    pub extension: Extensions,
}

impl ResultRecord {
    /// Start a record for `case`, snapshotting its extension map
    pub fn for_case(case: &TestCase, verdict: Verdict, score: f64) -> Self {
        Self {
            name: case.name.clone(),
            verdict,
            score,
            detail: Value::Null,
            extension: case.extension.clone(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<Value>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// The four committed values the platform reads back from a finished job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub verdict: Verdict,
    pub score: f64,
    pub comment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    pub finished_at: DateTime<Utc>,
}
