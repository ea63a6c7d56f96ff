// Job configuration: an opaque key/value mapping the kernel reads but never parses from raw files itself
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PHASE: &str = "phase";
pub const SUBMIT_DIR: &str = "submit_dir";
pub const TESTCASE_DIR: &str = "testcase_dir";
pub const DEBUG: &str = "debug";
pub const WORKERS: &str = "workers";
pub const TIME_LIMIT_MS: &str = "time_limit_ms";
pub const ACTOR: &str = "actor";
pub const TRACK_ENABLED: &str = "track_enabled";

/// Environment variable naming an extra config file merged before the local one
pub const CONFIG_SRC_ENV: &str = "CONFIG_SRC";

const DEFAULT_SUBMIT_DIR: &str = "/coursegrader/submit";
const DEFAULT_TESTCASE_DIR: &str = "/coursegrader/testdata";
const DEFAULT_TIME_LIMIT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobConfig {
    values: Map<String, Value>,
}

impl Default for JobConfig {
    fn default() -> Self {
        let mut values = Map::new();
        values.insert(SUBMIT_DIR.to_string(), Value::from(DEFAULT_SUBMIT_DIR));
        values.insert(TESTCASE_DIR.to_string(), Value::from(DEFAULT_TESTCASE_DIR));
        values.insert(DEBUG.to_string(), Value::from(false));
        Self { values }
    }
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `values`
    pub fn from_map(values: Map<String, Value>) -> Self {
        let mut config = Self::default();
        config.merge(values);
        config
    }

    /// Load configuration the way the grading container provides it.
    ///
    /// Order: defaults, the file named by `CONFIG_SRC`, then `path` if given,
    /// otherwise `<testcase_dir>/config.json` when that file exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(src) = std::env::var(CONFIG_SRC_ENV) {
            config.merge_file(Path::new(&src))?;
        }

        match path {
            Some(path) => config.merge_file(path)?,
            None => {
                let local = config.testcase_dir().join("config.json");
                if local.exists() {
                    config.merge_file(&local)?;
                }
            }
        }

        Ok(config)
    }

    /// Merge a JSON object file on top of the current values
    pub fn merge_file(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let values: Map<String, Value> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        self.merge(values);
        Ok(())
    }

    pub fn merge(&mut self, values: Map<String, Value>) {
        self.values.extend(values);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(Value::as_u64)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Identifier used to resolve the (prework, run, postwork) handlers
    pub fn phase(&self) -> Option<&str> {
        self.get_str(PHASE)
    }

    pub fn submit_dir(&self) -> PathBuf {
        PathBuf::from(self.get_str(SUBMIT_DIR).unwrap_or(DEFAULT_SUBMIT_DIR))
    }

    pub fn testcase_dir(&self) -> PathBuf {
        PathBuf::from(self.get_str(TESTCASE_DIR).unwrap_or(DEFAULT_TESTCASE_DIR))
    }

    pub fn is_debug(&self) -> bool {
        self.get(DEBUG).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Worker pool size; 0 and 1 both mean sequential
    pub fn workers(&self) -> usize {
        self.get_u64(WORKERS).map(|n| n as usize).unwrap_or(1)
    }

    /// Per-case wall-clock limit handed to the process collaborator
    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.get_u64(TIME_LIMIT_MS).unwrap_or(DEFAULT_TIME_LIMIT_MS))
    }

    pub fn actor(&self) -> &str {
        self.get_str(ACTOR).unwrap_or("anonymous")
    }

    pub fn track_enabled(&self) -> bool {
        self.get(TRACK_ENABLED).and_then(Value::as_bool).unwrap_or(true)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}
