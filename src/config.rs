use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::ArrayKeys;

/// Execution settings for [`PipelineRunner`](crate::runner::PipelineRunner).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Worker threads used to probe a join index. 1 disables parallelism.
    pub workers: usize,
    /// Minimum input size before probing is split across workers.
    pub parallel_threshold: usize,
    /// Wall-clock limit for one run, checked between phases.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Option<Duration>,
    pub array_keys: ArrayKeys,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            parallel_threshold: 4096,
            timeout: None,
            array_keys: ArrayKeys::Whole,
        }
    }
}

impl RunnerConfig {
    /// Defaults overlaid with `OXIJOIN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|name| env::var(name).ok())
    }

    fn overlay<F>(mut self, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("OXIJOIN_WORKERS") {
            self.workers = parse_num("OXIJOIN_WORKERS", &v)?;
            if self.workers == 0 {
                return Err(Error::Config("OXIJOIN_WORKERS must be at least 1".into()));
            }
        }
        if let Some(v) = var("OXIJOIN_PARALLEL_THRESHOLD") {
            self.parallel_threshold = parse_num("OXIJOIN_PARALLEL_THRESHOLD", &v)?;
        }
        if let Some(v) = var("OXIJOIN_TIMEOUT_MS") {
            let ms: u64 = parse_num("OXIJOIN_TIMEOUT_MS", &v)?;
            self.timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(v) = var("OXIJOIN_ARRAY_KEYS") {
            self.array_keys = match v.trim() {
                "whole" => ArrayKeys::Whole,
                "elements" => ArrayKeys::Elements,
                other => {
                    return Err(Error::Config(format!(
                        "OXIJOIN_ARRAY_KEYS must be 'whole' or 'elements', got '{other}'"
                    )));
                }
            };
        }
        Ok(self)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_array_keys(mut self, array_keys: ArrayKeys) -> Self {
        self.array_keys = array_keys;
        self
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be a non-negative integer, got '{raw}'")))
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis))
    }
}
