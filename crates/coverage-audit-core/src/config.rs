//! Audit configuration.
//!
//! Loaded from a JSON settings file (every field optional), then overridden
//! from the environment:
//!
//! - `COVERAGE_AUDIT_QUERY_URL`: query service endpoint
//! - `COVERAGE_AUDIT_QUEUE_URL`: work queue endpoint
//! - `COVERAGE_AUDIT_DEBUG`: `true`/`1` enables debug logging

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::batch::{DEFAULT_BATCH_VOLUME, DEFAULT_COVERAGE_LIMIT};
use crate::diff::DEFAULT_TOP_N;
use crate::domain::error::{AuditError, Result};
use crate::reconcile::{TaskWindow, DEFAULT_FILE_LIMIT, DEFAULT_TASK_LIMIT};
use crate::requeue::{DEFAULT_DESTINATION_BUCKET, DEFAULT_SOURCE_BUCKET};

pub const DEFAULT_QUERY_URL: &str = "https://activedata.allizom.org/query";

pub const QUERY_URL_ENV: &str = "COVERAGE_AUDIT_QUERY_URL";
pub const QUEUE_URL_ENV: &str = "COVERAGE_AUDIT_QUEUE_URL";
pub const DEBUG_ENV: &str = "COVERAGE_AUDIT_DEBUG";

/// Where reprocessing requests go and what they say.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueConfig {
    /// Queue endpoint; `None` means requeueing is unavailable.
    pub url: Option<String>,
    pub source_bucket: String,
    pub destination_bucket: String,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        WorkQueueConfig {
            url: None,
            source_bucket: DEFAULT_SOURCE_BUCKET.to_string(),
            destination_bucket: DEFAULT_DESTINATION_BUCKET.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub query_url: String,
    pub work_queue: WorkQueueConfig,
    pub debug: bool,
    pub batch_volume: u64,
    pub coverage_limit: u64,
    pub task_limit: u64,
    pub file_limit: u64,
    pub top_n: usize,
    pub settle_hours: u32,
    pub lookback_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        let window = TaskWindow::default();
        AuditConfig {
            query_url: DEFAULT_QUERY_URL.to_string(),
            work_queue: WorkQueueConfig::default(),
            debug: false,
            batch_volume: DEFAULT_BATCH_VOLUME,
            coverage_limit: DEFAULT_COVERAGE_LIMIT,
            task_limit: DEFAULT_TASK_LIMIT,
            file_limit: DEFAULT_FILE_LIMIT,
            top_n: DEFAULT_TOP_N,
            settle_hours: window.settle_hours,
            lookback_days: window.lookback_days,
        }
    }
}

impl AuditConfig {
    /// Read a settings file, without environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| AuditError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Settings file (or defaults when `path` is `None`), environment
    /// overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(QUERY_URL_ENV) {
            self.query_url = url;
        }
        if let Some(url) = lookup(QUEUE_URL_ENV) {
            self.work_queue.url = Some(url);
        }
        if let Some(debug) = lookup(DEBUG_ENV) {
            self.debug = matches!(debug.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.query_url.trim().is_empty() {
            return Err(AuditError::Config("query_url must not be empty".to_string()));
        }
        let positive = [
            ("batch_volume", self.batch_volume),
            ("coverage_limit", self.coverage_limit),
            ("task_limit", self.task_limit),
            ("file_limit", self.file_limit),
            ("top_n", self.top_n as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AuditError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Expected-work window with no revision or branch restriction.
    pub fn task_window(&self) -> TaskWindow {
        TaskWindow {
            settle_hours: self.settle_hours,
            lookback_days: self.lookback_days,
            ..TaskWindow::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = AuditConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_volume, 5000);
        assert_eq!(config.top_n, 20);
        assert_eq!(config.work_queue.destination_bucket, "active-data-codecoverage");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"debug": true, "work_queue": {{"url": "http://queue.local/extend"}}}}"#).unwrap();

        let config = AuditConfig::from_file(file.path()).unwrap();
        assert!(config.debug);
        assert_eq!(config.work_queue.url.as_deref(), Some("http://queue.local/extend"));
        assert_eq!(config.work_queue.source_bucket, DEFAULT_SOURCE_BUCKET);
        assert_eq!(config.query_url, DEFAULT_QUERY_URL);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(AuditConfig::from_file(file.path()), Err(AuditError::Config(_))));
    }

    #[test]
    fn test_overrides_apply() {
        let env: HashMap<&str, &str> = [
            (QUERY_URL_ENV, "http://localhost:8000/query"),
            (QUEUE_URL_ENV, "http://localhost:9000/queue"),
            (DEBUG_ENV, "TRUE"),
        ]
        .into_iter()
        .collect();
        let mut config = AuditConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.query_url, "http://localhost:8000/query");
        assert_eq!(config.work_queue.url.as_deref(), Some("http://localhost:9000/queue"));
        assert!(config.debug);
    }

    #[test]
    fn test_zero_batch_volume_rejected() {
        let config = AuditConfig {
            batch_volume: 0,
            ..AuditConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_volume"));
    }
}
