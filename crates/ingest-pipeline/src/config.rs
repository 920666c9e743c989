// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const MIN_SEGMENT_SIZE: u64 = 1024;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Sync policy for journal segment data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fsync after every appended batch
    Always,
    /// fsync at most once per interval, from the append path or the maintenance task
    Interval {
        #[serde(with = "duration_ms")]
        interval: Duration,
    },
    /// Leave syncing to the OS (testing only)
    Never,
}

/// Configuration for the on-disk message journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Directory holding segment files and the committed offset file
    pub directory: PathBuf,
    /// Soft maximum size of a single segment file in bytes
    pub segment_size: u64,
    /// Entries whose framed size exceeds this are discarded
    pub max_entry_size: usize,
    /// Size used to compute journal utilization; exceeding 95% logs a warning
    pub max_size: u64,
    pub sync_policy: SyncPolicy,
    /// How often committed offsets are persisted and committed segments removed
    #[serde(with = "duration_ms")]
    pub maintenance_interval: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/journal"),
            segment_size: 100 * 1024 * 1024,
            max_entry_size: 10 * 1024 * 1024,
            max_size: 5 * 1024 * 1024 * 1024,
            sync_policy: SyncPolicy::Interval {
                interval: Duration::from_secs(1),
            },
            maintenance_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration for one ring-buffer stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Number of ring slots; fixed for the lifetime of the stage
    pub capacity: usize,
    /// Number of workers; sequence `s` is handled by worker `s % workers`
    pub workers: usize,
    /// Overflow cache length at which the first growth warning is logged
    pub overflow_warn_threshold: usize,
}

impl StageConfig {
    pub fn new(capacity: usize, workers: usize) -> Self {
        Self {
            capacity,
            workers,
            ..Default::default()
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            capacity: 65536,
            workers: 5,
            overflow_warn_threshold: 10_000,
        }
    }
}

/// Configuration for the whole ingestion pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub journal: JournalConfig,
    pub process_stage: StageConfig,
    pub output_stage: StageConfig,
    /// Wake interval of the overflow drain workers
    #[serde(with = "duration_ms")]
    pub drain_interval: Duration,
    /// Poll interval while waiting for stages to empty during shutdown
    #[serde(with = "duration_ms")]
    pub shutdown_poll_interval: Duration,
    /// Upper bound on the graceful drain during shutdown
    #[serde(with = "duration_ms")]
    pub shutdown_max_wait: Duration,
    /// Backoff used by the journal writer; durability writes never give up
    pub write_retry: RetryPolicy,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            journal: JournalConfig::default(),
            process_stage: StageConfig::default(),
            output_stage: StageConfig {
                workers: 3,
                ..StageConfig::default()
            },
            drain_interval: Duration::from_millis(100),
            shutdown_poll_interval: Duration::from_secs(1),
            shutdown_max_wait: Duration::from_secs(30),
            write_retry: RetryPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

impl PipelineConfig {
    /// Create configuration from `INGEST_*` environment variables layered over the defaults
    pub fn from_env() -> Result<Self, PipelineError> {
        let mut config = Self::default();

        if let Ok(dir) = env::var("INGEST_JOURNAL_DIR") {
            if !dir.trim().is_empty() {
                config.journal.directory = PathBuf::from(dir.trim());
            }
        }
        if let Some(size) = env_parse("INGEST_JOURNAL_SEGMENT_SIZE") {
            config.journal.segment_size = size;
        }
        if let Some(size) = env_parse("INGEST_JOURNAL_MAX_SIZE") {
            config.journal.max_size = size;
        }
        if let Some(size) = env_parse("INGEST_JOURNAL_MAX_ENTRY_SIZE") {
            config.journal.max_entry_size = size;
        }
        if let Some(capacity) = env_parse("INGEST_PROCESS_BUFFER_SIZE") {
            config.process_stage.capacity = capacity;
        }
        if let Some(workers) = env_parse("INGEST_PROCESS_WORKERS") {
            config.process_stage.workers = workers;
        }
        if let Some(capacity) = env_parse("INGEST_OUTPUT_BUFFER_SIZE") {
            config.output_stage.capacity = capacity;
        }
        if let Some(workers) = env_parse("INGEST_OUTPUT_WORKERS") {
            config.output_stage.workers = workers;
        }
        if let Some(secs) = env_parse::<u64>("INGEST_SHUTDOWN_MAX_WAIT_SECS") {
            config.shutdown_max_wait = Duration::from_secs(secs);
        }
        if let Ok(level) = env::var("INGEST_LOG_LEVEL") {
            config.log_level = level.trim().to_lowercase();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (name, stage) in [
            ("process", &self.process_stage),
            ("output", &self.output_stage),
        ] {
            if stage.capacity == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} stage capacity must be greater than 0"
                )));
            }
            if stage.workers == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} stage needs at least one worker"
                )));
            }
        }

        if self.journal.segment_size < MIN_SEGMENT_SIZE {
            return Err(PipelineError::InvalidConfig(format!(
                "journal segment size must be at least {MIN_SEGMENT_SIZE} bytes"
            )));
        }

        if self.journal.max_entry_size as u64 > self.journal.segment_size {
            return Err(PipelineError::InvalidConfig(
                "journal max entry size cannot exceed the segment size".to_string(),
            ));
        }

        if self.journal.directory.as_os_str().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "journal directory cannot be empty".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(PipelineError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

/// Serde helpers storing a `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }

    pub(crate) mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub(crate) fn serialize<S>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.process_stage.workers, 5);
        assert_eq!(config.output_stage.workers, 3);
    }

    #[test]
    fn test_validate_zero_capacity() {
        let config = PipelineConfig {
            output_stage: StageConfig::new(0, 1),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("output stage capacity"));
    }

    #[test]
    fn test_validate_zero_workers() {
        let config = PipelineConfig {
            process_stage: StageConfig::new(16, 0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_entry_larger_than_segment() {
        let mut config = PipelineConfig::default();
        config.journal.segment_size = 4096;
        config.journal.max_entry_size = 8192;
        assert!(config.validate().is_err());

        config.journal.segment_size = 512;
        config.journal.max_entry_size = 256;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = PipelineConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{
                "journal": {
                    "directory": "/var/lib/ingest",
                    "sync_policy": {"type": "interval", "interval": 250}
                },
                "output_stage": {"capacity": 128, "workers": 2},
                "shutdown_max_wait": 2000,
                "write_retry": {
                    "backoff": {"type": "fixed", "delay": 10}
                }
            }"#,
        )
        .expect("config should parse");

        assert_eq!(config.journal.directory, PathBuf::from("/var/lib/ingest"));
        assert_eq!(
            config.journal.sync_policy,
            SyncPolicy::Interval {
                interval: Duration::from_millis(250)
            }
        );
        assert_eq!(config.journal.segment_size, JournalConfig::default().segment_size);
        assert_eq!(config.output_stage.capacity, 128);
        assert_eq!(config.output_stage.workers, 2);
        assert_eq!(
            config.output_stage.overflow_warn_threshold,
            StageConfig::default().overflow_warn_threshold
        );
        assert_eq!(config.shutdown_max_wait, Duration::from_secs(2));
        assert_eq!(config.write_retry.max_attempts, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_overrides() {
        // Only this test touches INGEST_* variables
        env::set_var("INGEST_PROCESS_BUFFER_SIZE", "1024");
        env::set_var("INGEST_OUTPUT_WORKERS", "7");
        env::set_var("INGEST_JOURNAL_DIR", "/tmp/ingest-journal");
        env::set_var("INGEST_SHUTDOWN_MAX_WAIT_SECS", "not-a-number");
        env::set_var("INGEST_LOG_LEVEL", "DEBUG");

        let config = PipelineConfig::from_env().expect("config from env");

        env::remove_var("INGEST_PROCESS_BUFFER_SIZE");
        env::remove_var("INGEST_OUTPUT_WORKERS");
        env::remove_var("INGEST_JOURNAL_DIR");
        env::remove_var("INGEST_SHUTDOWN_MAX_WAIT_SECS");
        env::remove_var("INGEST_LOG_LEVEL");

        assert_eq!(config.process_stage.capacity, 1024);
        assert_eq!(config.output_stage.workers, 7);
        assert_eq!(config.journal.directory, PathBuf::from("/tmp/ingest-journal"));
        assert_eq!(config.shutdown_max_wait, PipelineConfig::default().shutdown_max_wait);
        assert_eq!(config.log_level, "debug");
    }
}
