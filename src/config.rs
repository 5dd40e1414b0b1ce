//! Engine configuration.
//!
//! [`DiffConfig`] is a plain struct with public fields, a [`Default`]
//! that suits small deployments, and a [`DiffConfig::validate`] called
//! from [`DiffEngine::open`](crate::engine::DiffEngine::open).
//! String-keyed access is available through [`DiffConfig::set`] for
//! hosts that thread options in from their own configuration surface;
//! unrecognised keys fail with [`ConfigError::UnknownOption`].

use thiserror::Error;
use tracing::warn;

use crate::backup::PruneMode;
use crate::diff::RenameDetection;

/// Errors raised by configuration parsing and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A string key that no configuration field answers to.
    #[error("unknown option: {0}")]
    UnknownOption(String),

    /// A value that failed to parse for its key.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// A field combination that fails validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for a [`DiffEngine`](crate::engine::DiffEngine)
/// instance.
#[derive(Debug, Clone)]
pub struct DiffConfig {
    /// Age (ms) beyond which compaction records and unneeded preserved
    /// SSTs are eligible for GC.
    pub retention_horizon_ms: u64,

    /// Preservation mode for newly preserved SSTs.
    pub prune_mode_default: PruneMode,

    /// Worker-pool upper bound.
    pub max_concurrent_jobs: usize,

    /// Submit-queue bound; submissions beyond it fail with `TooBusy`.
    pub max_queued_jobs: usize,

    /// Abort threshold protecting against runaway diffs. `None`
    /// disables the budget.
    pub per_job_key_budget: Option<u64>,

    /// Default deadline when the caller supplies none. `None` disables
    /// the default timeout.
    pub per_job_deadline_ms: Option<u64>,

    /// Maximum events per stored result page.
    pub result_page_size: usize,

    /// How long a finished job's results are retained before the
    /// janitor purges them.
    pub result_ttl_ms: u64,

    /// Rename-detection policy for the fast path.
    pub rename_detection: RenameDetection,

    /// Accepted for interface parity: the bundled reader *is* the
    /// native tombstone-aware reader. `false` logs a warning at open.
    pub prefer_native_sst_reader: bool,

    /// Merged keys between cooperative cancellation checks.
    pub cancel_check_interval: u64,

    /// Bound on quiescing in-flight jobs during shutdown.
    pub shutdown_deadline_ms: u64,

    /// Reject diffs whose `from` snapshot is newer than `to` instead of
    /// classifying them literally.
    pub reject_reverse_order: bool,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            retention_horizon_ms: 7 * 24 * 60 * 60 * 1000,
            prune_mode_default: PruneMode::Full,
            max_concurrent_jobs: 2,
            max_queued_jobs: 64,
            per_job_key_budget: None,
            per_job_deadline_ms: None,
            result_page_size: 1000,
            result_ttl_ms: 24 * 60 * 60 * 1000,
            rename_detection: RenameDetection::Off,
            prefer_native_sst_reader: true,
            cancel_check_interval: 4096,
            shutdown_deadline_ms: 5_000,
            reject_reverse_order: false,
        }
    }
}

impl DiffConfig {
    /// Check field constraints. Called from `DiffEngine::open`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid("max_concurrent_jobs must be > 0".into()));
        }
        if self.max_queued_jobs == 0 {
            return Err(ConfigError::Invalid("max_queued_jobs must be > 0".into()));
        }
        if self.result_page_size == 0 {
            return Err(ConfigError::Invalid("result_page_size must be > 0".into()));
        }
        if self.cancel_check_interval == 0 {
            return Err(ConfigError::Invalid(
                "cancel_check_interval must be > 0".into(),
            ));
        }
        if self.result_ttl_ms == 0 {
            return Err(ConfigError::Invalid("result_ttl_ms must be > 0".into()));
        }
        if !self.prefer_native_sst_reader {
            warn!("prefer_native_sst_reader=false: no alternative reader is compiled in, reads proceed natively");
        }
        Ok(())
    }

    /// Apply one string-keyed option.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(
            key: &'static str,
            value: &str,
        ) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                value: value.to_string(),
                reason: e.to_string(),
            })
        }

        match key {
            "retention_horizon" => self.retention_horizon_ms = parse("retention_horizon", value)?,
            "prune_mode_default" => {
                self.prune_mode_default = match value {
                    "full" | "FULL" => PruneMode::Full,
                    "pruned" | "PRUNED" => PruneMode::Pruned,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            key: "prune_mode_default",
                            value: other.to_string(),
                            reason: "expected full or pruned".into(),
                        });
                    }
                }
            }
            "max_concurrent_jobs" => {
                self.max_concurrent_jobs = parse("max_concurrent_jobs", value)?
            }
            "max_queued_jobs" => self.max_queued_jobs = parse("max_queued_jobs", value)?,
            "per_job_key_budget" => {
                self.per_job_key_budget = Some(parse("per_job_key_budget", value)?)
            }
            "per_job_deadline" => {
                self.per_job_deadline_ms = Some(parse("per_job_deadline", value)?)
            }
            "result_page_size" => self.result_page_size = parse("result_page_size", value)?,
            "result_ttl" => self.result_ttl_ms = parse("result_ttl", value)?,
            "rename_detection" => {
                self.rename_detection = match value {
                    "off" => RenameDetection::Off,
                    "same-bucket" | "same_bucket" => RenameDetection::SameBucket,
                    "global" => RenameDetection::Global,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            key: "rename_detection",
                            value: other.to_string(),
                            reason: "expected off, same-bucket, or global".into(),
                        });
                    }
                }
            }
            "prefer_native_sst_reader" => {
                self.prefer_native_sst_reader = parse("prefer_native_sst_reader", value)?
            }
            "cancel_check_interval" => {
                self.cancel_check_interval = parse("cancel_check_interval", value)?
            }
            "shutdown_deadline" => self.shutdown_deadline_ms = parse("shutdown_deadline", value)?,
            "reject_reverse_order" => {
                self.reject_reverse_order = parse("reject_reverse_order", value)?
            }
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }
        Ok(())
    }
}
