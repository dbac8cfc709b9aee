//! Pipeline configuration, persisted as TOML.
//!
//! One `PipelineConfig` is loaded at process start and threaded (by
//! reference) through every stage. Nothing in the pipeline reads tunables
//! from anywhere else; in particular the name-path divider has no ambient
//! default and must come from here.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::ontology::Divider;

/// Retry schedule for network boundary operations (image fetch, uploads).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    /// Ceiling on the exponentially growing delay, in milliseconds.
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
        }
    }
}

/// Bounded wait-then-poll schedule. Every poll loop in the pipeline runs
/// under one of these; exhaustion is a typed timeout error, never a hang.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval_secs: u64,
}

impl PollPolicy {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Divider joining display names into name paths (and back).
    #[serde(default = "default_divider")]
    pub divider: String,
    /// Linear downsample factor applied to every image (2.0 = half size).
    #[serde(default = "default_downsample_factor")]
    pub downsample_factor: f32,
    /// Worker threads in the ETL transform pool.
    #[serde(default = "default_etl_workers")]
    pub etl_workers: usize,
    /// Decode limit per image axis; larger images count as invalid rows.
    #[serde(default = "default_max_image_dim")]
    pub max_image_dim: u32,
    /// Machine type requested for batch prediction jobs.
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    /// Retry schedule for HTTP fetches and storage writes.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Poll schedule for the ground-truth export URL.
    #[serde(default = "default_export_poll")]
    pub export_poll: PollPolicy,
    /// Poll schedule for training and batch-prediction jobs.
    #[serde(default = "default_job_poll")]
    pub job_poll: PollPolicy,
}

fn default_divider() -> String {
    "_".into()
}
fn default_downsample_factor() -> f32 {
    2.0
}
fn default_etl_workers() -> usize {
    8
}
fn default_max_image_dim() -> u32 {
    10_000
}
fn default_machine_type() -> String {
    "n1-standard-4".into()
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    250
}
fn default_retry_max_ms() -> u64 {
    5_000
}
fn default_export_poll() -> PollPolicy {
    PollPolicy {
        max_attempts: 10,
        interval_secs: 10,
    }
}
fn default_job_poll() -> PollPolicy {
    PollPolicy {
        max_attempts: 240,
        interval_secs: 30,
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            divider: default_divider(),
            downsample_factor: default_downsample_factor(),
            etl_workers: default_etl_workers(),
            max_image_dim: default_max_image_dim(),
            machine_type: default_machine_type(),
            retry: RetryPolicy::default(),
            export_poll: default_export_poll(),
            job_poll: default_job_poll(),
        }
    }
}

impl PipelineConfig {
    /// The configured divider as the typed value the ontology layer takes.
    pub fn divider(&self) -> Divider {
        Divider::new(&self.divider)
    }

    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.divider.is_empty() {
            return Err(ConfigError::InvalidValue {
                message: "divider must be non-empty".into(),
            });
        }
        if !(self.downsample_factor >= 1.0) {
            return Err(ConfigError::InvalidValue {
                message: format!(
                    "downsample_factor must be >= 1.0, got {}",
                    self.downsample_factor
                ),
            });
        }
        if self.etl_workers == 0 {
            return Err(ConfigError::InvalidValue {
                message: "etl_workers must be at least 1".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                message: "retry.max_attempts must be at least 1".into(),
            });
        }
        if self.export_poll.max_attempts == 0 || self.job_poll.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                message: "poll policies need at least one attempt".into(),
            });
        }
        Ok(())
    }
}
