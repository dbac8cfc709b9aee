//! ML-platform seam: dataset creation, training jobs, batch prediction.
//!
//! The platform backend is opaque to the pipeline; stage drivers see only
//! [`MlPlatform`] and the [`PredictionJob`] handle it returns. Remote job
//! state is observed through bounded wait-then-poll loops; an exhausted
//! budget is a typed timeout, never a hang.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PollPolicy;
use crate::error::{PlatformError, PlatformResult};

/// Instance format every batch job in this pipeline uses.
pub const INSTANCES_FORMAT: &str = "jsonl";

/// Remote job state, collapsed to what the pipeline reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Parameters for a training launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSpec {
    /// Job and model display name; the pipeline names it
    /// `{etlKind}--{modelName}` so the kind survives into routing.
    pub display_name: String,
    /// Locator of the NDJSON ETL file the dataset is built from.
    pub etl_file: String,
    /// Model run the job belongs to.
    pub run_id: String,
}

/// Parameters for a batch-prediction submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPredictSpec {
    pub job_display_name: String,
    pub model_display_name: String,
    pub machine_type: String,
    /// Locator of the NDJSON instance file.
    pub source_uri: String,
    /// Prefix the job writes its output shards under.
    pub destination_prefix: String,
}

/// Handle on a submitted batch-prediction job.
pub trait PredictionJob {
    fn display_name(&self) -> &str;

    fn state(&self) -> PlatformResult<JobState>;

    /// The job's output shards, each one NDJSON text. Only meaningful once
    /// the job has succeeded.
    fn output_shards(&self) -> PlatformResult<Vec<String>>;
}

/// Operations the pipeline needs from the ML platform.
pub trait MlPlatform: Send + Sync {
    /// Create a dataset from an ETL file and launch training on it.
    fn launch_training(&self, spec: &TrainingSpec) -> PlatformResult<()>;

    /// State of the training job with this display name.
    fn training_state(&self, display_name: &str) -> PlatformResult<JobState>;

    /// Submit a batch-prediction job against a trained model.
    fn submit_batch_prediction(
        &self,
        spec: &BatchPredictSpec,
    ) -> PlatformResult<Box<dyn PredictionJob>>;
}

/// Poll `state` under the policy until it reports a terminal job state.
///
/// `Succeeded` returns; `Failed`/`Cancelled` is [`PlatformError::JobFailed`];
/// budget exhaustion is [`PlatformError::PollTimeout`].
pub fn await_terminal_state<F>(
    display_name: &str,
    policy: PollPolicy,
    mut state: F,
) -> PlatformResult<()>
where
    F: FnMut() -> PlatformResult<JobState>,
{
    for attempt in 1..=policy.max_attempts {
        let current = state()?;
        match current {
            JobState::Succeeded => {
                info!(job = display_name, "job succeeded");
                return Ok(());
            }
            JobState::Failed | JobState::Cancelled => {
                return Err(PlatformError::JobFailed {
                    display_name: display_name.to_string(),
                    state: current.to_string(),
                });
            }
            JobState::Pending | JobState::Running => {
                debug!(job = display_name, attempt, state = %current, "job not terminal");
                if attempt < policy.max_attempts {
                    std::thread::sleep(policy.interval());
                }
            }
        }
    }
    Err(PlatformError::PollTimeout {
        display_name: display_name.to_string(),
        attempts: policy.max_attempts,
    })
}
