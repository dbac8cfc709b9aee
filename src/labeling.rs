//! Labeling-service client: the seam between the pipeline and the
//! annotation platform.
//!
//! Stage drivers only see [`LabelingClient`]; the HTTP implementation talks
//! GraphQL through a shared `ureq` agent, and tests substitute an in-process
//! fake. The ground-truth export is asynchronous on the service side, so
//! fetching it is a bounded poll for the download URL.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::{PollPolicy, RetryPolicy};
use crate::error::{ClientError, ClientResult};
use crate::etl::DataRow;
use crate::label::ExportedLabel;
use crate::metrics::GroundTruthRecord;
use crate::ndjson;
use crate::ontology::NormalizedOntology;
use crate::retry;

/// Model-run lifecycle status, as the service persists it. The pipeline's
/// only durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    ExportingData,
    PreparingData,
    TrainingModel,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::ExportingData => "EXPORTING_DATA",
            RunStatus::PreparingData => "PREPARING_DATA",
            RunStatus::TrainingModel => "TRAINING_MODEL",
            RunStatus::Complete => "COMPLETE",
            RunStatus::Failed => "FAILED",
        }
    }
}

/// Media type of a labeling project's data rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Text,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Text => "text",
        }
    }
}

/// Operations the pipeline needs from the labeling service.
pub trait LabelingClient: Send + Sync {
    /// The ontology backing a model, as a normalized tree.
    fn get_ontology(&self, model_id: &str) -> ClientResult<NormalizedOntology>;

    /// Ground-truth labels attached to a model run, for ETL. With
    /// `strip_subclasses` the export omits nested classifications under
    /// tools, which single-classification training never reads.
    fn export_labels(
        &self,
        run_id: &str,
        media_type: MediaType,
        strip_subclasses: bool,
    ) -> ClientResult<Vec<ExportedLabel>>;

    /// Unlabeled data rows attached to a model run, for inference-only ETL.
    fn export_data_rows(&self, run_id: &str) -> ClientResult<Vec<DataRow>>;

    /// Ground-truth annotation records for metric pairing. Polled until the
    /// service materializes a download URL, bounded by the export policy.
    fn export_ground_truth(&self, run_id: &str) -> ClientResult<Vec<GroundTruthRecord>>;

    /// Upload a named batch of prediction NDJSON to a model run.
    fn upload_predictions(&self, run_id: &str, batch_name: &str, body: &str) -> ClientResult<()>;

    /// Write the run's lifecycle status.
    fn set_run_status(&self, run_id: &str, status: RunStatus) -> ClientResult<()>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

const ONTOLOGY_QUERY: &str = "query modelOntology($modelId: ID!) { \
     model(where: {id: $modelId}) { ontology { normalized } } }";

const EXPORT_LABELS_QUERY: &str =
    "query exportRunLabels($runId: ID!, $mediaType: String!, $stripSubclasses: Boolean!) { \
     modelRun(where: {id: $runId}) { \
     exportLabels(mediaType: $mediaType, stripSubclasses: $stripSubclasses) { downloadUrl } } }";

const EXPORT_DATA_ROWS_QUERY: &str = "query exportRunDataRows($runId: ID!) { \
     modelRun(where: {id: $runId}) { dataRows { id rowData } } }";

const EXPORT_GROUND_TRUTH_MUTATION: &str = "mutation exportRunAnnotations($runId: ID!) { \
     exportModelRunAnnotations(data: {modelRunId: $runId}) { downloadUrl } }";

const UPLOAD_PREDICTIONS_MUTATION: &str =
    "mutation uploadPredictions($runId: ID!, $name: String!, $predictions: String!) { \
     createModelRunPredictionImport(data: \
     {modelRunId: $runId, name: $name, predictions: $predictions}) { id } }";

const SET_STATUS_MUTATION: &str = "mutation setRunStatus($runId: ID!, $status: String!) { \
     updateModelRunStatus(where: {id: $runId}, data: {status: $status}) { id } }";

/// GraphQL-over-HTTP client for the labeling service.
pub struct HttpLabelingClient {
    endpoint: String,
    api_key: String,
    agent: ureq::Agent,
    retry: RetryPolicy,
    export_poll: PollPolicy,
}

impl HttpLabelingClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        agent: ureq::Agent,
        retry: RetryPolicy,
        export_poll: PollPolicy,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            agent,
            retry,
            export_poll,
        }
    }

    /// One GraphQL round trip, retried under the transport policy.
    fn execute(&self, query: &str, variables: serde_json::Value) -> ClientResult<serde_json::Value> {
        let body = json!({ "query": query, "variables": variables });
        let response = retry::with_backoff(
            self.retry,
            || {
                self.agent
                    .post(&self.endpoint)
                    .set("Authorization", &format!("Bearer {}", self.api_key))
                    .send_json(body.clone())
            },
            transport_should_retry,
        )
        .map_err(|err| match err {
            ureq::Error::Status(status, response) => ClientError::Http {
                status,
                message: response.into_string().unwrap_or_default(),
            },
            other => ClientError::Transport {
                endpoint: self.endpoint.clone(),
                message: other.to_string(),
            },
        })?;

        let envelope: serde_json::Value =
            response.into_json().map_err(|e| ClientError::Decode {
                message: e.to_string(),
            })?;
        if let Some(errors) = envelope.get("errors").filter(|e| !e.is_null()) {
            return Err(ClientError::Decode {
                message: format!("GraphQL errors: {errors}"),
            });
        }
        envelope
            .get("data")
            .cloned()
            .ok_or_else(|| ClientError::Decode {
                message: "response carries no data member".into(),
            })
    }

    /// Fetch the body behind an export download URL.
    fn download(&self, url: &str) -> ClientResult<String> {
        let response = retry::with_backoff(
            self.retry,
            || self.agent.get(url).call(),
            transport_should_retry,
        )
        .map_err(|err| ClientError::Transport {
            endpoint: url.to_string(),
            message: err.to_string(),
        })?;
        response.into_string().map_err(|e| ClientError::Decode {
            message: e.to_string(),
        })
    }

    /// Re-run `fetch_url` until it yields a URL, bounded by the export
    /// policy.
    fn poll_download_url<F>(&self, mut fetch_url: F) -> ClientResult<String>
    where
        F: FnMut() -> ClientResult<Option<String>>,
    {
        for attempt in 1..=self.export_poll.max_attempts {
            if let Some(url) = fetch_url()? {
                return Ok(url);
            }
            debug!(attempt, "export not ready");
            if attempt < self.export_poll.max_attempts {
                std::thread::sleep(self.export_poll.interval());
            }
        }
        Err(ClientError::ExportTimeout {
            attempts: self.export_poll.max_attempts,
        })
    }
}

/// Transient server trouble retries; client-side rejections are final.
fn transport_should_retry(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        _ => true,
    }
}

fn string_at<'a>(value: &'a serde_json::Value, path: &[&str]) -> ClientResult<&'a str> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(key).ok_or_else(|| ClientError::Decode {
            message: format!("response is missing {}", path.join(".")),
        })?;
    }
    cursor.as_str().ok_or_else(|| ClientError::Decode {
        message: format!("{} is not a string", path.join(".")),
    })
}

impl LabelingClient for HttpLabelingClient {
    fn get_ontology(&self, model_id: &str) -> ClientResult<NormalizedOntology> {
        let data = self.execute(ONTOLOGY_QUERY, json!({ "modelId": model_id }))?;
        let normalized = data
            .pointer("/model/ontology/normalized")
            .ok_or_else(|| ClientError::Decode {
                message: "response carries no normalized ontology".into(),
            })?;
        serde_json::from_value(normalized.clone()).map_err(|e| ClientError::Decode {
            message: e.to_string(),
        })
    }

    fn export_labels(
        &self,
        run_id: &str,
        media_type: MediaType,
        strip_subclasses: bool,
    ) -> ClientResult<Vec<ExportedLabel>> {
        let data = self.execute(
            EXPORT_LABELS_QUERY,
            json!({
                "runId": run_id,
                "mediaType": media_type.as_str(),
                "stripSubclasses": strip_subclasses,
            }),
        )?;
        let url = string_at(&data, &["modelRun", "exportLabels", "downloadUrl"])?.to_string();
        let body = self.download(&url)?;
        let labels = ndjson::from_lines(&body).map_err(|e| ClientError::Decode {
            message: e.to_string(),
        })?;
        info!(run_id, count = labels.len(), "exported labels");
        Ok(labels)
    }

    fn export_data_rows(&self, run_id: &str) -> ClientResult<Vec<DataRow>> {
        let data = self.execute(EXPORT_DATA_ROWS_QUERY, json!({ "runId": run_id }))?;
        let rows = data
            .pointer("/modelRun/dataRows")
            .and_then(|rows| rows.as_array())
            .ok_or_else(|| ClientError::Decode {
                message: "response carries no data rows".into(),
            })?;
        rows.iter()
            .map(|row| {
                Ok(DataRow {
                    id: string_at(row, &["id"])?.to_string(),
                    row_data: string_at(row, &["rowData"])?.to_string(),
                })
            })
            .collect()
    }

    fn export_ground_truth(&self, run_id: &str) -> ClientResult<Vec<GroundTruthRecord>> {
        let url = self.poll_download_url(|| {
            let data =
                self.execute(EXPORT_GROUND_TRUTH_MUTATION, json!({ "runId": run_id }))?;
            let url = data.pointer("/exportModelRunAnnotations/downloadUrl");
            Ok(url.and_then(|u| u.as_str()).map(str::to_string))
        })?;
        let body = self.download(&url)?;
        ndjson::from_lines(&body).map_err(|e| ClientError::Decode {
            message: e.to_string(),
        })
    }

    fn upload_predictions(&self, run_id: &str, batch_name: &str, body: &str) -> ClientResult<()> {
        self.execute(
            UPLOAD_PREDICTIONS_MUTATION,
            json!({ "runId": run_id, "name": batch_name, "predictions": body }),
        )?;
        info!(run_id, batch_name, "uploaded predictions");
        Ok(())
    }

    fn set_run_status(&self, run_id: &str, status: RunStatus) -> ClientResult<()> {
        self.execute(
            SET_STATUS_MUTATION,
            json!({ "runId": run_id, "status": status.as_str() }),
        )?;
        info!(run_id, status = status.as_str(), "run status updated");
        Ok(())
    }
}

/// Shared HTTP agent configured for the labeling service's latencies.
pub fn labeling_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(Duration::from_secs(60))
        .timeout_write(Duration::from_secs(60))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_strings_match_the_service_vocabulary() {
        assert_eq!(RunStatus::ExportingData.as_str(), "EXPORTING_DATA");
        assert_eq!(RunStatus::PreparingData.as_str(), "PREPARING_DATA");
        assert_eq!(RunStatus::TrainingModel.as_str(), "TRAINING_MODEL");
        assert_eq!(RunStatus::Complete.as_str(), "COMPLETE");
        assert_eq!(RunStatus::Failed.as_str(), "FAILED");

        let json = serde_json::to_value(RunStatus::TrainingModel).unwrap();
        assert_eq!(json, "TRAINING_MODEL");
    }

    #[test]
    fn poll_returns_as_soon_as_a_url_appears() {
        let client = HttpLabelingClient::new(
            "https://api.example.com/graphql",
            "key",
            ureq::Agent::new(),
            RetryPolicy::default(),
            PollPolicy {
                max_attempts: 5,
                interval_secs: 0,
            },
        );

        let mut calls = 0u32;
        let url = client
            .poll_download_url(|| {
                calls += 1;
                Ok((calls == 3).then(|| "https://exports.example.com/x".to_string()))
            })
            .unwrap();
        assert_eq!(url, "https://exports.example.com/x");
        assert_eq!(calls, 3);
    }

    #[test]
    fn poll_exhaustion_is_a_typed_timeout() {
        let client = HttpLabelingClient::new(
            "https://api.example.com/graphql",
            "key",
            ureq::Agent::new(),
            RetryPolicy::default(),
            PollPolicy {
                max_attempts: 3,
                interval_secs: 0,
            },
        );

        let err = client.poll_download_url(|| Ok(None)).unwrap_err();
        assert!(matches!(err, ClientError::ExportTimeout { attempts: 3 }));
    }

    #[test]
    fn string_at_reports_the_missing_path() {
        let value = json!({ "modelRun": {} });
        let err = string_at(&value, &["modelRun", "exportLabels", "downloadUrl"]).unwrap_err();
        assert!(matches!(err, ClientError::Decode { .. }));
    }
}
