//! Shared fixtures for the pipeline integration tests: in-process fakes for
//! the labeling service and the ML platform, plus a loopback image server.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use labelrail::config::{PipelineConfig, PollPolicy, RetryPolicy};
use labelrail::error::{ClientResult, PlatformError, PlatformResult};
use labelrail::etl::{DataRow, InstanceLine};
use labelrail::label::ExportedLabel;
use labelrail::labeling::{LabelingClient, MediaType, RunStatus};
use labelrail::metrics::GroundTruthRecord;
use labelrail::ndjson;
use labelrail::ontology::{Classification, NormalizedOntology, OptionNode, SchemaId};
use labelrail::platform::{
    BatchPredictSpec, JobState, MlPlatform, PredictionJob, TrainingSpec,
};
use labelrail::storage::{MemoryStore, ObjectStore};

/// Config with all waits zeroed so tests never sleep.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        divider: "_".into(),
        downsample_factor: 2.0,
        etl_workers: 4,
        max_image_dim: 10_000,
        machine_type: "test-machine".into(),
        retry: RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        },
        export_poll: PollPolicy {
            max_attempts: 2,
            interval_secs: 0,
        },
        job_poll: PollPolicy {
            max_attempts: 10,
            interval_secs: 0,
        },
    }
}

/// The `Color { Red, Blue }` ontology every scenario uses.
pub fn color_ontology() -> NormalizedOntology {
    NormalizedOntology {
        tools: Vec::new(),
        classifications: vec![Classification {
            instructions: "Color".into(),
            feature_schema_id: SchemaId::new("c1"),
            options: vec![
                OptionNode {
                    label: "Red".into(),
                    feature_schema_id: SchemaId::new("c1o1"),
                    options: Vec::new(),
                },
                OptionNode {
                    label: "Blue".into(),
                    feature_schema_id: SchemaId::new("c1o2"),
                    options: Vec::new(),
                },
            ],
        }],
    }
}

// ---------------------------------------------------------------------------
// Loopback image server
// ---------------------------------------------------------------------------

fn serve(listener: TcpListener, response: Vec<u8>) {
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(&response);
        }
    });
}

/// Serve the same PNG for every request; returns the base URL.
pub fn serve_png(width: u32, height: u32) -> String {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([180, 40, 40]));
    let mut png = Vec::new();
    img.write_with_encoder(image::codecs::png::PngEncoder::new(&mut png))
        .unwrap();

    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        png.len()
    )
    .into_bytes();
    response.extend_from_slice(&png);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    serve(listener, response);
    format!("http://{addr}")
}

/// Serve 404 for every request; returns the base URL.
pub fn serve_not_found() -> String {
    let response =
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    serve(listener, response);
    format!("http://{addr}")
}

// ---------------------------------------------------------------------------
// Fake labeling service
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeLabeling {
    pub ontology: NormalizedOntology,
    pub labels: Vec<ExportedLabel>,
    pub data_rows: Vec<DataRow>,
    pub ground_truth: Vec<GroundTruthRecord>,
    pub statuses: Mutex<Vec<RunStatus>>,
    /// (batch name, NDJSON body) per upload.
    pub uploads: Mutex<Vec<(String, String)>>,
}

impl FakeLabeling {
    pub fn status_trail(&self) -> Vec<RunStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn last_status(&self) -> Option<RunStatus> {
        self.statuses.lock().unwrap().last().copied()
    }
}

impl LabelingClient for FakeLabeling {
    fn get_ontology(&self, _model_id: &str) -> ClientResult<NormalizedOntology> {
        Ok(self.ontology.clone())
    }

    fn export_labels(
        &self,
        _run_id: &str,
        _media_type: MediaType,
        _strip_subclasses: bool,
    ) -> ClientResult<Vec<ExportedLabel>> {
        Ok(self.labels.clone())
    }

    fn export_data_rows(&self, _run_id: &str) -> ClientResult<Vec<DataRow>> {
        Ok(self.data_rows.clone())
    }

    fn export_ground_truth(&self, _run_id: &str) -> ClientResult<Vec<GroundTruthRecord>> {
        Ok(self.ground_truth.clone())
    }

    fn upload_predictions(&self, _run_id: &str, batch_name: &str, body: &str) -> ClientResult<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((batch_name.to_string(), body.to_string()));
        Ok(())
    }

    fn set_run_status(&self, _run_id: &str, status: RunStatus) -> ClientResult<()> {
        self.statuses.lock().unwrap().push(status);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake ML platform
// ---------------------------------------------------------------------------

/// Scores every instance the same way: `display_names[winner_index]` wins
/// with 0.9 confidence. Output shards are synthesized from the submitted
/// instance file, so the content URIs round-trip for real.
pub struct FakePlatform {
    pub store: Arc<MemoryStore>,
    pub display_names: Vec<String>,
    pub winner_index: usize,
    pub fail_training: bool,
    /// Polls reporting `Running` before the training job succeeds.
    pub training_polls_required: u32,
    training_polls: AtomicU32,
    pub launched: Mutex<Vec<TrainingSpec>>,
    pub submitted: Mutex<Vec<BatchPredictSpec>>,
}

impl FakePlatform {
    pub fn new(store: Arc<MemoryStore>, display_names: Vec<String>, winner_index: usize) -> Self {
        Self {
            store,
            display_names,
            winner_index,
            fail_training: false,
            training_polls_required: 2,
            training_polls: AtomicU32::new(0),
            launched: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }
}

impl MlPlatform for FakePlatform {
    fn launch_training(&self, spec: &TrainingSpec) -> PlatformResult<()> {
        self.launched.lock().unwrap().push(spec.clone());
        Ok(())
    }

    fn training_state(&self, _display_name: &str) -> PlatformResult<JobState> {
        if self.fail_training {
            return Ok(JobState::Failed);
        }
        let polls = self.training_polls.fetch_add(1, Ordering::SeqCst) + 1;
        if polls < self.training_polls_required {
            Ok(JobState::Running)
        } else {
            Ok(JobState::Succeeded)
        }
    }

    fn submit_batch_prediction(
        &self,
        spec: &BatchPredictSpec,
    ) -> PlatformResult<Box<dyn PredictionJob>> {
        self.submitted.lock().unwrap().push(spec.clone());

        let key = self
            .store
            .resolve(&spec.source_uri)
            .map_err(|e| PlatformError::Submit {
                message: e.to_string(),
            })?;
        let body = self.store.get(&key).map_err(|e| PlatformError::Submit {
            message: e.to_string(),
        })?;
        let instances: Vec<InstanceLine> =
            ndjson::from_lines(&String::from_utf8_lossy(&body)).map_err(|e| {
                PlatformError::Submit {
                    message: e.to_string(),
                }
            })?;

        let confidences: Vec<f32> = (0..self.display_names.len())
            .map(|i| if i == self.winner_index { 0.9 } else { 0.05 })
            .collect();
        let shard = instances
            .iter()
            .map(|instance| {
                serde_json::json!({
                    "instance": {"content": instance.content, "mimeType": instance.mime_type},
                    "prediction": {
                        "confidences": confidences,
                        "displayNames": self.display_names,
                    }
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(Box::new(FakeJob {
            display_name: spec.job_display_name.clone(),
            shard,
            polls: AtomicU32::new(0),
        }))
    }
}

pub struct FakeJob {
    display_name: String,
    shard: String,
    polls: AtomicU32,
}

impl PredictionJob for FakeJob {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn state(&self) -> PlatformResult<JobState> {
        // One Running poll before completion, so the await loop is exercised.
        if self.polls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(JobState::Running)
        } else {
            Ok(JobState::Succeeded)
        }
    }

    fn output_shards(&self) -> PlatformResult<Vec<String>> {
        Ok(vec![self.shard.clone()])
    }
}
