//! Stage drivers: the run lifecycle wired against the client seams.
//!
//! Each driver is the in-process translation of one webhook function from
//! the original deployment: parse the trigger payload, route on the model
//! type, drive the core through the clients, and communicate failure solely
//! by writing `FAILED` onto the model run. A driver never propagates its
//! error to the caller; the returned [`StageOutcome`] mirrors what the run
//! status already says.

use serde_json::Value;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{StageError, StageResult, StorageError};
use crate::etl::{self, ConvertContext, ImageManifest, TrainingRecord};
use crate::labeling::{LabelingClient, MediaType, RunStatus};
use crate::ndjson;
use crate::ontology::SchemaIndex;
use crate::platform::{self, BatchPredictSpec, MlPlatform, TrainingSpec};
use crate::pool::{DiscardTally, TransformPool};
use crate::predict::{self, ReconciledAnnotation};
use crate::retry;
use crate::storage::{self, ObjectStore};
use crate::{metrics, media};

/// Marker prefixing the model type of an inference-only run. The remainder
/// of the string is the trained model's display name.
pub const MAL_INFERENCE_PREFIX: &str = "MAL-Inference: ";

/// ETL kinds this pipeline knows how to drive. The kind rides inside a
/// model's display name as a `"--"`-delimited prefix so an inference-only
/// trigger can recover it from the name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtlKind {
    AutoMlImageClassification,
}

impl EtlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EtlKind::AutoMlImageClassification => "autoML_image_classification",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "autoML_image_classification" => Some(EtlKind::AutoMlImageClassification),
            _ => None,
        }
    }
}

/// Where a trigger's model type sends the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineRoute {
    /// Full train-then-diagnose pipeline.
    Train { etl_kind: EtlKind },
    /// Inference against an already-trained model.
    MalInference {
        model_display_name: String,
        etl_kind: EtlKind,
    },
}

/// Decide the pipeline variant from the trigger's model-type string.
pub fn route(model_type: &str) -> StageResult<PipelineRoute> {
    if let Some(rest) = strip_mal_prefix(model_type) {
        let model_display_name = rest.to_string();
        let kind_tag = model_display_name
            .split("--")
            .next()
            .unwrap_or(&model_display_name);
        let etl_kind =
            EtlKind::parse(kind_tag).ok_or_else(|| StageError::UnknownModelKind {
                model_type: model_type.to_string(),
            })?;
        Ok(PipelineRoute::MalInference {
            model_display_name,
            etl_kind,
        })
    } else {
        let etl_kind =
            EtlKind::parse(model_type).ok_or_else(|| StageError::UnknownModelKind {
                model_type: model_type.to_string(),
            })?;
        Ok(PipelineRoute::Train { etl_kind })
    }
}

/// The marker's casing is not guaranteed by the service, so the match is
/// case-insensitive; the remainder keeps its exact bytes.
fn strip_mal_prefix(model_type: &str) -> Option<&str> {
    let head = model_type.get(..MAL_INFERENCE_PREFIX.len())?;
    head.eq_ignore_ascii_case(MAL_INFERENCE_PREFIX)
        .then(|| &model_type[MAL_INFERENCE_PREFIX.len()..])
}

// ---------------------------------------------------------------------------
// Trigger payload
// ---------------------------------------------------------------------------

/// The JSON body every stage trigger carries.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerPayload {
    pub model_id: String,
    pub model_run_id: String,
    pub model_name: String,
    pub model_type: String,
}

impl TriggerPayload {
    /// Parse a trigger body, reporting the first missing required field.
    pub fn parse(body: &str) -> StageResult<Self> {
        let value: Value = serde_json::from_str(body).map_err(|e| StageError::Payload {
            message: e.to_string(),
        })?;
        if !value.is_object() {
            return Err(StageError::Payload {
                message: "trigger body must be a JSON object".into(),
            });
        }
        Ok(Self {
            model_id: required_field(&value, "modelId")?,
            model_run_id: required_field(&value, "modelRunId")?,
            model_name: required_field(&value, "modelName")?,
            model_type: required_field(&value, "modelType")?,
        })
    }
}

fn required_field(value: &Value, field: &str) -> StageResult<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| StageError::MissingField {
            field: field.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Context and outcome
// ---------------------------------------------------------------------------

/// Dependency bundle one pipeline run executes against. Clients are
/// constructed by the entry point and passed by reference; the context owns
/// nothing remote.
pub struct PipelineContext<'a> {
    pub config: &'a PipelineConfig,
    pub labeling: &'a dyn LabelingClient,
    pub platform: &'a dyn MlPlatform,
    pub store: &'a dyn ObjectStore,
    pub agent: ureq::Agent,
}

/// What a completed run produced. Failure carries nothing: the run status
/// is the failure channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub etl_file: String,
    pub converted: usize,
    pub discarded: DiscardTally,
    pub uploaded_predictions: usize,
    /// Ground-truth/prediction pairs that made it into metrics. Zero for
    /// inference-only runs, which compute none.
    pub scored_pairs: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(RunReport),
    Failed,
}

/// Run the pipeline variant the trigger's model type selects.
///
/// This is the single public entry: it writes `EXPORTING_DATA`, routes, and
/// applies the catch-all failure policy around the selected driver.
pub fn run_pipeline(ctx: &PipelineContext<'_>, payload: &TriggerPayload) -> StageOutcome {
    let span = info_span!("pipeline", run = %payload.model_run_id).entered();

    if let Err(err) = ctx
        .labeling
        .set_run_status(&payload.model_run_id, RunStatus::ExportingData)
    {
        error!(error = %err, "cannot reach the labeling service");
        drop(span);
        return StageOutcome::Failed;
    }

    let result = route(&payload.model_type).and_then(|route| match route {
        PipelineRoute::Train { etl_kind } => train_pipeline(ctx, payload, etl_kind),
        PipelineRoute::MalInference {
            model_display_name,
            etl_kind,
        } => mal_inference_pipeline(ctx, payload, &model_display_name, etl_kind),
    });

    let outcome = match result {
        Ok(report) => {
            info!(
                converted = report.converted,
                uploaded = report.uploaded_predictions,
                "pipeline complete"
            );
            StageOutcome::Completed(report)
        }
        Err(err) => {
            error!(error = %err, "pipeline failed, marking the run");
            if let Err(status_err) = ctx
                .labeling
                .set_run_status(&payload.model_run_id, RunStatus::Failed)
            {
                error!(error = %status_err, "failure-status write also failed");
            }
            StageOutcome::Failed
        }
    };
    drop(span);
    outcome
}

// ---------------------------------------------------------------------------
// Train pipeline
// ---------------------------------------------------------------------------

fn train_pipeline(
    ctx: &PipelineContext<'_>,
    payload: &TriggerPayload,
    etl_kind: EtlKind,
) -> StageResult<RunReport> {
    let run_id = &payload.model_run_id;
    let divider = ctx.config.divider();

    ctx.labeling.set_run_status(run_id, RunStatus::PreparingData)?;

    // ETL: export labels, convert them in parallel, upload the NDJSON file.
    let labels = ctx.labeling.export_labels(run_id, MediaType::Image, true)?;
    let ontology = ctx.labeling.get_ontology(&payload.model_id)?;
    let forward = SchemaIndex::build(&ontology, &divider);

    let manifest = ImageManifest::new();
    let pool = TransformPool::new(ctx.config.etl_workers)?;
    let convert_ctx = self::convert_context(ctx, &manifest);
    let outcome = pool.transform_batch(&labels, |label| etl::convert_label(&convert_ctx, label))?;
    require_nonempty(&outcome.items, outcome.discarded)?;
    info!(
        converted = outcome.items.len(),
        dropped = outcome.discarded.total(),
        "ETL conversion done"
    );

    let stamp = storage::timestamp_slug();
    let etl_body = ndjson_body(&outcome.items)?;
    let etl_file = upload_artifact(ctx, &storage::etl_key(run_id, &stamp), &etl_body)?;

    // Training. The kind prefix in the display name is what later
    // inference-only triggers route on.
    let display_name = format!("{}--{}", etl_kind.as_str(), payload.model_name);
    ctx.platform.launch_training(&TrainingSpec {
        display_name: display_name.clone(),
        etl_file: etl_file.clone(),
        run_id: run_id.clone(),
    })?;
    ctx.labeling.set_run_status(run_id, RunStatus::TrainingModel)?;
    platform::await_terminal_state(&display_name, ctx.config.job_poll, || {
        ctx.platform.training_state(&display_name)
    })?;

    // Post-train inference over the ETL rows, then metrics against the
    // run's ground truth.
    let annotations = batch_inference(ctx, payload, &display_name, etl_kind, &outcome.items, &manifest, &forward)?;
    let ground_truth = ctx.labeling.export_ground_truth(run_id)?;
    let report = metrics::compute_metrics(&ground_truth, &annotations, &forward)?;
    if report.scored.is_empty() {
        warn!("no ground-truth/prediction pairs matched; uploading unscored predictions");
    }

    let body = ndjson_body(&report.scored)?;
    ctx.labeling.upload_predictions(
        run_id,
        &format!("diagnostics-import-{}", Uuid::new_v4()),
        &body,
    )?;
    ctx.labeling.set_run_status(run_id, RunStatus::Complete)?;

    Ok(RunReport {
        etl_file,
        converted: outcome.items.len(),
        discarded: outcome.discarded,
        uploaded_predictions: annotations.len(),
        scored_pairs: report.scored.len(),
    })
}

// ---------------------------------------------------------------------------
// Inference-only pipeline
// ---------------------------------------------------------------------------

fn mal_inference_pipeline(
    ctx: &PipelineContext<'_>,
    payload: &TriggerPayload,
    model_display_name: &str,
    etl_kind: EtlKind,
) -> StageResult<RunReport> {
    let run_id = &payload.model_run_id;
    let divider = ctx.config.divider();

    ctx.labeling.set_run_status(run_id, RunStatus::PreparingData)?;

    let rows = ctx.labeling.export_data_rows(run_id)?;
    let ontology = ctx.labeling.get_ontology(&payload.model_id)?;
    let forward = SchemaIndex::build(&ontology, &divider);

    let manifest = ImageManifest::new();
    let pool = TransformPool::new(ctx.config.etl_workers)?;
    let convert_ctx = self::convert_context(ctx, &manifest);
    let outcome = pool.transform_batch(&rows, |row| etl::convert_data_row(&convert_ctx, row))?;
    require_nonempty(&outcome.items, outcome.discarded)?;

    let stamp = storage::timestamp_slug();
    let etl_body = ndjson_body(&outcome.items)?;
    let etl_file = upload_artifact(ctx, &storage::etl_key(run_id, &stamp), &etl_body)?;

    let annotations = batch_inference(ctx, payload, model_display_name, etl_kind, &outcome.items, &manifest, &forward)?;

    let body = ndjson_body(&annotations)?;
    ctx.labeling.upload_predictions(
        run_id,
        &format!("inference-import-{}", Uuid::new_v4()),
        &body,
    )?;
    ctx.labeling.set_run_status(run_id, RunStatus::Complete)?;

    Ok(RunReport {
        etl_file,
        converted: outcome.items.len(),
        discarded: outcome.discarded,
        uploaded_predictions: annotations.len(),
        scored_pairs: 0,
    })
}

// ---------------------------------------------------------------------------
// Shared steps
// ---------------------------------------------------------------------------

/// Build the instance file, run the batch job to completion, reconcile
/// every output shard.
fn batch_inference(
    ctx: &PipelineContext<'_>,
    payload: &TriggerPayload,
    model_display_name: &str,
    etl_kind: EtlKind,
    records: &[TrainingRecord],
    manifest: &ImageManifest,
    forward: &SchemaIndex,
) -> StageResult<Vec<ReconciledAnnotation>> {
    let divider = ctx.config.divider();
    let stamp = storage::timestamp_slug();

    let instances = etl::build_instance_lines(records);
    let instance_body = ndjson_body(&instances)?;
    let source_uri = upload_artifact(ctx, &storage::instance_key(&stamp), &instance_body)?;

    let destination = ctx
        .store
        .locator(&storage::inference_prefix(etl_kind.as_str(), &stamp));
    let job = ctx.platform.submit_batch_prediction(&BatchPredictSpec {
        job_display_name: payload.model_run_id.clone(),
        model_display_name: model_display_name.to_string(),
        machine_type: ctx.config.machine_type.clone(),
        source_uri,
        destination_prefix: destination,
    })?;
    platform::await_terminal_state(job.display_name(), ctx.config.job_poll, || job.state())?;

    let inverted = forward.invert();
    let mut annotations = Vec::new();
    for shard in job.output_shards()? {
        annotations.extend(predict::reconcile_lines(
            &shard,
            &inverted,
            &divider,
            Some(manifest),
        )?);
    }
    info!(predictions = annotations.len(), "reconciled batch output");
    Ok(annotations)
}

fn convert_context<'a>(
    ctx: &'a PipelineContext<'_>,
    manifest: &'a ImageManifest,
) -> ConvertContext<'a> {
    ConvertContext {
        agent: &ctx.agent,
        store: ctx.store,
        manifest,
        divider: ctx.config.divider(),
        downsample_factor: ctx.config.downsample_factor,
        max_image_dim: ctx.config.max_image_dim,
        retry: ctx.config.retry,
    }
}

fn require_nonempty(items: &[TrainingRecord], discarded: DiscardTally) -> StageResult<()> {
    if items.is_empty() {
        return Err(StageError::EmptyBatch {
            invalid_data_rows: discarded.invalid_data_rows,
            invalid_labels: discarded.invalid_labels,
        });
    }
    Ok(())
}

fn ndjson_body<T: serde::Serialize>(items: &[T]) -> StageResult<String> {
    ndjson::to_lines(items).map_err(|e| StageError::Encode {
        message: e.to_string(),
    })
}

/// Upload an NDJSON artifact under the storage retry boundary.
fn upload_artifact(ctx: &PipelineContext<'_>, key: &str, body: &str) -> StageResult<String> {
    let locator = retry::with_backoff(
        ctx.config.retry,
        || ctx.store.put(key, body.as_bytes(), "application/jsonl"),
        |err| matches!(err, StorageError::Upload { .. }),
    )?;
    Ok(locator)
}

/// The process-wide HTTP agent stage entry points hand to the context.
pub fn pipeline_agent() -> ureq::Agent {
    media::http_agent()
}
