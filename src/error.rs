//! Rich diagnostic error types for the labelrail pipeline.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so operators know exactly
//! what went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the labelrail pipeline.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, source spans) through to the operator.
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Ontology(#[from] OntologyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Predict(#[from] PredictError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Stage(#[from] StageError),
}

// ---------------------------------------------------------------------------
// Ontology errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum OntologyError {
    #[error("divider mismatch: index built with {built:?}, caller expects {expected:?}")]
    #[diagnostic(
        code(rail::ontology::divider_mismatch),
        help(
            "The flattened index and the code consuming it disagree on the \
             name-path divider. Both sides must read the divider from the same \
             PipelineConfig; rebuild the index with the expected divider."
        )
    )]
    DividerMismatch { built: String, expected: String },

    #[error("feature schema {schema_id} has no entry in the flattened ontology")]
    #[diagnostic(
        code(rail::ontology::schema_not_found),
        help(
            "The schema id does not appear in the forward index. The ontology \
             used to build the index is likely older than the labels referencing \
             this feature; re-export the model's ontology and flatten again."
        )
    )]
    SchemaNotFound { schema_id: String },

    #[error("name path {name_path:?} has no entry in the inverted ontology")]
    #[diagnostic(
        code(rail::ontology::name_path_not_found),
        help(
            "The display name was not produced by flattening this ontology. \
             Check that predictions come from a model trained on the same \
             ontology, and that both sides used the same divider."
        )
    )]
    NamePathNotFound { name_path: String },
}

// ---------------------------------------------------------------------------
// Conversion errors (per-item, during ETL)
// ---------------------------------------------------------------------------

/// Failure converting one exported label or data row into a training record.
///
/// `InvalidDataRow` and `InvalidLabel` are the two recoverable kinds: the
/// batch transformer counts and drops them. Everything else aborts the batch.
#[derive(Debug, Error, Diagnostic)]
pub enum ConvertError {
    #[error("invalid data row {url}: {message}")]
    #[diagnostic(
        code(rail::convert::invalid_data_row),
        help(
            "The row's image could not be fetched or decoded (bad URL, \
             unsupported format, or dimensions past the decompression limit). \
             The row is dropped from the batch and counted; fix or remove the \
             asset in the labeling project to include it next run."
        )
    )]
    InvalidDataRow { url: String, message: String },

    #[error("invalid label for data row {data_row_id}: {message}")]
    #[diagnostic(
        code(rail::convert::invalid_label),
        help(
            "Single-classification training accepts at most one radio answer \
             per label. Remove the extra classifications from the label in the \
             annotation project."
        )
    )]
    InvalidLabel { data_row_id: String, message: String },

    #[error("worker pool unavailable: {message}")]
    #[diagnostic(
        code(rail::convert::worker_pool),
        help(
            "The OS refused to start the transform pool's threads. \
             Check process thread limits, or lower `etl_workers`."
        )
    )]
    WorkerPool { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),
}

impl ConvertError {
    /// Whether the batch transformer may drop this failure and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConvertError::InvalidDataRow { .. } | ConvertError::InvalidLabel { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Object storage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("I/O error on object {key}: {source}")]
    #[diagnostic(
        code(rail::storage::io),
        help(
            "A read or write against the object store failed. Check that the \
             store root exists, has correct permissions, and that the disk is \
             not full."
        )
    )]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object not found: {key}")]
    #[diagnostic(
        code(rail::storage::not_found),
        help("The requested object does not exist in the store. Verify the key is correct.")
    )]
    NotFound { key: String },

    #[error("upload failed for {key}: {message}")]
    #[diagnostic(
        code(rail::storage::upload),
        help(
            "The blob could not be written after exhausting retries. \
             Check bucket permissions and network connectivity."
        )
    )]
    Upload { key: String, message: String },

    #[error("locator {uri} does not belong to bucket {bucket}")]
    #[diagnostic(
        code(rail::storage::foreign_locator),
        help(
            "Resolving a locator back to a key only works for URIs this store \
             produced. Cross-bucket reads are not supported; copy the object \
             into the pipeline bucket first."
        )
    )]
    ForeignLocator { uri: String, bucket: String },
}

// ---------------------------------------------------------------------------
// Labeling-service client errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ClientError {
    #[error("transport error calling {endpoint}: {message}")]
    #[diagnostic(
        code(rail::client::transport),
        help(
            "The labeling service could not be reached after exhausting \
             retries. Check the endpoint URL and network connectivity."
        )
    )]
    Transport { endpoint: String, message: String },

    #[error("labeling service returned HTTP {status}: {message}")]
    #[diagnostic(
        code(rail::client::http),
        help(
            "The request was rejected. A 401/403 means the API key is wrong or \
             expired; a 404 means the run or project id does not exist."
        )
    )]
    Http { status: u16, message: String },

    #[error("malformed response from labeling service: {message}")]
    #[diagnostic(
        code(rail::client::decode),
        help(
            "The response body did not match the expected shape. The service \
             API may have changed; check for a labelrail update."
        )
    )]
    Decode { message: String },

    #[error("export not ready after {attempts} attempts")]
    #[diagnostic(
        code(rail::client::export_timeout),
        help(
            "The ground-truth export never produced a download URL within the \
             poll budget. Large projects can take longer; raise \
             `export_poll.max_attempts` in the pipeline config."
        )
    )]
    ExportTimeout { attempts: u32 },
}

// ---------------------------------------------------------------------------
// ML-platform errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PlatformError {
    #[error("job submission failed: {message}")]
    #[diagnostic(
        code(rail::platform::submit),
        help(
            "The ML platform rejected the job. Check quota, region, and that \
             the source artifact URI is readable by the platform's service \
             account."
        )
    )]
    Submit { message: String },

    #[error("job {display_name} not found")]
    #[diagnostic(
        code(rail::platform::job_not_found),
        help(
            "No job with this display name exists on the platform. The \
             training stage may have failed before submission; check its logs."
        )
    )]
    JobNotFound { display_name: String },

    #[error("job {display_name} still running after {attempts} polls")]
    #[diagnostic(
        code(rail::platform::poll_timeout),
        help(
            "The job did not reach a terminal state within the poll budget. \
             Raise `job_poll.max_attempts` in the pipeline config, or inspect \
             the job in the platform console."
        )
    )]
    PollTimeout { display_name: String, attempts: u32 },

    #[error("job {display_name} ended in state {state}")]
    #[diagnostic(
        code(rail::platform::job_failed),
        help(
            "The platform reports the job as failed or cancelled. The \
             platform console has the detailed failure reason."
        )
    )]
    JobFailed { display_name: String, state: String },
}

// ---------------------------------------------------------------------------
// Prediction reconciliation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PredictError {
    #[error("malformed prediction line: {message}")]
    #[diagnostic(
        code(rail::predict::decode),
        help(
            "A line in the prediction shard was not valid JSON of the expected \
             shape. The shard may be truncated; re-download it from the job's \
             output directory."
        )
    )]
    Decode { message: String },

    #[error("prediction carries no confidences")]
    #[diagnostic(
        code(rail::predict::empty_confidences),
        help(
            "Argmax over an empty confidence vector is undefined. This \
             usually means the model was trained on an empty ontology half; \
             verify the flattened ontology is non-empty."
        )
    )]
    EmptyConfidences,

    #[error("confidence vector has {confidences} entries but {names} display names")]
    #[diagnostic(
        code(rail::predict::shape_mismatch),
        help(
            "Confidences and display names must be parallel arrays. The \
             prediction shard is inconsistent; re-run batch inference."
        )
    )]
    ShapeMismatch { confidences: usize, names: usize },

    #[error("cannot recover a data row id from content uri {content_uri}")]
    #[diagnostic(
        code(rail::predict::data_row_unresolved),
        help(
            "The instance's content URI is neither present in the upload \
             manifest nor parseable as `{{dataRowId}}[_{{w}}_{{h}}].jpg`. The \
             instance file was probably built outside this pipeline."
        )
    )]
    DataRowUnresolved { content_uri: String },

    #[error("predicted class {name_path:?} is a root node, not an answer option")]
    #[diagnostic(
        code(rail::predict::not_an_option),
        help(
            "Radio predictions must resolve to an option under a parent \
             classification. The model's class names do not match this \
             ontology's leaves."
        )
    )]
    NotAnOption { name_path: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Ontology(#[from] OntologyError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    #[diagnostic(
        code(rail::config::read),
        help("Check that the path exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write config file {path}: {source}")]
    #[diagnostic(
        code(rail::config::write),
        help("Check directory permissions and free disk space.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {message}")]
    #[diagnostic(
        code(rail::config::parse),
        help("The TOML did not parse into a PipelineConfig. {message}")
    )]
    Parse { message: String },

    #[error("invalid config value: {message}")]
    #[diagnostic(
        code(rail::config::invalid_value),
        help("Adjust the offending field. {message}")
    )]
    InvalidValue { message: String },
}

// ---------------------------------------------------------------------------
// Stage-driver errors
// ---------------------------------------------------------------------------

/// Failure inside a pipeline stage driver.
///
/// Stage drivers catch these at the top, mark the model run `FAILED`, and
/// return an outcome value; a `StageError` escaping a driver means the
/// failure-status write itself also failed.
#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    #[error("trigger payload is missing required field {field}")]
    #[diagnostic(
        code(rail::stage::missing_field),
        help("The triggering message must carry this field for the requested stage.")
    )]
    MissingField { field: String },

    #[error("malformed trigger payload: {message}")]
    #[diagnostic(
        code(rail::stage::payload),
        help("The trigger body must be a JSON object; see the stage payload contract.")
    )]
    Payload { message: String },

    #[error("model type {model_type:?} does not name a supported pipeline")]
    #[diagnostic(
        code(rail::stage::unknown_model_kind),
        help(
            "Supported kinds are single-classification image pipelines and \
             their `MAL-Inference: `-prefixed inference-only variants. Check \
             the model run's type tag."
        )
    )]
    UnknownModelKind { model_type: String },

    #[error("cannot encode pipeline artifact: {message}")]
    #[diagnostic(
        code(rail::stage::encode),
        help("An NDJSON artifact failed to serialize; this indicates a bug in the record types.")
    )]
    Encode { message: String },

    #[error("every item in the batch was discarded ({invalid_data_rows} bad rows, {invalid_labels} bad labels)")]
    #[diagnostic(
        code(rail::stage::empty_batch),
        help(
            "Training needs at least one convertible example. Inspect the \
             discard warnings above for the per-row reasons."
        )
    )]
    EmptyBatch {
        invalid_data_rows: usize,
        invalid_labels: usize,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Ontology(#[from] OntologyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Predict(#[from] PredictError),
}

/// Convenience alias for functions returning labelrail results.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

pub type OntologyResult<T> = std::result::Result<T, OntologyError>;
pub type ConvertResult<T> = std::result::Result<T, ConvertError>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type ClientResult<T> = std::result::Result<T, ClientError>;
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;
pub type PredictResult<T> = std::result::Result<T, PredictError>;
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type StageResult<T> = std::result::Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_error_converts_to_pipeline_error() {
        let err = ConvertError::InvalidLabel {
            data_row_id: "row-1".into(),
            message: "two radio answers".into(),
        };
        let top: PipelineError = err.into();
        assert!(matches!(
            top,
            PipelineError::Convert(ConvertError::InvalidLabel { .. })
        ));
    }

    #[test]
    fn storage_error_is_fatal_inside_convert() {
        let err: ConvertError = StorageError::NotFound { key: "k".into() }.into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn recoverable_kinds_are_exactly_the_two_item_failures() {
        let row = ConvertError::InvalidDataRow {
            url: "https://example.com/a.jpg".into(),
            message: "404".into(),
        };
        let label = ConvertError::InvalidLabel {
            data_row_id: "row-1".into(),
            message: "two radio answers".into(),
        };
        assert!(row.is_recoverable());
        assert!(label.is_recoverable());
    }

    #[test]
    fn stage_error_wraps_platform_error() {
        let platform = PlatformError::PollTimeout {
            display_name: "job-1".into(),
            attempts: 10,
        };
        let stage: StageError = platform.into();
        assert!(matches!(
            stage,
            StageError::Platform(PlatformError::PollTimeout { .. })
        ));
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = PredictError::ShapeMismatch {
            confidences: 3,
            names: 2,
        };
        let msg = format!("{err}");
        assert!(msg.contains('3'));
        assert!(msg.contains('2'));
    }
}
