//! Label and data-row conversion into the ML platform's training format.
//!
//! One [`TrainingRecord`] per convertible row: the uploaded image's locator,
//! a single class name (or the [`NO_LABEL`] sentinel), and resource labels
//! carrying the partition tag and the data-row id. Records serialize as
//! NDJSON with the platform's exact field casing.
//!
//! Uploads are also recorded in an [`ImageManifest`], the authoritative map
//! from content locator back to data-row identity at reconcile time.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::RetryPolicy;
use crate::error::{ConvertError, ConvertResult, StorageError};
use crate::label::{DataSplit, ExportedLabel};
use crate::media::{self, ProcessedImage};
use crate::ontology::Divider;
use crate::retry;
use crate::storage::{self, ObjectStore};

/// Class name given to rows with no radio answer (and to every inference
/// instance). Deliberately absent from any flattened ontology.
pub const NO_LABEL: &str = "no_label";

const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

/// Partition tag in the ML platform's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MlUse {
    Train,
    Test,
    Validation,
}

impl MlUse {
    pub fn as_str(&self) -> &'static str {
        match self {
            MlUse::Train => "train",
            MlUse::Test => "test",
            MlUse::Validation => "validation",
        }
    }
}

/// The fixed, total partition mapping between the two platforms.
impl From<DataSplit> for MlUse {
    fn from(split: DataSplit) -> Self {
        match split {
            DataSplit::Training => MlUse::Train,
            DataSplit::Test => MlUse::Test,
            DataSplit::Validation => MlUse::Validation,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// One line of the ETL output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRecord {
    pub image_gcs_uri: String,
    pub classification_annotation: ClassificationTarget,
    pub data_item_resource_labels: ResourceLabels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationTarget {
    pub display_name: String,
}

/// Resource labels ride the platform's mixed casing: `ml_use` stays snake
/// case, the row id is camel case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLabels {
    pub ml_use: MlUse,
    #[serde(rename = "dataRowId")]
    pub data_row_id: String,
}

/// One line of a batch-prediction instance file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceLine {
    pub content: String,
    pub mime_type: String,
}

/// Map ETL records to the instance file a batch-prediction job consumes.
pub fn build_instance_lines(records: &[TrainingRecord]) -> Vec<InstanceLine> {
    records
        .iter()
        .map(|record| InstanceLine {
            content: record.image_gcs_uri.clone(),
            mime_type: IMAGE_CONTENT_TYPE.to_string(),
        })
        .collect()
}

/// An unlabeled data row queued for inference-only conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    pub id: String,
    pub row_data: String,
}

// ---------------------------------------------------------------------------
// Upload manifest
// ---------------------------------------------------------------------------

/// Identity record for one uploaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub data_row_id: String,
    pub original_width: u32,
    pub original_height: u32,
}

/// Concurrent map from content locator to the identity of the row whose
/// image lives there. Written by the transform pool's workers, read back at
/// reconcile time; persisted beside the ETL file so a later stage in
/// another process can load it.
#[derive(Debug, Default)]
pub struct ImageManifest {
    entries: DashMap<String, ManifestEntry>,
}

impl ImageManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, locator: &str, entry: ManifestEntry) {
        self.entries.insert(locator.to_string(), entry);
    }

    pub fn lookup(&self, locator: &str) -> Option<ManifestEntry> {
        self.entries.get(locator).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize sorted by locator, so the persisted form is stable.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let sorted: BTreeMap<String, ManifestEntry> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        serde_json::to_string_pretty(&sorted)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        let sorted: BTreeMap<String, ManifestEntry> = serde_json::from_str(text)?;
        let entries = DashMap::new();
        for (locator, entry) in sorted {
            entries.insert(locator, entry);
        }
        Ok(Self { entries })
    }
}

// ---------------------------------------------------------------------------
// Converters
// ---------------------------------------------------------------------------

/// Everything one conversion needs besides the item itself. Shared across
/// the transform pool's workers.
pub struct ConvertContext<'a> {
    pub agent: &'a ureq::Agent,
    pub store: &'a dyn ObjectStore,
    pub manifest: &'a ImageManifest,
    pub divider: Divider,
    pub downsample_factor: f32,
    pub max_image_dim: u32,
    pub retry: RetryPolicy,
}

/// Convert one ground-truth label into a training record.
///
/// The image is fetched, downsampled, and re-uploaded under
/// `training/images/{dataRowId}.jpg`; the class name comes from the label's
/// single radio answer, or [`NO_LABEL`] when it has none.
pub fn convert_label(ctx: &ConvertContext<'_>, label: &ExportedLabel) -> ConvertResult<TrainingRecord> {
    let display_name = radio_display_name(&ctx.divider, label)?;
    let image = fetch_image(ctx, &label.row_data)?;
    let key = storage::image_key(&label.data_row_id, None);
    let locator = upload_image(ctx, &key, &label.data_row_id, &image)?;

    Ok(TrainingRecord {
        image_gcs_uri: locator,
        classification_annotation: ClassificationTarget { display_name },
        data_item_resource_labels: ResourceLabels {
            ml_use: label.data_split.into(),
            data_row_id: label.data_row_id.clone(),
        },
    })
}

/// Convert one unlabeled data row for batch inference.
///
/// Always [`NO_LABEL`], always `test` usage; the upload key carries the
/// original dimensions so they survive even without the manifest.
pub fn convert_data_row(ctx: &ConvertContext<'_>, row: &DataRow) -> ConvertResult<TrainingRecord> {
    let image = fetch_image(ctx, &row.row_data)?;
    let key = storage::image_key(&row.id, Some(image.original_dims()));
    let locator = upload_image(ctx, &key, &row.id, &image)?;

    Ok(TrainingRecord {
        image_gcs_uri: locator,
        classification_annotation: ClassificationTarget {
            display_name: NO_LABEL.to_string(),
        },
        data_item_resource_labels: ResourceLabels {
            ml_use: MlUse::Test,
            data_row_id: row.id.clone(),
        },
    })
}

/// At most one radio answer becomes `{attribute}{divider}{option}`; none
/// becomes the sentinel; two or more is an invalid label.
fn radio_display_name(divider: &Divider, label: &ExportedLabel) -> ConvertResult<String> {
    let mut names: Vec<String> = label
        .radio_answers()
        .map(|(annotation, option)| divider.join(&annotation.name, &option.name))
        .collect();
    if names.len() > 1 {
        return Err(ConvertError::InvalidLabel {
            data_row_id: label.data_row_id.clone(),
            message: format!(
                "single-classification training takes at most one radio answer, found {}",
                names.len()
            ),
        });
    }
    Ok(names.pop().unwrap_or_else(|| NO_LABEL.to_string()))
}

fn fetch_image(ctx: &ConvertContext<'_>, url: &str) -> ConvertResult<ProcessedImage> {
    media::fetch_and_shrink(ctx.agent, url, ctx.downsample_factor, ctx.max_image_dim, ctx.retry)
}

fn upload_image(
    ctx: &ConvertContext<'_>,
    key: &str,
    data_row_id: &str,
    image: &ProcessedImage,
) -> ConvertResult<String> {
    let locator = retry::with_backoff(
        ctx.retry,
        || ctx.store.put(key, &image.jpeg, IMAGE_CONTENT_TYPE),
        |err| matches!(err, StorageError::Upload { .. }),
    )?;
    ctx.manifest.record(
        &locator,
        ManifestEntry {
            data_row_id: data_row_id.to_string(),
            original_width: image.original_width,
            original_height: image.original_height,
        },
    );
    Ok(locator)
}
