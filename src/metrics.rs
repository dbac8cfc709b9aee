//! Agreement metrics between exported ground truth and reconciled predictions.
//!
//! Pairs are formed by data-row id; rows present on only one side are
//! excluded from computation but counted in the [`MetricReport`] and logged.
//! Each pair contributes a confusion-matrix entry and a mean-IoU entry,
//! appended to the prediction so the upload carries both the answer and its
//! scores. Feature names are resolved through the *forward* ontology index
//! so the metric output is human-inspectable.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::OntologyResult;
use crate::ontology::{SchemaId, SchemaIndex};
use crate::predict::{AnswerRef, DataRowRef, ReconciledAnnotation};

/// One ground-truth annotation as the model-run export delivers it: the
/// parent classification's schema id plus the selected answer's, keyed by
/// data row. Same shape as the prediction upload, minus the uuid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthRecord {
    pub answer: AnswerRef,
    #[serde(rename = "dataRow")]
    pub data_row: DataRowRef,
    #[serde(rename = "schemaId")]
    pub schema_id: SchemaId,
}

/// Confusion counts for one feature pair: `[tp, fp, tn, fn]`.
///
/// Single-choice classification degenerates this to match/mismatch: an
/// agreeing pair is `[1, 0, 0, 0]`, a disagreeing one `[0, 1, 0, 1]` (the
/// predicted class is a false positive, the true class a false negative).
pub type ConfusionCounts = [u32; 4];

/// Metric values the pipeline attaches to a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metricName", content = "metricValue", rename_all = "snake_case")]
pub enum MetricValue {
    ConfusionMatrix(ConfusionCounts),
    Miou(f32),
}

/// One computed metric, in the labeling service's metric-annotation shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAnnotation {
    pub uuid: Uuid,
    #[serde(rename = "dataRow")]
    pub data_row: DataRowRef,
    /// Resolved display name of the feature the metric scores.
    #[serde(rename = "featureName")]
    pub feature_name: String,
    #[serde(flatten)]
    pub value: MetricValue,
}

/// A prediction annotated with its resolved feature name and metrics,
/// ready for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPrediction {
    #[serde(flatten)]
    pub annotation: ReconciledAnnotation,
    /// Resolved name of the predicted answer, spaces hyphenated.
    #[serde(rename = "featureName")]
    pub feature_name: String,
    /// Resolved name of the ground-truth answer for the same row.
    #[serde(rename = "groundTruthName")]
    pub ground_truth_name: String,
    pub metrics: Vec<MetricAnnotation>,
}

/// Metric computation output: scored predictions plus the pairing losses.
#[derive(Debug, Default)]
pub struct MetricReport {
    pub scored: Vec<ScoredPrediction>,
    /// Ground-truth rows with no prediction.
    pub unmatched_ground_truth: usize,
    /// Predictions with no ground-truth row.
    pub unmatched_predictions: usize,
}

impl MetricReport {
    /// Fraction of scored pairs whose answers agree.
    pub fn agreement_rate(&self) -> f32 {
        if self.scored.is_empty() {
            return 0.0;
        }
        let agreed = self
            .scored
            .iter()
            .filter(|scored| scored.feature_name == scored.ground_truth_name)
            .count();
        agreed as f32 / self.scored.len() as f32
    }
}

/// Pair ground truth with predictions by data-row id and score each pair.
///
/// `forward` must be the index of the ontology both sides were produced
/// from; a schema id missing from it is fatal (the lookup-error policy of
/// the flattener applies).
pub fn compute_metrics(
    ground_truth: &[GroundTruthRecord],
    predictions: &[ReconciledAnnotation],
    forward: &SchemaIndex,
) -> OntologyResult<MetricReport> {
    let truth_by_row: BTreeMap<&str, &GroundTruthRecord> = ground_truth
        .iter()
        .map(|record| (record.data_row.id.as_str(), record))
        .collect();

    let mut report = MetricReport::default();
    // Distinct truth rows with at least one prediction; a shard may carry
    // the same instance more than once.
    let mut matched_rows: BTreeSet<&str> = BTreeSet::new();

    for prediction in predictions {
        let Some(truth) = truth_by_row.get(prediction.data_row.id.as_str()) else {
            warn!(
                data_row = %prediction.data_row.id,
                "prediction has no ground-truth row, excluded from metrics"
            );
            report.unmatched_predictions += 1;
            continue;
        };
        matched_rows.insert(truth.data_row.id.as_str());
        report.scored.push(score_pair(truth, prediction, forward)?);
    }

    report.unmatched_ground_truth = ground_truth.len() - matched_rows.len();
    if report.unmatched_ground_truth > 0 {
        warn!(
            count = report.unmatched_ground_truth,
            "ground-truth rows without predictions, excluded from metrics"
        );
    }
    Ok(report)
}

fn score_pair(
    truth: &GroundTruthRecord,
    prediction: &ReconciledAnnotation,
    forward: &SchemaIndex,
) -> OntologyResult<ScoredPrediction> {
    let predicted_name = feature_name(forward, &prediction.answer.schema_id)?;
    let truth_name = feature_name(forward, &truth.answer.schema_id)?;
    let agree = prediction.answer.schema_id == truth.answer.schema_id;

    let confusion = if agree { [1, 0, 0, 0] } else { [0, 1, 0, 1] };
    let miou = if agree { 1.0 } else { 0.0 };

    let metrics = vec![
        MetricAnnotation {
            uuid: Uuid::new_v4(),
            data_row: prediction.data_row.clone(),
            feature_name: predicted_name.clone(),
            value: MetricValue::ConfusionMatrix(confusion),
        },
        MetricAnnotation {
            uuid: Uuid::new_v4(),
            data_row: prediction.data_row.clone(),
            feature_name: predicted_name.clone(),
            value: MetricValue::Miou(miou),
        },
    ];

    Ok(ScoredPrediction {
        annotation: prediction.clone(),
        feature_name: predicted_name,
        ground_truth_name: truth_name,
        metrics,
    })
}

/// The answer's full name path with spaces hyphenated, so downstream
/// displays treat it as one token.
fn feature_name(forward: &SchemaIndex, schema_id: &SchemaId) -> OntologyResult<String> {
    Ok(forward.require(schema_id)?.name_path.replace(' ', "-"))
}
