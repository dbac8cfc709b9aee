//! Prediction reconciliation: batch-inference output back into the labeling
//! service's annotation format.
//!
//! Each successful instance contributes one radio annotation: the class with
//! the highest confidence (first maximum wins) resolves through the inverted
//! ontology index to an option schema id plus its parent classification, and
//! the data-row identity comes from the upload manifest, falling back to
//! parsing the content URI's basename. Instances carrying an `error` member
//! are skipped.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{PredictError, PredictResult};
use crate::etl::ImageManifest;
use crate::ndjson;
use crate::ontology::{Divider, NamePathIndex, SchemaId};
use crate::storage;

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// One line of a batch-prediction output shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionLine {
    pub instance: PredictionInstance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<RawPrediction>,
    /// Present instead of `prediction` when the platform failed the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionInstance {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Parallel candidate arrays: `confidences[i]` scores `display_names[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPrediction {
    pub confidences: Vec<f32>,
    pub display_names: Vec<String>,
}

/// A prediction in the labeling service's native radio-annotation shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledAnnotation {
    pub uuid: Uuid,
    pub answer: AnswerRef,
    #[serde(rename = "dataRow")]
    pub data_row: DataRowRef,
    /// The parent classification the answer belongs to.
    #[serde(rename = "schemaId")]
    pub schema_id: SchemaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRef {
    #[serde(rename = "schemaId")]
    pub schema_id: SchemaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRowRef {
    pub id: String,
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Reconcile one shard of NDJSON prediction output.
///
/// The inverted index must have been built with the caller's divider; the
/// mismatch is caught here at the boundary rather than surfacing as missed
/// lookups.
pub fn reconcile_lines(
    text: &str,
    inverted: &NamePathIndex,
    divider: &Divider,
    manifest: Option<&ImageManifest>,
) -> PredictResult<Vec<ReconciledAnnotation>> {
    inverted.assert_divider(divider)?;

    let lines: Vec<PredictionLine> =
        ndjson::from_lines(text).map_err(|e| PredictError::Decode {
            message: e.to_string(),
        })?;

    let mut annotations = Vec::with_capacity(lines.len());
    for line in lines {
        if line.error.is_some() {
            debug!(content = %line.instance.content, "skipping errored instance");
            continue;
        }
        let Some(prediction) = line.prediction else {
            return Err(PredictError::Decode {
                message: format!(
                    "instance {} carries neither a prediction nor an error",
                    line.instance.content
                ),
            });
        };
        annotations.push(reconcile_one(
            &line.instance.content,
            &prediction,
            inverted,
            manifest,
        )?);
    }
    Ok(annotations)
}

fn reconcile_one(
    content_uri: &str,
    prediction: &RawPrediction,
    inverted: &NamePathIndex,
    manifest: Option<&ImageManifest>,
) -> PredictResult<ReconciledAnnotation> {
    if prediction.confidences.len() != prediction.display_names.len() {
        return Err(PredictError::ShapeMismatch {
            confidences: prediction.confidences.len(),
            names: prediction.display_names.len(),
        });
    }

    let winner_idx = argmax(&prediction.confidences)?;
    let winner = &prediction.display_names[winner_idx];

    let entry = inverted.require(winner)?;
    let parent_schema_id = entry
        .parent_schema_id
        .clone()
        .ok_or_else(|| PredictError::NotAnOption {
            name_path: winner.clone(),
        })?;

    Ok(ReconciledAnnotation {
        uuid: Uuid::new_v4(),
        answer: AnswerRef {
            schema_id: entry.feature_schema_id.clone(),
        },
        data_row: DataRowRef {
            id: recover_data_row_id(content_uri, manifest)?,
        },
        schema_id: parent_schema_id,
    })
}

/// Index of the first maximum confidence.
fn argmax(confidences: &[f32]) -> PredictResult<usize> {
    let Some(&first) = confidences.first() else {
        return Err(PredictError::EmptyConfidences);
    };
    let mut best = 0usize;
    let mut best_value = first;
    for (idx, &value) in confidences.iter().enumerate().skip(1) {
        if value > best_value {
            best = idx;
            best_value = value;
        }
    }
    Ok(best)
}

/// The manifest is authoritative; the key convention is the fallback for
/// instance files built before the manifest existed.
fn recover_data_row_id(
    content_uri: &str,
    manifest: Option<&ImageManifest>,
) -> PredictResult<String> {
    if let Some(manifest) = manifest {
        if let Some(entry) = manifest.lookup(content_uri) {
            return Ok(entry.data_row_id);
        }
    }
    let parsed = storage::parse_image_locator(content_uri);
    if parsed.data_row_id.is_empty() {
        return Err(PredictError::DataRowUnresolved {
            content_uri: content_uri.to_string(),
        });
    }
    Ok(parsed.data_row_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OntologyError;
    use crate::etl::ManifestEntry;
    use crate::ontology::{
        Classification, NormalizedOntology, OptionNode, SchemaIndex,
    };

    fn color_index(divider: &Divider) -> NamePathIndex {
        let ontology = NormalizedOntology {
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
        };
        SchemaIndex::build(&ontology, divider).invert()
    }

    fn shard_line(content: &str, confidences: &[f32], names: &[&str]) -> String {
        serde_json::to_string(&PredictionLine {
            instance: PredictionInstance {
                content: content.into(),
                mime_type: Some("image/jpeg".into()),
            },
            prediction: Some(RawPrediction {
                confidences: confidences.to_vec(),
                display_names: names.iter().map(|s| s.to_string()).collect(),
            }),
            error: None,
        })
        .unwrap()
    }

    #[test]
    fn argmax_takes_the_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]).unwrap(), 1);
        assert_eq!(argmax(&[0.5, 0.5]).unwrap(), 0);
        assert_eq!(argmax(&[0.9]).unwrap(), 0);
        assert!(matches!(argmax(&[]), Err(PredictError::EmptyConfidences)));
    }

    #[test]
    fn winning_name_resolves_to_option_and_parent() {
        let divider = Divider::new("_");
        let inverted = color_index(&divider);
        let shard = shard_line(
            "gs://bucket/training/images/row-1.jpg",
            &[0.1, 0.7, 0.2],
            &["Color_Red", "Color_Blue", "no_label"],
        );

        let annotations = reconcile_lines(&shard, &inverted, &divider, None).unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].answer.schema_id, SchemaId::new("c1o2"));
        assert_eq!(annotations[0].schema_id, SchemaId::new("c1"));
        assert_eq!(annotations[0].data_row.id, "row-1");
    }

    #[test]
    fn errored_instances_are_skipped() {
        let divider = Divider::new("_");
        let inverted = color_index(&divider);
        let errored = serde_json::json!({
            "instance": {"content": "gs://bucket/training/images/row-2.jpg"},
            "error": {"code": 3, "message": "payload too large"}
        });
        let shard = format!(
            "{}\n{}\n",
            errored,
            shard_line(
                "gs://bucket/training/images/row-1.jpg",
                &[0.9, 0.1],
                &["Color_Red", "Color_Blue"],
            )
        );

        let annotations = reconcile_lines(&shard, &inverted, &divider, None).unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].data_row.id, "row-1");
    }

    #[test]
    fn unknown_winner_is_fatal() {
        let divider = Divider::new("_");
        let inverted = color_index(&divider);
        let shard = shard_line(
            "gs://bucket/training/images/row-1.jpg",
            &[0.8, 0.2],
            &["no_label", "Color_Red"],
        );

        let err = reconcile_lines(&shard, &inverted, &divider, None).unwrap_err();
        assert!(matches!(
            err,
            PredictError::Ontology(OntologyError::NamePathNotFound { .. })
        ));
    }

    #[test]
    fn confidence_and_name_arrays_must_be_parallel() {
        let divider = Divider::new("_");
        let inverted = color_index(&divider);
        let shard = shard_line(
            "gs://bucket/training/images/row-1.jpg",
            &[0.8, 0.1, 0.1],
            &["Color_Red", "Color_Blue"],
        );

        let err = reconcile_lines(&shard, &inverted, &divider, None).unwrap_err();
        assert!(matches!(err, PredictError::ShapeMismatch { confidences: 3, names: 2 }));
    }

    #[test]
    fn divider_mismatch_is_caught_at_the_boundary() {
        let inverted = color_index(&Divider::new("_"));
        let err = reconcile_lines("", &inverted, &Divider::new("///"), None).unwrap_err();
        assert!(matches!(
            err,
            PredictError::Ontology(OntologyError::DividerMismatch { .. })
        ));
    }

    #[test]
    fn manifest_wins_over_the_key_convention() {
        let divider = Divider::new("_");
        let inverted = color_index(&divider);
        let manifest = ImageManifest::new();
        manifest.record(
            "gs://bucket/training/images/opaque-key.jpg",
            ManifestEntry {
                data_row_id: "row-from-manifest".into(),
                original_width: 640,
                original_height: 480,
            },
        );
        let shard = shard_line(
            "gs://bucket/training/images/opaque-key.jpg",
            &[1.0, 0.0],
            &["Color_Red", "Color_Blue"],
        );

        let annotations =
            reconcile_lines(&shard, &inverted, &divider, Some(&manifest)).unwrap();
        assert_eq!(annotations[0].data_row.id, "row-from-manifest");
    }

    #[test]
    fn key_fallback_strips_the_dims_suffix() {
        let divider = Divider::new("_");
        let inverted = color_index(&divider);
        let shard = shard_line(
            "gs://bucket/training/images/row-9_640_480.jpg",
            &[1.0, 0.0],
            &["Color_Red", "Color_Blue"],
        );

        let annotations = reconcile_lines(&shard, &inverted, &divider, None).unwrap();
        assert_eq!(annotations[0].data_row.id, "row-9");
    }

    #[test]
    fn root_predictions_are_rejected() {
        let divider = Divider::new("_");
        let inverted = color_index(&divider);
        let shard = shard_line(
            "gs://bucket/training/images/row-1.jpg",
            &[1.0],
            &["Color"],
        );

        let err = reconcile_lines(&shard, &inverted, &divider, None).unwrap_err();
        assert!(matches!(err, PredictError::NotAnOption { .. }));
    }

    #[test]
    fn annotation_serializes_in_the_upload_shape() {
        let annotation = ReconciledAnnotation {
            uuid: Uuid::nil(),
            answer: AnswerRef {
                schema_id: SchemaId::new("c1o1"),
            },
            data_row: DataRowRef { id: "row-1".into() },
            schema_id: SchemaId::new("c1"),
        };
        let json = serde_json::to_value(&annotation).unwrap();
        assert_eq!(json["answer"]["schemaId"], "c1o1");
        assert_eq!(json["dataRow"]["id"], "row-1");
        assert_eq!(json["schemaId"], "c1");
    }
}
