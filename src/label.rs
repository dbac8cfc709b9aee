//! Wire shapes for labels exported from the labeling service.
//!
//! One [`ExportedLabel`] per data row, NDJSON in export files. Annotation
//! values are a closed set: the untagged serde enum picks the variant from
//! the field that is present (`radio_answer`, `checklist_answers`,
//! `text_answer`).

use serde::{Deserialize, Serialize};

use crate::ontology::SchemaId;

/// Partition tag assigned to a data row in the labeling project.
///
/// A closed enum on purpose: an export carrying any other tag fails to
/// decode instead of flowing through the pipeline unmapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSplit {
    Training,
    Test,
    Validation,
}

/// One ground-truth label for one data row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedLabel {
    pub data_row_id: String,
    /// Signed URL for the row's image asset.
    pub row_data: String,
    pub data_split: DataSplit,
    #[serde(default)]
    pub annotations: Vec<ClassificationAnnotation>,
}

/// One answered classification inside a label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationAnnotation {
    /// The classification's display name (the attribute).
    pub name: String,
    pub feature_schema_id: SchemaId,
    #[serde(flatten)]
    pub value: AnnotationValue,
}

/// The classification's answer. Only radio answers participate in
/// single-classification training; the other kinds ride through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnnotationValue {
    Radio { radio_answer: SelectedOption },
    Checklist { checklist_answers: Vec<SelectedOption> },
    Text { text_answer: String },
}

/// A selected answer option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedOption {
    pub name: String,
    pub feature_schema_id: SchemaId,
}

impl ExportedLabel {
    /// The label's radio answers as (attribute, option) pairs, in export
    /// order. Checklist and text annotations are not part of the
    /// single-classification contract and are skipped.
    pub fn radio_answers(&self) -> impl Iterator<Item = (&ClassificationAnnotation, &SelectedOption)> {
        self.annotations.iter().filter_map(|annotation| {
            match &annotation.value {
                AnnotationValue::Radio { radio_answer } => Some((annotation, radio_answer)),
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_decodes_from_export_json() {
        let json = r#"{
            "data_row_id": "row-1",
            "row_data": "https://assets.example.com/row-1.png",
            "data_split": "training",
            "annotations": [
                {
                    "name": "Color",
                    "feature_schema_id": "c1",
                    "radio_answer": {"name": "Red", "feature_schema_id": "c1o1"}
                },
                {
                    "name": "Notes",
                    "feature_schema_id": "c2",
                    "text_answer": "slightly blurry"
                }
            ]
        }"#;
        let label: ExportedLabel = serde_json::from_str(json).unwrap();
        assert_eq!(label.data_split, DataSplit::Training);
        assert_eq!(label.annotations.len(), 2);

        let radios: Vec<_> = label.radio_answers().collect();
        assert_eq!(radios.len(), 1);
        assert_eq!(radios[0].0.name, "Color");
        assert_eq!(radios[0].1.name, "Red");
    }

    #[test]
    fn unknown_split_tags_fail_to_decode() {
        let json = r#"{
            "data_row_id": "row-1",
            "row_data": "https://assets.example.com/row-1.png",
            "data_split": "holdout",
            "annotations": []
        }"#;
        assert!(serde_json::from_str::<ExportedLabel>(json).is_err());
    }

    #[test]
    fn checklist_answers_take_the_checklist_variant() {
        let json = r#"{
            "name": "Defects",
            "feature_schema_id": "c3",
            "checklist_answers": [
                {"name": "Scratch", "feature_schema_id": "c3o1"},
                {"name": "Dent", "feature_schema_id": "c3o2"}
            ]
        }"#;
        let annotation: ClassificationAnnotation = serde_json::from_str(json).unwrap();
        assert!(matches!(
            annotation.value,
            AnnotationValue::Checklist { ref checklist_answers } if checklist_answers.len() == 2
        ));
    }
}
