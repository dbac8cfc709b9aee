//! # labelrail
//!
//! A pipeline bridging an annotation platform's model runs to cloud AutoML
//! training and batch inference: export labels, transform them into the
//! training service's NDJSON format, launch and monitor training, run batch
//! prediction, and reconcile the raw output back into schema-addressed
//! annotations with agreement metrics attached.
//!
//! ## Architecture
//!
//! - **Ontology flattening** (`ontology`): hierarchical label trees to flat
//!   name-path indexes, invertible, divider-explicit
//! - **ETL** (`etl`, `media`, `pool`): parallel label/row conversion with
//!   per-item failure isolation, image downsampling, upload manifest
//! - **Reconciliation** (`predict`): argmax over batch output, name-path
//!   lookup back to schema ids, data-row identity recovery
//! - **Metrics** (`metrics`): ground-truth pairing, confusion and mean-IoU
//!   entries per prediction
//! - **Stages** (`stage`): the run lifecycle drivers wired against the
//!   `labeling`, `platform`, and `storage` client seams
//!
//! ## Library usage
//!
//! ```
//! use labelrail::ontology::{Divider, NormalizedOntology, SchemaId, SchemaIndex};
//!
//! let ontology: NormalizedOntology = serde_json::from_str(r#"{
//!     "tools": [],
//!     "classifications": [{
//!         "instructions": "Color",
//!         "featureSchemaId": "c1",
//!         "options": [{"label": "Red", "featureSchemaId": "c1o1"}]
//!     }]
//! }"#).unwrap();
//!
//! let divider = Divider::new("_");
//! let forward = SchemaIndex::build(&ontology, &divider);
//! let entry = forward.require(&SchemaId::new("c1o1")).unwrap();
//! assert_eq!(entry.name_path, "Color_Red");
//! ```

pub mod config;
pub mod error;
pub mod etl;
pub mod label;
pub mod labeling;
pub mod media;
pub mod metrics;
pub mod ndjson;
pub mod ontology;
pub mod platform;
pub mod pool;
pub mod predict;
pub mod retry;
pub mod stage;
pub mod storage;
