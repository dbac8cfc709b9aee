//! Ontology flattening: hierarchical annotation trees to flat name-path indexes.
//!
//! The labeling service describes a project's label space as a tree of tools,
//! classifications, and options, each addressed by an opaque feature schema id.
//! The ML platform wants flat class names. This module walks the tree once and
//! produces both directions of the translation: [`SchemaIndex`] (schema id to
//! divider-joined name path) and its mirror [`NamePathIndex`] (name path back
//! to schema id), each entry retaining its parent linkage.
//!
//! Both index types record the [`Divider`] they were built with; code that
//! composes or splits name paths asserts that divider at the boundary instead
//! of assuming one.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OntologyError, OntologyResult};

/// Opaque feature schema identifier assigned by the labeling service.
///
/// Unique across a single ontology tree; never parsed, only compared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaId(String);

impl SchemaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Separator joining display names into name paths.
///
/// Deliberately has no `Default`: every flatten, compose, and lookup names
/// its divider explicitly, normally via `PipelineConfig::divider()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Divider(String);

impl Divider {
    pub fn new(sep: impl Into<String>) -> Self {
        Self(sep.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append `name` to `parent_path`, or start a fresh path at a root.
    pub fn join(&self, parent_path: &str, name: &str) -> String {
        if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{parent_path}{}{name}", self.0)
        }
    }
}

impl fmt::Display for Divider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// The normalized tree
// ---------------------------------------------------------------------------

/// A project ontology as the labeling service exports it: top-level tools
/// and top-level (global) classifications. Either half may be empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOntology {
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub classifications: Vec<Classification>,
}

/// A drawing tool (bounding box, polygon, ...). Its display name lives in
/// `name`; its children are nested classifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(rename = "featureSchemaId")]
    pub feature_schema_id: SchemaId,
    #[serde(default)]
    pub classifications: Vec<Classification>,
}

/// A question attached to a tool or to the whole project. Its display name
/// lives in `instructions`; its children are the answer options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub instructions: String,
    #[serde(rename = "featureSchemaId")]
    pub feature_schema_id: SchemaId,
    #[serde(default)]
    pub options: Vec<OptionNode>,
}

/// An answer option. Its display name lives in `label`; options may nest
/// further options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionNode {
    pub label: String,
    #[serde(rename = "featureSchemaId")]
    pub feature_schema_id: SchemaId,
    #[serde(default)]
    pub options: Vec<OptionNode>,
}

/// Borrowed view over the three node kinds, so one traversal serves all.
enum NodeRef<'a> {
    Tool(&'a Tool),
    Classification(&'a Classification),
    Option(&'a OptionNode),
}

impl<'a> NodeRef<'a> {
    fn display_name(&self) -> &'a str {
        match self {
            NodeRef::Tool(t) => &t.name,
            NodeRef::Classification(c) => &c.instructions,
            NodeRef::Option(o) => &o.label,
        }
    }

    fn schema_id(&self) -> &'a SchemaId {
        match self {
            NodeRef::Tool(t) => &t.feature_schema_id,
            NodeRef::Classification(c) => &c.feature_schema_id,
            NodeRef::Option(o) => &o.feature_schema_id,
        }
    }

    fn children(&self) -> Vec<NodeRef<'a>> {
        match self {
            NodeRef::Tool(t) => t.classifications.iter().map(NodeRef::Classification).collect(),
            NodeRef::Classification(c) => c.options.iter().map(NodeRef::Option).collect(),
            NodeRef::Option(o) => o.options.iter().map(NodeRef::Option).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Forward index
// ---------------------------------------------------------------------------

/// One node's flattened record: its full name path plus parent linkage.
/// Roots carry an empty `parent_name_path` and no `parent_schema_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub name_path: String,
    pub parent_name_path: String,
    pub parent_schema_id: Option<SchemaId>,
}

/// Forward index: feature schema id to name path.
///
/// Built once per ontology by [`SchemaIndex::build`]; deterministic iteration
/// order (sorted by schema id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaIndex {
    divider: Divider,
    entries: BTreeMap<SchemaId, SchemaEntry>,
}

impl SchemaIndex {
    /// Flatten an ontology tree. Depth-first, parents before children; the
    /// tool half and the classification half are independent root sets
    /// sharing one accumulating map, and an empty half contributes nothing.
    pub fn build(ontology: &NormalizedOntology, divider: &Divider) -> Self {
        let mut entries = BTreeMap::new();
        for tool in &ontology.tools {
            flatten_node(NodeRef::Tool(tool), "", None, divider, &mut entries);
        }
        for classification in &ontology.classifications {
            flatten_node(
                NodeRef::Classification(classification),
                "",
                None,
                divider,
                &mut entries,
            );
        }
        Self {
            divider: divider.clone(),
            entries,
        }
    }

    pub fn divider(&self) -> &Divider {
        &self.divider
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &SchemaId) -> Option<&SchemaEntry> {
        self.entries.get(id)
    }

    /// Like [`get`](Self::get), but a miss is the unrecoverable
    /// [`OntologyError::SchemaNotFound`].
    pub fn require(&self, id: &SchemaId) -> OntologyResult<&SchemaEntry> {
        self.entries
            .get(id)
            .ok_or_else(|| OntologyError::SchemaNotFound {
                schema_id: id.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SchemaId, &SchemaEntry)> {
        self.entries.iter()
    }

    /// The exact mirror of this index, keyed by name path.
    pub fn invert(&self) -> NamePathIndex {
        let entries = self
            .entries
            .iter()
            .map(|(id, entry)| {
                (
                    entry.name_path.clone(),
                    NamePathEntry {
                        feature_schema_id: id.clone(),
                        parent_name_path: entry.parent_name_path.clone(),
                        parent_schema_id: entry.parent_schema_id.clone(),
                    },
                )
            })
            .collect();
        NamePathIndex {
            divider: self.divider.clone(),
            entries,
        }
    }

    /// Guard for consumers handed an index built elsewhere.
    pub fn assert_divider(&self, expected: &Divider) -> OntologyResult<()> {
        assert_divider(&self.divider, expected)
    }
}

fn flatten_node(
    node: NodeRef<'_>,
    parent_path: &str,
    parent_id: Option<&SchemaId>,
    divider: &Divider,
    entries: &mut BTreeMap<SchemaId, SchemaEntry>,
) {
    let name_path = divider.join(parent_path, node.display_name());
    entries.insert(
        node.schema_id().clone(),
        SchemaEntry {
            name_path: name_path.clone(),
            parent_name_path: parent_path.to_string(),
            parent_schema_id: parent_id.cloned(),
        },
    );
    for child in node.children() {
        flatten_node(child, &name_path, Some(node.schema_id()), divider, entries);
    }
}

// ---------------------------------------------------------------------------
// Inverted index
// ---------------------------------------------------------------------------

/// One name path's record in the inverted index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamePathEntry {
    pub feature_schema_id: SchemaId,
    pub parent_name_path: String,
    pub parent_schema_id: Option<SchemaId>,
}

/// Inverted index: name path back to feature schema id. Obtained from
/// [`SchemaIndex::invert`]; same divider, same entry count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamePathIndex {
    divider: Divider,
    entries: BTreeMap<String, NamePathEntry>,
}

impl NamePathIndex {
    pub fn divider(&self) -> &Divider {
        &self.divider
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name_path: &str) -> Option<&NamePathEntry> {
        self.entries.get(name_path)
    }

    /// Like [`get`](Self::get), but a miss is the unrecoverable
    /// [`OntologyError::NamePathNotFound`].
    pub fn require(&self, name_path: &str) -> OntologyResult<&NamePathEntry> {
        self.entries
            .get(name_path)
            .ok_or_else(|| OntologyError::NamePathNotFound {
                name_path: name_path.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NamePathEntry)> {
        self.entries.iter()
    }

    pub fn assert_divider(&self, expected: &Divider) -> OntologyResult<()> {
        assert_divider(&self.divider, expected)
    }
}

fn assert_divider(built: &Divider, expected: &Divider) -> OntologyResult<()> {
    if built != expected {
        return Err(OntologyError::DividerMismatch {
            built: built.as_str().to_string(),
            expected: expected.as_str().to_string(),
        });
    }
    Ok(())
}
