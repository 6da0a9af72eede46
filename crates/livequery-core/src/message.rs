//! Message types for the livequery relay
//!
//! Defines the normalized change event produced by watchers and the
//! topic-addressed output event handed to the broadcaster.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// A document snapshot as a field map
pub type Document = Map<String, Value>;

/// Field holding the canonical document identifier
pub const ID_FIELD: &str = "id";

/// Kind of mutation, as seen by live query subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Document entered the addressed path
    Added,
    /// Document changed in place
    Modified,
    /// Document left the addressed path
    Removed,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Removed => "removed",
        }
    }

    /// Added and removed changes propagate unconditionally down a path
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::Modified)
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change event normalized from a raw driver event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedChangeEvent {
    /// Source collection name
    pub table: String,

    /// Mutation kind
    #[serde(rename = "type")]
    pub change_type: ChangeType,

    /// Canonical string document id
    pub id: String,

    /// Pre-image, if the database retained one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_data: Option<Document>,

    /// Post-image (absent for removals)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_data: Option<Document>,

    /// Top-level fields touched by a modification
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub changed_fields: BTreeSet<String>,
}

impl NormalizedChangeEvent {
    /// Create an insertion event
    pub fn added(table: impl Into<String>, id: impl Into<String>, new_data: Document) -> Self {
        Self {
            table: table.into(),
            change_type: ChangeType::Added,
            id: id.into(),
            old_data: None,
            new_data: Some(new_data),
            changed_fields: BTreeSet::new(),
        }
    }

    /// Create a modification event
    pub fn modified(
        table: impl Into<String>,
        id: impl Into<String>,
        old_data: Option<Document>,
        new_data: Document,
        changed_fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            table: table.into(),
            change_type: ChangeType::Modified,
            id: id.into(),
            old_data,
            new_data: Some(new_data),
            changed_fields: changed_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a removal event
    pub fn removed(table: impl Into<String>, id: impl Into<String>, old_data: Option<Document>) -> Self {
        Self {
            table: table.into(),
            change_type: ChangeType::Removed,
            id: id.into(),
            old_data,
            new_data: None,
            changed_fields: BTreeSet::new(),
        }
    }

    /// Field value from the pre-image
    pub fn old_value(&self, field: &str) -> Option<&Value> {
        self.old_data.as_ref().and_then(|d| d.get(field))
    }

    /// Field value from the post-image
    pub fn new_value(&self, field: &str) -> Option<&Value> {
        self.new_data.as_ref().and_then(|d| d.get(field))
    }

    /// Both snapshots merged, post-image winning per field, id always set
    pub fn merged(&self) -> Document {
        let mut merged = self.old_data.clone().unwrap_or_default();
        if let Some(new_data) = &self.new_data {
            for (key, value) in new_data {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        merged
    }
}

/// Topic-scoped event delivered to the broadcaster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    /// Slash-joined concrete reference path, e.g. `users/42/posts`
    #[serde(rename = "ref")]
    pub reference: String,

    #[serde(rename = "type")]
    pub change_type: ChangeType,

    pub data: Document,
}

impl OutputEvent {
    pub fn new(reference: impl Into<String>, change_type: ChangeType, data: Document) -> Self {
        Self {
            reference: reference.into(),
            change_type,
            data,
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Generate a NATS subject for this event
    ///
    /// Format: `{prefix}.{ref segments joined by '.'}`
    pub fn to_subject(&self, prefix: &str) -> String {
        let tail = self
            .reference
            .split('/')
            .map(|s| s.replace(['.', '*', '>', ' '], "_"))
            .collect::<Vec<_>>()
            .join(".");
        format!("{}.{}", prefix, tail)
    }

    /// Document id carried by the payload
    pub fn document_id(&self) -> Option<&str> {
        self.data.get(ID_FIELD).and_then(Value::as_str)
    }
}
