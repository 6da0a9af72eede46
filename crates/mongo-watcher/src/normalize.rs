//! Normalization of raw change stream events
//!
//! Lowers driver events into a driver-neutral [`RawChangeEvent`], then into
//! the canonical [`NormalizedChangeEvent`] the formatter consumes.

use livequery_core::config::WatcherConfig;
use livequery_core::message::{ChangeType, Document, NormalizedChangeEvent, ID_FIELD};
use mongodb::bson::{self, Bson};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use serde_json::Value;
use std::collections::BTreeSet;

/// Internal identifier field
const MONGO_ID: &str = "_id";

/// Operation of a raw change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOperation {
    Insert,
    Update,
    Replace,
    Delete,
    Invalidate,
    Other(String),
}

impl From<&OperationType> for RawOperation {
    fn from(op: &OperationType) -> Self {
        match op {
            OperationType::Insert => Self::Insert,
            OperationType::Update => Self::Update,
            OperationType::Replace => Self::Replace,
            OperationType::Delete => Self::Delete,
            OperationType::Invalidate => Self::Invalidate,
            other => Self::Other(format!("{:?}", other)),
        }
    }
}

/// Driver-neutral change event
#[derive(Debug, Clone, PartialEq)]
pub struct RawChangeEvent {
    pub operation: RawOperation,
    pub collection: Option<String>,
    pub document_key: Option<bson::Document>,
    /// Dotted paths set by an update
    pub updated_fields: Vec<String>,
    /// Dotted paths unset by an update
    pub removed_fields: Vec<String>,
    pub full_document: Option<bson::Document>,
    pub full_document_before_change: Option<bson::Document>,
}

impl RawChangeEvent {
    pub fn new(operation: RawOperation, collection: impl Into<String>) -> Self {
        Self {
            operation,
            collection: Some(collection.into()),
            document_key: None,
            updated_fields: Vec::new(),
            removed_fields: Vec::new(),
            full_document: None,
            full_document_before_change: None,
        }
    }

    /// Builder: set the document key
    pub fn with_key(mut self, id: impl Into<Bson>) -> Self {
        self.document_key = Some(bson::doc! { MONGO_ID: id.into() });
        self
    }

    /// Builder: set the post-image
    pub fn with_after(mut self, document: bson::Document) -> Self {
        self.full_document = Some(document);
        self
    }

    /// Builder: set the pre-image
    pub fn with_before(mut self, document: bson::Document) -> Self {
        self.full_document_before_change = Some(document);
        self
    }

    /// Builder: set update description paths
    pub fn with_update(
        mut self,
        updated: impl IntoIterator<Item = impl Into<String>>,
        removed: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.updated_fields = updated.into_iter().map(Into::into).collect();
        self.removed_fields = removed.into_iter().map(Into::into).collect();
        self
    }
}

impl From<ChangeStreamEvent<bson::Document>> for RawChangeEvent {
    fn from(event: ChangeStreamEvent<bson::Document>) -> Self {
        let (updated_fields, removed_fields) = match event.update_description {
            Some(description) => (
                description.updated_fields.keys().cloned().collect(),
                description.removed_fields,
            ),
            None => (Vec::new(), Vec::new()),
        };

        Self {
            operation: RawOperation::from(&event.operation_type),
            collection: event.ns.and_then(|ns| ns.coll),
            document_key: event.document_key,
            updated_fields,
            removed_fields,
            full_document: event.full_document,
            full_document_before_change: event.full_document_before_change,
        }
    }
}

/// Why a raw event was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnsupportedOperation,
    MissingCollection,
    MissingId,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedOperation => "unsupported_operation",
            Self::MissingCollection => "missing_collection",
            Self::MissingId => "missing_id",
        }
    }
}

/// Canonicalizes raw events
#[derive(Debug, Clone)]
pub struct Normalizer {
    internal_prefix: String,
    bookkeeping_fields: Vec<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&WatcherConfig::default())
    }
}

impl Normalizer {
    pub fn new(config: &WatcherConfig) -> Self {
        Self {
            internal_prefix: config.internal_prefix.clone(),
            bookkeeping_fields: config.bookkeeping_fields.clone(),
        }
    }

    pub fn normalize(&self, raw: RawChangeEvent) -> Result<NormalizedChangeEvent, DropReason> {
        let change_type = match raw.operation {
            RawOperation::Insert => ChangeType::Added,
            RawOperation::Update => ChangeType::Modified,
            RawOperation::Delete => ChangeType::Removed,
            _ => return Err(DropReason::UnsupportedOperation),
        };

        let table = raw.collection.ok_or(DropReason::MissingCollection)?;

        let id = [
            raw.document_key.as_ref(),
            raw.full_document.as_ref(),
            raw.full_document_before_change.as_ref(),
        ]
        .into_iter()
        .flatten()
        .find_map(|doc| doc.get(MONGO_ID).and_then(canonical_id))
        .ok_or(DropReason::MissingId)?;

        let changed_fields = match change_type {
            ChangeType::Modified => self.changed_fields(&raw.updated_fields, &raw.removed_fields),
            _ => BTreeSet::new(),
        };

        Ok(NormalizedChangeEvent {
            table,
            change_type,
            old_data: raw
                .full_document_before_change
                .map(|doc| self.canonicalize(doc, &id)),
            new_data: raw.full_document.map(|doc| self.canonicalize(doc, &id)),
            id,
            changed_fields,
        })
    }

    /// Strip internal fields and expose the identifier as `id`
    pub fn canonicalize(&self, document: bson::Document, id: &str) -> Document {
        let mut canonical = Document::new();
        canonical.insert(ID_FIELD.to_string(), Value::String(id.to_string()));

        for (key, value) in document {
            if key == MONGO_ID || key == ID_FIELD || !self.is_public(&key) {
                continue;
            }
            canonical.insert(key, bson_to_json(value));
        }
        canonical
    }

    fn changed_fields(&self, updated: &[String], removed: &[String]) -> BTreeSet<String> {
        updated
            .iter()
            .chain(removed)
            .filter_map(|path| path.split('.').next())
            .filter(|key| !key.is_empty() && self.is_public(key))
            .map(str::to_string)
            .collect()
    }

    fn is_public(&self, key: &str) -> bool {
        if self.bookkeeping_fields.iter().any(|f| f == key) {
            return false;
        }
        self.internal_prefix.is_empty() || !key.starts_with(&self.internal_prefix)
    }
}

/// String form of a document identifier
fn canonical_id(id: &Bson) -> Option<String> {
    match id {
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        Bson::String(s) if !s.is_empty() => Some(s.clone()),
        Bson::String(_) | Bson::Null | Bson::Undefined => None,
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        other => Some(other.clone().into_relaxed_extjson().to_string()),
    }
}

/// Convert BSON to JSON, rendering ObjectIds as hex strings
pub fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::Document(doc) => Value::Object(
            doc.into_iter()
                .map(|(key, value)| (key, bson_to_json(value)))
                .collect(),
        ),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        other => other.into_relaxed_extjson(),
    }
}
