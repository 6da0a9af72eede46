//! Event formatter
//!
//! Turns one normalized change event into the set of reference-scoped output
//! events, one per (template × resolved path). Every field segment of a
//! template is expanded into its candidate values; the pre- and post-images
//! decide whether the document entered, left or changed within each path.
//!
//! Payloads are minimized by final type: `added` carries the full merged
//! record, `removed` only the id, `modified` only the changed fields.

use crate::message::{ChangeType, Document, NormalizedChangeEvent, OutputEvent, ID_FIELD};
use crate::path::{FieldSegment, ReferencePathIndex, Segment, PATH_SEPARATOR};
use serde_json::Value;
use std::sync::Arc;

/// Placeholder for a field value that cannot be resolved
const UNRESOLVED: &str = "";

/// Formatter bound to a shared, immutable index
#[derive(Debug, Clone)]
pub struct EventFormatter {
    index: Arc<ReferencePathIndex>,
}

impl EventFormatter {
    pub fn new(index: Arc<ReferencePathIndex>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &ReferencePathIndex {
        &self.index
    }

    pub fn format(&self, event: &NormalizedChangeEvent) -> Vec<OutputEvent> {
        format(&self.index, event)
    }
}

/// Expand a change event into reference-scoped output events
///
/// Pure and deterministic; duplicates produced by distinct templates are kept.
pub fn format(index: &ReferencePathIndex, event: &NormalizedChangeEvent) -> Vec<OutputEvent> {
    let templates = index.templates(&event.table);
    if templates.is_empty() {
        return Vec::new();
    }

    let merged = event.merged();
    let changes = restrict_to_changes(event, &merged);

    let mut output = Vec::new();
    for template in templates {
        output.extend(
            expand(template.segments(), event)
                .into_iter()
                .filter_map(|candidate| candidate.into_reference(event))
                .map(|(reference, change_type)| {
                    let data = match change_type {
                        ChangeType::Added => merged.clone(),
                        ChangeType::Removed => id_only(event),
                        ChangeType::Modified => changes.clone(),
                    };
                    OutputEvent::new(reference, change_type, data)
                }),
        );
    }
    output
}

/// Snapshot(s) a resolved value or path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    /// Only the pre-image
    Old,
    /// Only the post-image
    New,
    /// Both images, or the value is unchanged
    Both,
}

impl Side {
    /// Combine a segment value with a nested path; `None` mixes snapshots
    fn join(self, inner: Side) -> Option<Side> {
        match (self, inner) {
            (Side::Both, other) | (other, Side::Both) => Some(other),
            (a, b) if a == b => Some(a),
            _ => None,
        }
    }

    fn change_type(self) -> ChangeType {
        match self {
            Side::Old => ChangeType::Removed,
            Side::New => ChangeType::Added,
            Side::Both => ChangeType::Modified,
        }
    }
}

/// One concrete path produced by expanding a template
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    refs: Vec<String>,
    side: Side,
}

impl Candidate {
    /// Joined reference and its change type, or `None` if any segment is unresolved
    fn into_reference(self, event: &NormalizedChangeEvent) -> Option<(String, ChangeType)> {
        if self.refs.iter().any(|s| s.is_empty()) {
            return None;
        }
        let separator = PATH_SEPARATOR.to_string();
        let reference = self.refs.join(separator.as_str());
        if reference.contains(&format!("{0}{0}", PATH_SEPARATOR)) {
            return None;
        }

        let change_type = if event.change_type.is_structural() {
            event.change_type
        } else {
            self.side.change_type()
        };
        Some((reference, change_type))
    }
}

fn expand(segments: &[Segment], event: &NormalizedChangeEvent) -> Vec<Candidate> {
    match segments {
        [] => vec![Candidate {
            refs: Vec::new(),
            side: Side::Both,
        }],
        [Segment::Collection(collection), Segment::Field(field), rest @ ..] => {
            let nested = expand(rest, event);
            let mut candidates = Vec::new();

            for (value, side) in candidate_values(field, event) {
                for inner in &nested {
                    let Some(side) = side.join(inner.side) else {
                        continue;
                    };

                    let mut refs = Vec::with_capacity(inner.refs.len() + 2);
                    refs.push(collection.clone());
                    refs.push(value.clone());
                    refs.extend(inner.refs.iter().cloned());

                    candidates.push(Candidate { refs, side });
                }
            }
            candidates
        }
        [Segment::Collection(collection), ..] => vec![Candidate {
            refs: vec![collection.clone()],
            side: Side::Both,
        }],
        // Compiled templates always start with a collection
        [Segment::Field(_), ..] => Vec::new(),
    }
}

/// Values a field segment may take for this event, tagged by snapshot
///
/// Fields outside `changed_fields` resolve to one merged value on both sides.
fn candidate_values(field: &FieldSegment, event: &NormalizedChangeEvent) -> Vec<(String, Side)> {
    let old = event.old_value(&field.name);
    let new = event.new_value(&field.name);

    if field.is_array {
        let old_elements: Vec<String> = elements(old).collect();
        let new_elements: Vec<String> = elements(new).collect();
        let mut values: Vec<(String, Side)> = Vec::new();

        for value in old_elements.iter().chain(&new_elements) {
            if values.iter().any(|(v, _)| v == value) {
                continue;
            }
            let side = match (old_elements.contains(value), new_elements.contains(value)) {
                (true, false) => Side::Old,
                (false, true) => Side::New,
                _ => Side::Both,
            };
            values.push((value.clone(), side));
        }
        return values;
    }

    if event.changed_fields.contains(&field.name) {
        return match (old.and_then(stringify), new.and_then(stringify)) {
            (Some(before), Some(after)) if before == after => vec![(after, Side::Both)],
            (Some(before), Some(after)) => vec![(before, Side::Old), (after, Side::New)],
            (Some(before), None) => vec![(before, Side::Old)],
            (None, Some(after)) => vec![(after, Side::New)],
            (None, None) => vec![(UNRESOLVED.to_string(), Side::Both)],
        };
    }

    let merged = match event.new_data.as_ref().and_then(|d| d.get(&field.name)) {
        Some(value) => Some(value),
        None => old,
    };
    vec![(
        merged
            .and_then(stringify)
            .unwrap_or_else(|| UNRESOLVED.to_string()),
        Side::Both,
    )]
}

/// Stringified, non-null elements of an array field value
fn elements(value: Option<&Value>) -> Box<dyn Iterator<Item = String> + '_> {
    match value {
        Some(Value::Array(items)) => Box::new(items.iter().filter_map(stringify)),
        Some(Value::Null) | None => Box::new(std::iter::empty()),
        Some(other) => Box::new(stringify(other).into_iter()),
    }
}

/// Path segment form of a field value
fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => match map.get("$oid") {
            Some(Value::String(oid)) => Some(oid.clone()),
            _ => Some(value.to_string()),
        },
        Value::Array(_) => Some(value.to_string()),
    }
}

fn restrict_to_changes(event: &NormalizedChangeEvent, merged: &Document) -> Document {
    let mut changes: Document = merged
        .iter()
        .filter(|(key, _)| event.changed_fields.contains(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    changes.insert(ID_FIELD.to_string(), Value::String(event.id.clone()));
    changes
}

fn id_only(event: &NormalizedChangeEvent) -> Document {
    let mut data = Document::new();
    data.insert(ID_FIELD.to_string(), Value::String(event.id.clone()));
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::compile_index;
    use crate::route::{EntitySchema, FieldKind, FieldSchema, RouteMetadata};
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn post_index() -> ReferencePathIndex {
        let schema = EntitySchema::new("Post")
            .with_field("author_id", FieldSchema::scalar(FieldKind::String))
            .with_field("tags", FieldSchema::array(FieldKind::String))
            .with_field("title", FieldSchema::scalar(FieldKind::String));
        let routes = vec![RouteMetadata::realtime("/users/:author_id/posts", schema)];
        compile_index(&routes).unwrap()
    }

    fn tag_index() -> ReferencePathIndex {
        let schema = EntitySchema::new("Post").with_field("tags", FieldSchema::array(FieldKind::String));
        let routes = vec![RouteMetadata::realtime("/tags/:tags/posts", schema)];
        compile_index(&routes).unwrap()
    }

    fn find<'a>(events: &'a [OutputEvent], reference: &str) -> Vec<&'a OutputEvent> {
        events.iter().filter(|e| e.reference == reference).collect()
    }

    #[test]
    fn test_unknown_table_yields_nothing() {
        let event = NormalizedChangeEvent::added("comments", "1", doc(json!({"id": "1"})));
        assert!(format(&post_index(), &event).is_empty());
    }

    #[test]
    fn test_added_event_carries_full_record() {
        let event = NormalizedChangeEvent::added(
            "posts",
            "1",
            doc(json!({"id": "1", "author_id": "42", "title": "A"})),
        );
        let events = format(&post_index(), &event);

        assert_eq!(
            events,
            vec![OutputEvent::new(
                "users/42/posts",
                ChangeType::Added,
                doc(json!({"id": "1", "author_id": "42", "title": "A"}))
            )]
        );
    }

    #[test]
    fn test_format_is_deterministic() {
        let index = post_index();
        let event = NormalizedChangeEvent::modified(
            "posts",
            "1",
            Some(doc(json!({"id": "1", "author_id": "42", "title": "A"}))),
            doc(json!({"id": "1", "author_id": "43", "title": "B"})),
            ["author_id", "title"],
        );
        assert_eq!(format(&index, &event), format(&index, &event));
    }

    #[test]
    fn test_modified_without_changed_fields_sends_id_only() {
        let event = NormalizedChangeEvent::modified(
            "posts",
            "1",
            Some(doc(json!({"id": "1", "author_id": "42", "title": "A"}))),
            doc(json!({"id": "1", "author_id": "42", "title": "A"})),
            Vec::<String>::new(),
        );
        let events = format(&post_index(), &event);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeType::Modified);
        assert_eq!(events[0].data, doc(json!({"id": "1"})));
    }

    #[test]
    fn test_modified_carries_only_changes() {
        let event = NormalizedChangeEvent::modified(
            "posts",
            "1",
            Some(doc(json!({"id": "1", "author_id": "42", "title": "A"}))),
            doc(json!({"id": "1", "author_id": "42", "title": "B"})),
            ["title"],
        );
        let events = format(&post_index(), &event);

        assert_eq!(
            events,
            vec![OutputEvent::new(
                "users/42/posts",
                ChangeType::Modified,
                doc(json!({"id": "1", "title": "B"}))
            )]
        );
    }

    #[test]
    fn test_reassignment_moves_document_between_paths() {
        let event = NormalizedChangeEvent::modified(
            "posts",
            "1",
            Some(doc(json!({"id": "1", "author_id": "42", "title": "A"}))),
            doc(json!({"id": "1", "author_id": "43", "title": "A"})),
            ["author_id"],
        );
        let events = format(&post_index(), &event);

        assert_eq!(
            find(&events, "users/42/posts"),
            vec![&OutputEvent::new(
                "users/42/posts",
                ChangeType::Removed,
                doc(json!({"id": "1"}))
            )]
        );
        assert_eq!(
            find(&events, "users/43/posts"),
            vec![&OutputEvent::new(
                "users/43/posts",
                ChangeType::Added,
                doc(json!({"id": "1", "author_id": "43", "title": "A"}))
            )]
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_removed_event_one_per_template() {
        let event = NormalizedChangeEvent::removed(
            "posts",
            "1",
            Some(doc(json!({"id": "1", "author_id": "42", "title": "A"}))),
        );
        let events = format(&post_index(), &event);

        assert_eq!(
            events,
            vec![OutputEvent::new(
                "users/42/posts",
                ChangeType::Removed,
                doc(json!({"id": "1"}))
            )]
        );
    }

    #[test]
    fn test_null_to_value_only_added() {
        let event = NormalizedChangeEvent::modified(
            "posts",
            "1",
            Some(doc(json!({"id": "1", "author_id": null}))),
            doc(json!({"id": "1", "author_id": "42"})),
            ["author_id"],
        );
        let events = format(&post_index(), &event);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reference, "users/42/posts");
        assert_eq!(events[0].change_type, ChangeType::Added);
    }

    #[test]
    fn test_value_to_null_only_removed_on_old_path() {
        let event = NormalizedChangeEvent::modified(
            "posts",
            "1",
            Some(doc(json!({"id": "1", "author_id": "42"}))),
            doc(json!({"id": "1", "author_id": null})),
            ["author_id"],
        );
        let events = format(&post_index(), &event);

        assert_eq!(
            events,
            vec![OutputEvent::new(
                "users/42/posts",
                ChangeType::Removed,
                doc(json!({"id": "1"}))
            )]
        );
    }

    #[test]
    fn test_null_to_null_yields_nothing() {
        let event = NormalizedChangeEvent::modified(
            "posts",
            "1",
            Some(doc(json!({"id": "1"}))),
            doc(json!({"id": "1", "author_id": null})),
            ["author_id"],
        );
        assert!(format(&post_index(), &event).is_empty());
    }

    #[test]
    fn test_untouched_relation_never_classified() {
        // No pre-image: the relation field was not touched, so no "added"
        let event = NormalizedChangeEvent::modified(
            "posts",
            "1",
            None,
            doc(json!({"id": "1", "author_id": "42", "title": "B"})),
            ["title"],
        );
        let events = format(&post_index(), &event);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeType::Modified);
        assert_eq!(events[0].data, doc(json!({"id": "1", "title": "B"})));
    }

    #[test]
    fn test_array_membership_diff() {
        let event = NormalizedChangeEvent::modified(
            "posts",
            "1",
            Some(doc(json!({"id": "1", "tags": ["rust", "db"]}))),
            doc(json!({"id": "1", "tags": ["db", "cdc"]})),
            ["tags"],
        );
        let events = format(&tag_index(), &event);

        let types: Vec<(&str, ChangeType)> = events
            .iter()
            .map(|e| (e.reference.as_str(), e.change_type))
            .collect();
        assert_eq!(
            types,
            vec![
                ("tags/rust/posts", ChangeType::Removed),
                ("tags/db/posts", ChangeType::Modified),
                ("tags/cdc/posts", ChangeType::Added),
            ]
        );
        assert_eq!(find(&events, "tags/db/posts")[0].data, doc(json!({"id": "1", "tags": ["db", "cdc"]})));
    }

    #[test]
    fn test_array_added_fans_out_to_every_element() {
        let event = NormalizedChangeEvent::added("posts", "1", doc(json!({"id": "1", "tags": ["a", "b", "a"]})));
        let events = format(&tag_index(), &event);

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.change_type == ChangeType::Added));
    }

    #[test]
    fn test_nested_structural_change_propagates() {
        let schema = EntitySchema::new("Member")
            .with_field("org_id", FieldSchema::scalar(FieldKind::String))
            .with_field("team_id", FieldSchema::scalar(FieldKind::String));
        let routes = vec![RouteMetadata::realtime("/orgs/:org_id/teams/:team_id/members", schema)];
        let index = compile_index(&routes).unwrap();

        let event = NormalizedChangeEvent::modified(
            "members",
            "m1",
            Some(doc(json!({"id": "m1", "org_id": "o1", "team_id": "t1"}))),
            doc(json!({"id": "m1", "org_id": "o1", "team_id": "t2"})),
            ["team_id"],
        );
        let events = format(&index, &event);

        let types: Vec<(&str, ChangeType)> = events
            .iter()
            .map(|e| (e.reference.as_str(), e.change_type))
            .collect();
        assert_eq!(
            types,
            vec![
                ("orgs/o1/teams/t1/members", ChangeType::Removed),
                ("orgs/o1/teams/t2/members", ChangeType::Added),
            ]
        );
    }

    #[test]
    fn test_two_relations_changed_never_mix_snapshots() {
        let schema = EntitySchema::new("Member")
            .with_field("org_id", FieldSchema::scalar(FieldKind::String))
            .with_field("team_id", FieldSchema::scalar(FieldKind::String));
        let routes = vec![RouteMetadata::realtime("/orgs/:org_id/teams/:team_id/members", schema)];
        let index = compile_index(&routes).unwrap();

        let event = NormalizedChangeEvent::modified(
            "members",
            "m1",
            Some(doc(json!({"id": "m1", "name": "x", "org_id": "o1", "team_id": "t1"}))),
            doc(json!({"id": "m1", "name": "x", "org_id": "o2", "team_id": "t2"})),
            ["org_id", "team_id"],
        );
        let events = format(&index, &event);

        assert_eq!(
            events,
            vec![
                OutputEvent::new(
                    "orgs/o1/teams/t1/members",
                    ChangeType::Removed,
                    doc(json!({"id": "m1"}))
                ),
                OutputEvent::new(
                    "orgs/o2/teams/t2/members",
                    ChangeType::Added,
                    doc(json!({"id": "m1", "name": "x", "org_id": "o2", "team_id": "t2"}))
                ),
            ]
        );
        assert!(find(&events, "orgs/o1/teams/t2/members").is_empty());
        assert!(find(&events, "orgs/o2/teams/t1/members").is_empty());
    }

    #[test]
    fn test_outer_relation_change_keeps_unchanged_inner_value() {
        let schema = EntitySchema::new("Member")
            .with_field("org_id", FieldSchema::scalar(FieldKind::String))
            .with_field("team_id", FieldSchema::scalar(FieldKind::String));
        let routes = vec![RouteMetadata::realtime("/orgs/:org_id/teams/:team_id/members", schema)];
        let index = compile_index(&routes).unwrap();

        let event = NormalizedChangeEvent::modified(
            "members",
            "m1",
            Some(doc(json!({"id": "m1", "org_id": "o1", "team_id": "t1"}))),
            doc(json!({"id": "m1", "org_id": "o2", "team_id": "t1"})),
            ["org_id"],
        );
        let refs: Vec<(String, ChangeType)> = format(&index, &event)
            .into_iter()
            .map(|e| (e.reference, e.change_type))
            .collect();

        assert_eq!(
            refs,
            vec![
                ("orgs/o1/teams/t1/members".to_string(), ChangeType::Removed),
                ("orgs/o2/teams/t1/members".to_string(), ChangeType::Added),
            ]
        );
    }

    #[test]
    fn test_unresolved_intermediate_segment_discarded() {
        let event = NormalizedChangeEvent::added("posts", "1", doc(json!({"id": "1", "title": "A"})));
        assert!(format(&post_index(), &event).is_empty());
    }

    #[test]
    fn test_duplicates_across_templates_kept() {
        let schema = EntitySchema::new("Post").with_field("author_id", FieldSchema::scalar(FieldKind::String));
        let routes = vec![
            RouteMetadata::realtime("/posts", schema.clone()),
            RouteMetadata::realtime("/users/:author_id/posts", schema),
        ];
        let index = compile_index(&routes).unwrap();
        let event = NormalizedChangeEvent::removed("posts", "1", Some(doc(json!({"id": "1", "author_id": "42"}))));
        let events = format(&index, &event);

        let refs: Vec<&str> = events.iter().map(|e| e.reference.as_str()).collect();
        assert_eq!(refs, vec!["posts", "users/42/posts"]);
        assert!(events.iter().all(|e| e.data == doc(json!({"id": "1"}))));
    }

    #[test]
    fn test_numeric_and_object_id_values_stringified() {
        let event = NormalizedChangeEvent::added(
            "posts",
            "1",
            doc(json!({"id": "1", "author_id": {"$oid": "65a1f0c2e4b0a1b2c3d4e5f6"}})),
        );
        let events = format(&post_index(), &event);
        assert_eq!(events[0].reference, "users/65a1f0c2e4b0a1b2c3d4e5f6/posts");

        let numeric = NormalizedChangeEvent::added("posts", "2", doc(json!({"id": "2", "author_id": 7})));
        assert_eq!(format(&post_index(), &numeric)[0].reference, "users/7/posts");
    }
}
