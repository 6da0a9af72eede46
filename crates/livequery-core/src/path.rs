//! Reference path templates and the per-collection index
//!
//! A route path such as `/users/:author_id/posts` compiles into the segment
//! chain `users`, `author_id`, `posts`. Field segments are resolved against the
//! bound collection's schema once, at startup; a missing field is fatal.

use crate::error::{RelayError, Result};
use crate::route::{EntitySchema, RouteMetadata};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Separator between reference path segments
pub const PATH_SEPARATOR: char = '/';

/// Field segment of a template
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldSegment {
    pub name: String,
    pub is_array: bool,
}

/// One template segment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Literal collection name
    Collection(String),
    /// Document field whose value fills this position
    Field(FieldSegment),
}

/// Compiled path template
///
/// Segments alternate collection, field, collection, ... starting with a
/// collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Compile a route path against the schema of the producing collection
    pub fn compile(path: &str, schema: &EntitySchema) -> Result<Self> {
        let parts: Vec<&str> = path
            .split(PATH_SEPARATOR)
            .filter(|s| !s.is_empty())
            .collect();

        if parts.is_empty() {
            return Err(RelayError::invalid_path(path, "path has no segments"));
        }

        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            if i % 2 == 0 {
                if part.starts_with(':') {
                    return Err(RelayError::invalid_path(
                        path,
                        format!("expected collection at position {}, found '{}'", i, part),
                    ));
                }
                segments.push(Segment::Collection(part.to_string()));
            } else {
                let name = part.trim_start_matches(':');
                let field = schema
                    .field(name)
                    .ok_or_else(|| RelayError::SchemaFieldNotFound {
                        collection: schema
                            .collection
                            .clone()
                            .unwrap_or_else(|| schema.entity.clone()),
                        field: name.to_string(),
                        path: path.to_string(),
                    })?;
                segments.push(Segment::Field(FieldSegment {
                    name: name.to_string(),
                    is_array: field.array,
                }));
            }
        }

        Ok(Self {
            source: parts.join("/"),
            segments,
        })
    }

    /// Normalized path pattern this template was compiled from
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of field segments
    pub fn depth(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Field(_)))
            .count()
    }

    /// Field segments in order
    pub fn fields(&self) -> impl Iterator<Item = &FieldSegment> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(f) => Some(f),
            Segment::Collection(_) => None,
        })
    }
}

impl std::fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// Collection name → templates that can address its documents
#[derive(Debug, Clone, Default)]
pub struct ReferencePathIndex {
    templates: BTreeMap<String, Vec<PathTemplate>>,
}

impl ReferencePathIndex {
    /// Templates registered for a collection
    pub fn templates(&self, collection: &str) -> &[PathTemplate] {
        self.templates
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Watched collection names
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Longest field chain across all templates
    pub fn max_depth(&self) -> usize {
        self.templates
            .values()
            .flatten()
            .map(PathTemplate::depth)
            .max()
            .unwrap_or(0)
    }

    fn insert(&mut self, collection: &str, template: PathTemplate) {
        let entry = self.templates.entry(collection.to_string()).or_default();
        if !entry.contains(&template) {
            entry.push(template);
        }
    }
}

/// Compile the index from route metadata
///
/// Non-watchable routes are skipped. Fails on the first route that
/// references an unknown field or rebinds a collection to another entity.
pub fn compile_index<'a>(routes: impl IntoIterator<Item = &'a RouteMetadata>) -> Result<ReferencePathIndex> {
    let mut index = ReferencePathIndex::default();
    let mut bindings: HashMap<String, String> = HashMap::new();

    for route in routes.into_iter().filter(|r| r.is_watchable()) {
        let schema = &route.options.schema;
        let collection = route
            .collection_name()
            .ok_or_else(|| RelayError::invalid_path(&route.path, "path has no segments"))?
            .to_string();

        match bindings.get(&collection) {
            Some(existing) if existing != &schema.entity => {
                return Err(RelayError::DuplicateEntityBinding {
                    collection,
                    existing: existing.clone(),
                    conflicting: schema.entity.clone(),
                });
            }
            Some(_) => {}
            None => {
                bindings.insert(collection.clone(), schema.entity.clone());
            }
        }

        let template = PathTemplate::compile(&route.path, schema)?;
        debug!(collection = %collection, template = %template, "Compiled path template");
        index.insert(&collection, template);
    }

    info!(
        collections = index.len(),
        max_depth = index.max_depth(),
        "Reference path index compiled"
    );
    Ok(index)
}

/// Compile one index per connection name
///
/// Collection bindings are scoped to their connection, so two connections
/// may bind the same collection name to different entities.
pub fn compile_connection_indexes<'a>(
    routes: impl IntoIterator<Item = &'a RouteMetadata>,
) -> Result<BTreeMap<String, ReferencePathIndex>> {
    let mut by_connection: BTreeMap<&str, Vec<&RouteMetadata>> = BTreeMap::new();
    for route in routes.into_iter().filter(|r| r.is_watchable()) {
        by_connection
            .entry(route.connection_name())
            .or_default()
            .push(route);
    }

    by_connection
        .into_iter()
        .map(|(connection, routes)| {
            debug!(connection, routes = routes.len(), "Compiling connection index");
            Ok((connection.to_string(), compile_index(routes)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{FieldKind, FieldSchema, RouteMethod};

    fn post_schema() -> EntitySchema {
        EntitySchema::new("Post")
            .with_field("id", FieldSchema::scalar(FieldKind::String))
            .with_field("author_id", FieldSchema::scalar(FieldKind::String))
            .with_field("tags", FieldSchema::array(FieldKind::String))
    }

    #[test]
    fn test_compile_template() {
        let template = PathTemplate::compile("/users/:author_id/posts", &post_schema()).unwrap();

        assert_eq!(template.source(), "users/author_id/posts");
        assert_eq!(template.depth(), 1);
        assert_eq!(
            template.segments(),
            &[
                Segment::Collection("users".into()),
                Segment::Field(FieldSegment {
                    name: "author_id".into(),
                    is_array: false
                }),
                Segment::Collection("posts".into()),
            ]
        );
    }

    #[test]
    fn test_array_field_flagged() {
        let template = PathTemplate::compile("/tags/:tags/posts", &post_schema()).unwrap();
        assert!(template.fields().all(|f| f.is_array));
    }

    #[test]
    fn test_missing_field_fails() {
        let routes = vec![RouteMetadata::realtime("/users/:owner_id/posts", post_schema())];
        let err = compile_index(&routes).unwrap_err();

        match err {
            RelayError::SchemaFieldNotFound { field, path, .. } => {
                assert_eq!(field, "owner_id");
                assert_eq!(path, "/users/:owner_id/posts");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_entity_binding_fails() {
        let routes = vec![
            RouteMetadata::realtime("/posts", post_schema()),
            RouteMetadata::realtime("/posts", EntitySchema::new("Article")),
        ];
        assert!(matches!(
            compile_index(&routes),
            Err(RelayError::DuplicateEntityBinding { .. })
        ));
    }

    #[test]
    fn test_field_in_collection_position_fails() {
        assert!(matches!(
            PathTemplate::compile("/:author_id/posts", &post_schema()),
            Err(RelayError::InvalidPath { .. })
        ));
        assert!(matches!(
            PathTemplate::compile("//", &post_schema()),
            Err(RelayError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_index_groups_and_dedupes() {
        let routes = vec![
            RouteMetadata::realtime("/posts", post_schema()),
            RouteMetadata::realtime("/users/:author_id/posts", post_schema()),
            RouteMetadata::realtime("users/:author_id/posts/", post_schema()),
            RouteMetadata::realtime("/comments", EntitySchema::new("Comment"))
                .with_method(RouteMethod::Update),
        ];
        let index = compile_index(&routes).unwrap();

        assert_eq!(index.collections().collect::<Vec<_>>(), vec!["posts"]);
        assert_eq!(index.templates("posts").len(), 2);
        assert!(index.templates("comments").is_empty());
        assert_eq!(index.max_depth(), 1);
    }

    #[test]
    fn test_bindings_scoped_per_connection() {
        let pin = EntitySchema::new("Pin")
            .with_collection("posts")
            .with_field("board_id", FieldSchema::scalar(FieldKind::String));
        let routes = vec![
            RouteMetadata::realtime("/users/:author_id/posts", post_schema()),
            RouteMetadata::realtime("/boards/:board_id/posts", pin).on_connection("analytics"),
        ];

        // One global index rejects the rebinding
        assert!(matches!(
            compile_index(&routes),
            Err(RelayError::DuplicateEntityBinding { .. })
        ));

        let indexes = compile_connection_indexes(&routes).unwrap();
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes["default"].templates("posts")[0].source(), "users/author_id/posts");
        assert_eq!(indexes["analytics"].templates("posts")[0].source(), "boards/board_id/posts");
    }
}
