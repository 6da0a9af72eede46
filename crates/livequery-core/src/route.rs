//! Route metadata consumed from the API layer
//!
//! Each route describes a live-query endpoint: its path pattern, its method
//! and the schema of the collection it is bound to. Only realtime query
//! routes are watchable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Connection name used when a route does not name one
pub const DEFAULT_CONNECTION: &str = "default";

/// Route method, carried as its numeric code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RouteMethod {
    /// Query / subscribe (code 0)
    #[default]
    Query,
    Create,
    Update,
    Delete,
}

impl TryFrom<u8> for RouteMethod {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Query),
            1 => Ok(Self::Create),
            2 => Ok(Self::Update),
            3 => Ok(Self::Delete),
            other => Err(format!("unknown route method code {}", other)),
        }
    }
}

impl From<RouteMethod> for u8 {
    fn from(method: RouteMethod) -> Self {
        match method {
            RouteMethod::Query => 0,
            RouteMethod::Create => 1,
            RouteMethod::Update => 2,
            RouteMethod::Delete => 3,
        }
    }
}

/// Declared field type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    ObjectId,
    Date,
    Object,
    #[default]
    Any,
}

/// Schema entry for one field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(default, rename = "type")]
    pub kind: FieldKind,

    /// Field holds an array of `kind`
    #[serde(default)]
    pub array: bool,
}

impl FieldSchema {
    pub fn scalar(kind: FieldKind) -> Self {
        Self { kind, array: false }
    }

    pub fn array(kind: FieldKind) -> Self {
        Self { kind, array: true }
    }
}

/// Field/type metadata of the collection a route is bound to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Underlying entity identity
    pub entity: String,

    /// Collection name; defaults to the last literal segment of the route path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    #[serde(default)]
    pub fields: BTreeMap<String, FieldSchema>,
}

impl EntitySchema {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Default::default()
        }
    }

    /// Builder: set explicit collection name
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Builder: declare a field
    pub fn with_field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }
}

/// Route options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOptions {
    /// Propagate database changes to subscribers of this route
    #[serde(default)]
    pub realtime: bool,

    pub schema: EntitySchema,
}

/// One route as exposed by the API layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMetadata {
    /// Slash-delimited pattern, e.g. `/users/:author_id/posts`
    pub path: String,

    #[serde(default)]
    pub method: RouteMethod,

    /// Connection this route's collection lives on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,

    pub options: RouteOptions,
}

impl RouteMetadata {
    /// Create a realtime query route
    pub fn realtime(path: impl Into<String>, schema: EntitySchema) -> Self {
        Self {
            path: path.into(),
            method: RouteMethod::Query,
            connection: None,
            options: RouteOptions {
                realtime: true,
                schema,
            },
        }
    }

    /// Builder: bind to a named connection
    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    /// Builder: set method
    pub fn with_method(mut self, method: RouteMethod) -> Self {
        self.method = method;
        self
    }

    /// Realtime-flagged query route
    pub fn is_watchable(&self) -> bool {
        self.options.realtime && self.method == RouteMethod::Query
    }

    pub fn connection_name(&self) -> &str {
        self.connection.as_deref().unwrap_or(DEFAULT_CONNECTION)
    }

    /// Collection whose documents this route addresses
    pub fn collection_name(&self) -> Option<&str> {
        if let Some(collection) = self.options.schema.collection.as_deref() {
            return Some(collection);
        }
        self.path
            .split('/')
            .filter(|s| !s.is_empty())
            .enumerate()
            .filter(|(i, _)| i % 2 == 0)
            .map(|(_, s)| s)
            .last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_deserialization() {
        let route: RouteMetadata = serde_json::from_value(json!({
            "path": "/users/:author_id/posts",
            "method": 0,
            "options": {
                "realtime": true,
                "schema": {
                    "entity": "Post",
                    "fields": {
                        "author_id": {"type": "string"},
                        "tags": {"type": "string", "array": true}
                    }
                }
            }
        }))
        .unwrap();

        assert!(route.is_watchable());
        assert_eq!(route.connection_name(), DEFAULT_CONNECTION);
        assert_eq!(route.collection_name(), Some("posts"));
        assert!(route.options.schema.field("tags").unwrap().array);
    }

    #[test]
    fn test_unknown_method_rejected() {
        let result: Result<RouteMethod, _> = serde_json::from_value(json!(9));
        assert!(result.is_err());
    }

    #[test]
    fn test_non_query_routes_not_watchable() {
        let route = RouteMetadata::realtime("/posts", EntitySchema::new("Post"))
            .with_method(RouteMethod::Create);
        assert!(!route.is_watchable());
    }

    #[test]
    fn test_explicit_collection_wins() {
        let route = RouteMetadata::realtime(
            "/users/:id/feed",
            EntitySchema::new("Post").with_collection("posts"),
        );
        assert_eq!(route.collection_name(), Some("posts"));
    }
}
