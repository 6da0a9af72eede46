//! Error types for the livequery relay
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.
//! Configuration variants are fatal at startup; stream variants are recovered
//! by the owning watcher's reconnect loop and never leave it. A watcher that
//! hits a non-retryable error stops instead of reconnecting.

use std::fmt;
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Primary error type for all relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid configuration value, such as an unparseable connection string
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A connection entry has no URL
    #[error("Missing MongoDB connection URL for connection '{connection}'")]
    MissingConnectionUrl { connection: String },

    /// A route path references a field the bound schema does not declare
    #[error("Field '{field}' referenced by route '{path}' not found in schema of '{collection}'")]
    SchemaFieldNotFound {
        collection: String,
        field: String,
        path: String,
    },

    /// Two routes bind one collection name to different entities
    #[error("Collection '{collection}' bound to entity '{conflicting}' but already bound to '{existing}'")]
    DuplicateEntityBinding {
        collection: String,
        existing: String,
        conflicting: String,
    },

    /// Route path cannot be split into collection/field segments
    #[error("Invalid route path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// Database connection, command or cursor errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The server invalidated the change stream cursor
    #[error("Change stream invalidated on '{database}'")]
    StreamInvalidated { database: String },

    /// The change stream cursor ended without an error
    #[error("Change stream closed on '{database}'")]
    StreamClosed { database: String },

    /// NATS connection or publish errors
    #[error("NATS error: {message}")]
    Nats {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Event serialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timeout
    #[error("Timeout: {operation} exceeded {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Sink or channel closed downstream
    #[error("Sink closed: {0}")]
    SinkClosed(String),
}

impl RelayError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Create a database error with source
    pub fn database_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a NATS error
    pub fn nats(message: impl Into<String>) -> Self {
        Self::Nats {
            message: message.into(),
            source: None,
        }
    }

    /// Create a NATS error with source
    pub fn nats_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Nats {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Check if a watcher should reconnect after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database { .. }
                | Self::StreamInvalidated { .. }
                | Self::StreamClosed { .. }
                | Self::Timeout { .. }
                | Self::Nats { .. }
        )
    }

    /// Check if error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::MissingConnectionUrl { .. }
                | Self::SchemaFieldNotFound { .. }
                | Self::DuplicateEntityBinding { .. }
                | Self::InvalidPath { .. }
        )
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::MissingConnectionUrl { .. } => "missing_connection_url",
            Self::SchemaFieldNotFound { .. } => "schema_field_not_found",
            Self::DuplicateEntityBinding { .. } => "duplicate_entity_binding",
            Self::InvalidPath { .. } => "invalid_path",
            Self::Database { .. } => "database",
            Self::StreamInvalidated { .. } => "stream_invalidated",
            Self::StreamClosed { .. } => "stream_closed",
            Self::Nats { .. } => "nats",
            Self::Serialization { .. } => "serialization",
            Self::Timeout { .. } => "timeout",
            Self::SinkClosed(_) => "sink_closed",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub database: Option<String>,
    pub collection: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            database: None,
            collection: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(ref db) = self.database {
            write!(f, " db={}", db)?;
        }
        if let Some(ref coll) = self.collection {
            write!(f, " coll={}", coll)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::warn!(
                error = %e,
                component = ctx.component,
                operation = %ctx.operation,
                database = ?ctx.database,
                collection = ?ctx.collection,
                "Operation failed"
            );
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let schema = RelayError::SchemaFieldNotFound {
            collection: "posts".into(),
            field: "owner".into(),
            path: "/users/:owner/posts".into(),
        };
        assert!(schema.is_fatal());
        assert!(!schema.is_retryable());

        let stream = RelayError::StreamInvalidated {
            database: "app".into(),
        };
        assert!(stream.is_retryable());
        assert!(!stream.is_fatal());

        let url = RelayError::config("invalid connection string 'mongo://'");
        assert!(url.is_fatal());
        assert!(!url.is_retryable());
        assert_eq!(url.kind(), "configuration");
    }

    #[test]
    fn test_error_context_display() {
        let ctx = ErrorContext::new("watcher", "enable_images")
            .with_database("app")
            .with_collection("posts");
        assert_eq!(ctx.to_string(), "[watcher::enable_images] db=app coll=posts");
    }
}
