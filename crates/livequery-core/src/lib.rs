//! # Livequery Core
//!
//! Core types, strategy traits, and the event-transformation core of the
//! livequery CDC relay.
//!
//! A database watcher normalizes raw mutations into [`NormalizedChangeEvent`]s.
//! The [`EventFormatter`] consults the [`ReferencePathIndex`], compiled once
//! from route metadata, and expands each change into reference-scoped
//! [`OutputEvent`]s for the live query broadcaster.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Watcher    │────►│  Formatter   │────►│  EventSink   │
//! │ (per db)     │     │              │     │ (broadcast)  │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!                             │
//!                    ┌────────┴────────┐
//!                    │ReferencePathIndex│
//!                    └─────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod formatter;
pub mod message;
pub mod metrics;
pub mod path;
pub mod route;
pub mod strategy;

pub use crate::config::*;
pub use crate::error::*;
pub use crate::formatter::{format, EventFormatter};
pub use crate::message::*;
pub use crate::metrics::*;
pub use crate::path::*;
pub use crate::route::*;
pub use crate::strategy::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::RelayConfig;
    pub use crate::error::{RelayError, Result};
    pub use crate::formatter::EventFormatter;
    pub use crate::message::{ChangeType, Document, NormalizedChangeEvent, OutputEvent};
    pub use crate::path::{compile_connection_indexes, compile_index, ReferencePathIndex};
    pub use crate::strategy::{EventSink, HealthCheck, Lifecycle};
}
