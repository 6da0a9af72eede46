//! Strategy traits for the livequery relay
//!
//! Change production is driver specific and lives with each watcher crate;
//! delivery of output events goes through the [`EventSink`] strategy so the
//! broadcaster transport can be swapped without touching the pipeline.
//!
//! ```text
//! Lifecycle (start/stop)
//!     │
//!     └── EventSink (delivers output events)
//!             └── NatsSink, ChannelSink, MockSink, FanOutSink
//! ```

use crate::error::Result;
use crate::message::{NormalizedChangeEvent, OutputEvent};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed stream of normalized change events
pub type ChangeEventStream = Pin<Box<dyn Stream<Item = NormalizedChangeEvent> + Send>>;

/// Boxed stream of output events
pub type OutputEventStream = Pin<Box<dyn Stream<Item = OutputEvent> + Send>>;

// ============================================================================
// Lifecycle Management
// ============================================================================

/// Lifecycle management for components
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Start the component
    ///
    /// Called once before any operations.
    async fn start(&self) -> Result<()>;

    /// Stop the component gracefully
    ///
    /// May be called even if start() failed.
    async fn stop(&self) -> Result<()>;

    /// Check if the component is running
    fn is_running(&self) -> bool;
}

/// Health check capability
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Returns Ok(()) if healthy, Err with details if not.
    async fn health_check(&self) -> Result<()>;

    /// Get component name for health reporting
    fn component_name(&self) -> &'static str;
}

// ============================================================================
// Sink Strategies
// ============================================================================

/// Event sink strategy - hands output events to the broadcaster
///
/// Implementations must not block the caller for long; backpressure is the
/// sink's own concern.
#[async_trait]
pub trait EventSink: Lifecycle + HealthCheck {
    /// Deliver a single event
    async fn publish(&self, event: OutputEvent) -> Result<()>;

    /// Deliver several events produced by one change
    async fn publish_all(&self, events: Vec<OutputEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    /// Flush any buffered events
    async fn flush(&self) -> Result<()>;
}

/// Fan-out sink that publishes to multiple sinks
#[derive(Default)]
pub struct FanOutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanOutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Lifecycle for FanOutSink {
    async fn start(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.stop().await?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.sinks.iter().all(|s| s.is_running())
    }
}

#[async_trait]
impl HealthCheck for FanOutSink {
    async fn health_check(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.health_check().await?;
        }
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "fan_out_sink"
    }
}

#[async_trait]
impl EventSink for FanOutSink {
    async fn publish(&self, event: OutputEvent) -> Result<()> {
        for sink in &self.sinks {
            sink.publish(event.clone()).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.flush().await?;
        }
        Ok(())
    }
}
