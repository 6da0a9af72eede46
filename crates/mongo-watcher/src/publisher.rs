//! Event sink strategies
//!
//! - `NatsSink`: publishes output events to the broadcaster over core NATS
//! - `ChannelSink`: in-process broadcast for embedding the relay
//! - `MockSink`: records events for testing

use async_trait::async_trait;
use livequery_core::config::NatsConfig;
use livequery_core::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, trace};

// ============================================================================
// NATS Sink
// ============================================================================

/// NATS event sink
///
/// Each event goes to `<prefix>.<reference segments>` so broadcaster nodes can
/// subscribe per reference or with wildcards.
pub struct NatsSink {
    config: NatsConfig,
    client: RwLock<Option<async_nats::Client>>,
    running: AtomicBool,
    published: AtomicU64,
}

impl NatsSink {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            running: AtomicBool::new(false),
            published: AtomicU64::new(0),
        }
    }

    /// Get published count
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Lifecycle for NatsSink {
    async fn start(&self) -> Result<()> {
        info!(url = %self.config.url, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .name(&self.config.connection_name)
            .connect(&self.config.url)
            .await
            .map_err(|e| RelayError::nats_with_source("Failed to connect", e))?;

        *self.client.write().await = Some(client);
        self.running.store(true, Ordering::SeqCst);

        info!(prefix = %self.config.subject_prefix, "NATS sink started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(client) = self.client.write().await.take() {
            client
                .flush()
                .await
                .map_err(|e| RelayError::nats_with_source("Failed to flush", e))?;
        }

        info!(
            published = self.published.load(Ordering::Relaxed),
            "NATS sink stopped"
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for NatsSink {
    async fn health_check(&self) -> Result<()> {
        let client = self.client.read().await;
        match client.as_ref() {
            Some(c) if c.connection_state() == async_nats::connection::State::Connected => Ok(()),
            Some(_) => Err(RelayError::nats("Not connected")),
            None => Err(RelayError::nats("Client not initialized")),
        }
    }

    fn component_name(&self) -> &'static str {
        "nats_sink"
    }
}

#[async_trait]
impl EventSink for NatsSink {
    async fn publish(&self, event: OutputEvent) -> Result<()> {
        let client = self.client.read().await;
        let client = client
            .as_ref()
            .ok_or_else(|| RelayError::nats("Client not initialized"))?;

        let subject = event.to_subject(&self.config.subject_prefix);
        let payload = event.to_bytes()?;

        client
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| RelayError::nats_with_source("Publish failed", e))?;

        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(subject, change_type = %event.change_type, "Published event");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if let Some(client) = self.client.read().await.as_ref() {
            client
                .flush()
                .await
                .map_err(|e| RelayError::nats_with_source("Flush failed", e))?;
        }
        Ok(())
    }
}

// ============================================================================
// Channel Sink
// ============================================================================

/// In-process broadcast sink
///
/// Events published while nobody is subscribed are discarded.
pub struct ChannelSink {
    sender: broadcast::Sender<OutputEvent>,
    running: AtomicBool,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            running: AtomicBool::new(false),
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl Lifecycle for ChannelSink {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for ChannelSink {
    async fn health_check(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RelayError::SinkClosed("channel sink not running".into()))
        }
    }

    fn component_name(&self) -> &'static str {
        "channel_sink"
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, event: OutputEvent) -> Result<()> {
        if !self.is_running() {
            return Err(RelayError::SinkClosed("channel sink not running".into()));
        }
        if self.sender.send(event).is_err() {
            trace!("No subscribers, event discarded");
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Mock Sink (for testing)
// ============================================================================

/// Mock event sink for testing
pub struct MockSink {
    events: RwLock<Vec<OutputEvent>>,
    fail_publish: AtomicBool,
    running: AtomicBool,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Get all published events
    pub async fn events(&self) -> Vec<OutputEvent> {
        self.events.read().await.clone()
    }

    /// Make subsequent publishes fail
    pub fn set_failing(&self, failing: bool) {
        self.fail_publish.store(failing, Ordering::SeqCst);
    }

    /// Clear events
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Lifecycle for MockSink {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for MockSink {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "mock_sink"
    }
}

#[async_trait]
impl EventSink for MockSink {
    async fn publish(&self, event: OutputEvent) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(RelayError::nats("Mock publish failure"));
        }
        self.events.write().await.push(event);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
