//! # Mongo Watcher
//!
//! Watches MongoDB change streams and relays reference-scoped events to the
//! live query broadcaster.
//!
//! ## Strategies
//!
//! - `MongoConnector`: database-level change streams with pre-images
//! - `NatsSink` / `ChannelSink`: output transports
//!
//! ## Usage
//!
//! ```rust,ignore
//! let relay = Relay::new(config, Arc::new(MongoConnector::new()))?;
//! let sink = Arc::new(NatsSink::new(nats_config));
//!
//! relay.run(sink, cancel).await?;
//! ```

pub mod normalize;
pub mod publisher;
pub mod retry;
pub mod source;

pub use normalize::*;
pub use publisher::*;
pub use retry::*;
pub use source::*;

use futures::{stream, StreamExt};
use livequery_core::prelude::*;
use livequery_core::{LatencyTimer, OutputEventStream, RelayMetrics, DEFAULT_CONNECTION};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// One database watched through one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub connection: String,
    pub url: String,
    pub database: String,
    pub collections: BTreeSet<String>,
}

/// Main relay orchestrator
///
/// Fans out one watcher per database, merges their changes and formats each
/// into output events with the index of the database's connection.
pub struct Relay {
    config: RelayConfig,
    connector: Arc<dyn ChangeStreamConnector>,
    formatters: BTreeMap<String, EventFormatter>,
    targets: Vec<WatchTarget>,
    metrics: RelayMetrics,
    published: AtomicU64,
    failed: AtomicU64,
}

impl Relay {
    /// Validate configuration and compile the reference index
    ///
    /// All configuration errors surface here, before any watcher starts.
    pub fn new(config: RelayConfig, connector: Arc<dyn ChangeStreamConnector>) -> Result<Self> {
        config.validate()?;

        let targets = Self::plan(&config)?;
        let formatters: BTreeMap<String, EventFormatter> = compile_connection_indexes(&config.routes)?
            .into_iter()
            .map(|(connection, index)| (connection, EventFormatter::new(Arc::new(index))))
            .collect();

        info!(
            connections = formatters.len(),
            databases = targets.len(),
            "Relay configured"
        );

        Ok(Self {
            formatters,
            config,
            connector,
            targets,
            metrics: RelayMetrics::new("relay"),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    fn plan(config: &RelayConfig) -> Result<Vec<WatchTarget>> {
        let configured: HashSet<&str> = config.connections.iter().map(|c| c.name.as_str()).collect();

        // Every connection a realtime route names must exist
        if let Some(route) = config
            .routes
            .iter()
            .filter(|r| r.is_watchable())
            .find(|r| !configured.contains(r.connection_name()))
        {
            return Err(RelayError::MissingConnectionUrl {
                connection: route.connection_name().to_string(),
            });
        }

        let mut targets = Vec::new();
        for connection in &config.connections {
            let url = connection.require_url()?;
            for (database, collections) in connection.watch_plan(&config.routes) {
                debug!(
                    connection = %connection.name,
                    host = %connection.display_host(),
                    database = %database,
                    ?collections,
                    "Planned watcher"
                );
                targets.push(WatchTarget {
                    connection: connection.name.clone(),
                    url: url.to_string(),
                    database,
                    collections,
                });
            }
        }
        Ok(targets)
    }

    /// Connection/database/collection plan
    pub fn watch_plan(&self) -> &[WatchTarget] {
        &self.targets
    }

    /// Formatter bound to a connection's routes
    pub fn formatter(&self, connection: &str) -> Option<&EventFormatter> {
        self.formatters.get(connection)
    }

    /// Start all watchers and return the merged output events
    ///
    /// Completes immediately when nothing is watchable; otherwise ends once
    /// `cancel` fires and every watcher has stopped.
    pub fn events(&self, cancel: CancellationToken) -> OutputEventStream {
        if self.targets.is_empty() {
            info!(
                default_connection = DEFAULT_CONNECTION,
                "No realtime routes, nothing to watch"
            );
            return Box::pin(stream::empty());
        }

        let mut merged = Vec::new();
        for (connection, formatter) in &self.formatters {
            // One fan-in channel per connection; its databases share the index
            let (tx, rx) = mpsc::unbounded_channel();
            for target in self.targets.iter().filter(|t| &t.connection == connection) {
                let watcher = ChangeStreamWatcher::new(
                    self.connector.clone(),
                    target.url.clone(),
                    target.database.clone(),
                    target.collections.clone(),
                    &self.config.watcher,
                );
                tokio::spawn(watcher.run(tx.clone(), cancel.child_token()));
            }
            drop(tx);

            let formatter = formatter.clone();
            let metrics = self.metrics.clone();
            let events = UnboundedReceiverStream::new(rx).flat_map(move |change| {
                let timer = LatencyTimer::start(|d| metrics.record_format_latency(d));
                let events = formatter.format(&change);
                timer.stop();

                metrics.record_emitted(&change.table, events.len());
                trace!(
                    table = %change.table,
                    id = %change.id,
                    emitted = events.len(),
                    "Formatted change"
                );
                stream::iter(events)
            });
            merged.push(events.boxed());
        }

        Box::pin(stream::select_all(merged))
    }

    /// Relay events into a sink until cancelled
    ///
    /// Publish failures are logged and counted; they never stop the relay.
    pub async fn run(&self, sink: Arc<dyn EventSink>, cancel: CancellationToken) -> Result<()> {
        info!(
            sink = sink.component_name(),
            databases = self.targets.len(),
            "Starting relay"
        );

        sink.start().await?;
        let mut events = self.events(cancel.clone());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                next = events.next() => {
                    let Some(event) = next else { break };
                    let start = Instant::now();
                    let reference = event.reference.clone();

                    match sink.publish(event).await {
                        Ok(()) => {
                            self.metrics.record_publish_latency(start.elapsed());
                            self.published.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            error!(error = %e, reference = %reference, "Failed to publish event");
                            self.metrics.record_publish_failed();
                            self.failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }

        sink.flush().await?;
        sink.stop().await?;

        info!(
            published = self.published_count(),
            failed = self.failed_count(),
            "Relay stopped"
        );
        Ok(())
    }

    /// Get published count
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Get failed publish count
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
