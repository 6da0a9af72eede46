//! Change stream strategies for the MongoDB watcher
//!
//! - `MongoConnector`: opens database-level change streams with pre-images
//! - `MockConnector`: scripted sessions for testing
//!
//! `ChangeStreamWatcher` owns one database. It connects, enables pre-images,
//! subscribes, and reconnects with backoff after any failure until cancelled.

use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use livequery_core::config::WatcherConfig;
use livequery_core::prelude::*;
use livequery_core::{ChangeEventStream, ConnectionMetrics, ErrorContext, ErrorContextExt, WatcherMetrics};
use mongodb::bson::doc;
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, FullDocumentBeforeChangeType, FullDocumentType};
use mongodb::{Client, Database};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::normalize::{Normalizer, RawChangeEvent, RawOperation};
use crate::retry::Backoff;

/// Boxed stream of raw change events from one session
pub type RawChangeStream = Pin<Box<dyn Stream<Item = Result<RawChangeEvent>> + Send>>;

/// Server error code for a missing collection
const NAMESPACE_NOT_FOUND: i32 = 26;

/// Application name reported to the server
const APP_NAME: &str = "mongo-watcher";

// ============================================================================
// Connector Strategy
// ============================================================================

/// Opens sessions against one database
#[async_trait]
pub trait ChangeStreamConnector: Send + Sync {
    /// Connect and verify the database is reachable
    async fn connect(&self, url: &str, database: &str) -> Result<Box<dyn ChangeStreamSession>>;

    /// Connector name for logging
    fn name(&self) -> &'static str;
}

/// A live connection to one database
#[async_trait]
pub trait ChangeStreamSession: Send {
    /// Enable pre/post images on a collection
    async fn enable_images(&mut self, collection: &str) -> Result<()>;

    /// Subscribe to changes on the given collections
    async fn watch(&mut self, collections: &BTreeSet<String>) -> Result<RawChangeStream>;
}

// ============================================================================
// MongoDB Connector
// ============================================================================

/// Change stream connector backed by the MongoDB driver
#[derive(Debug, Clone, Default)]
pub struct MongoConnector;

impl MongoConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChangeStreamConnector for MongoConnector {
    async fn connect(&self, url: &str, database: &str) -> Result<Box<dyn ChangeStreamSession>> {
        let mut options = ClientOptions::parse(url).await.map_err(|e| {
            if let ErrorKind::InvalidArgument { message, .. } = e.kind.as_ref() {
                return RelayError::config(format!("Invalid connection string: {}", message));
            }
            RelayError::database_with_source("Failed to resolve connection string", e)
        })?;
        options.app_name = Some(APP_NAME.to_string());

        let client = Client::with_options(options)
            .map_err(|e| RelayError::database_with_source("Failed to create client", e))?;
        let db = client.database(database);

        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| RelayError::database_with_source(format!("Failed to reach '{}'", database), e))?;

        Ok(Box::new(MongoSession { _client: client, database: db }))
    }

    fn name(&self) -> &'static str {
        "mongodb"
    }
}

/// Session holding a client and its database handle
struct MongoSession {
    _client: Client,
    database: Database,
}

#[async_trait]
impl ChangeStreamSession for MongoSession {
    async fn enable_images(&mut self, collection: &str) -> Result<()> {
        let command = doc! {
            "collMod": collection,
            "changeStreamPreAndPostImages": { "enabled": true },
        };

        match self.database.run_command(command).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(*e.kind, ErrorKind::Command(ref c) if c.code == NAMESPACE_NOT_FOUND) => {
                warn!(
                    database = self.database.name(),
                    collection,
                    "Collection does not exist yet, pre-images not enabled"
                );
                Ok(())
            }
            Err(e) => Err(RelayError::database_with_source(
                format!("Failed to enable pre-images on '{}'", collection),
                e,
            )),
        }
    }

    async fn watch(&mut self, collections: &BTreeSet<String>) -> Result<RawChangeStream> {
        let names: Vec<String> = collections.iter().cloned().collect();
        let pipeline = vec![doc! { "$match": { "ns.coll": { "$in": names } } }];

        let stream = self
            .database
            .watch()
            .pipeline(pipeline)
            .full_document(FullDocumentType::UpdateLookup)
            .full_document_before_change(FullDocumentBeforeChangeType::WhenAvailable)
            .await
            .map_err(|e| RelayError::database_with_source("Failed to open change stream", e))?;

        Ok(Box::pin(stream.map(|result| {
            result
                .map(RawChangeEvent::from)
                .map_err(|e| RelayError::database_with_source("Change stream read failed", e))
        })))
    }
}

// ============================================================================
// Watcher
// ============================================================================

/// How a session ended without error
enum SessionEnd {
    Cancelled,
    ReceiverDropped,
}

/// Reconnecting change stream watcher for one database
pub struct ChangeStreamWatcher {
    connector: Arc<dyn ChangeStreamConnector>,
    url: String,
    database: String,
    collections: BTreeSet<String>,
    normalizer: Normalizer,
    backoff: Backoff,
    connect_timeout: Option<Duration>,
    metrics: WatcherMetrics,
    connection_metrics: ConnectionMetrics,
}

impl ChangeStreamWatcher {
    pub fn new(
        connector: Arc<dyn ChangeStreamConnector>,
        url: impl Into<String>,
        database: impl Into<String>,
        collections: BTreeSet<String>,
        config: &WatcherConfig,
    ) -> Self {
        let database = database.into();
        Self {
            connector,
            url: url.into(),
            metrics: WatcherMetrics::new(database.clone()),
            connection_metrics: ConnectionMetrics::new(format!("mongodb:{}", database)),
            database,
            collections,
            normalizer: Normalizer::new(config),
            backoff: Backoff::from(&config.reconnect),
            connect_timeout: config.connect_timeout,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collections(&self) -> &BTreeSet<String> {
        &self.collections
    }

    /// Spawn the watcher and return its normalized events
    ///
    /// The stream ends once `cancel` fires and the session is torn down.
    pub fn changes(self, cancel: CancellationToken) -> ChangeEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(tx, cancel));
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    /// Run sessions until cancelled or the receiver goes away
    pub async fn run(self, tx: mpsc::UnboundedSender<NormalizedChangeEvent>, cancel: CancellationToken) {
        info!(
            database = %self.database,
            collections = ?self.collections,
            connector = self.connector.name(),
            "Change stream watcher started"
        );

        let mut attempt: u32 = 0;
        loop {
            match self.session(&tx, &cancel, &mut attempt).await {
                Ok(SessionEnd::Cancelled) | Ok(SessionEnd::ReceiverDropped) => break,
                Err(e) => {
                    self.connection_metrics.set_connected(false);
                    self.metrics.record_error(e.kind());

                    if !e.is_retryable() {
                        error!(database = %self.database, kind = e.kind(), "Watcher stopping, error is not retryable");
                        break;
                    }

                    attempt = attempt.saturating_add(1);
                    let delay = self.backoff.delay(attempt);
                    info!(
                        database = %self.database,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting"
                    );

                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    self.connection_metrics.record_reconnect();
                }
            }
        }

        self.connection_metrics.set_connected(false);
        info!(database = %self.database, "Change stream watcher stopped");
    }

    /// One connect/subscribe/read cycle
    async fn session(
        &self,
        tx: &mpsc::UnboundedSender<NormalizedChangeEvent>,
        cancel: &CancellationToken,
        attempt: &mut u32,
    ) -> Result<SessionEnd> {
        let ctx = |operation: &str| ErrorContext::new("watcher", operation).with_database(&self.database);

        let mut session = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            session = self.bounded("connect", self.connector.connect(&self.url, &self.database)) => {
                session.with_context(ctx("connect"))?
            }
        };

        for collection in &self.collections {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                result = self.bounded("enable_images", session.enable_images(collection)) => {
                    result.with_context(ctx("enable_images").with_collection(collection))?
                }
            }
        }

        let mut changes = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            changes = self.bounded("watch", session.watch(&self.collections)) => {
                changes.with_context(ctx("watch"))?
            }
        };

        *attempt = 0;
        self.connection_metrics.set_connected(true);
        info!(database = %self.database, "Change stream open");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                next = changes.next() => next,
            };

            let raw = match next {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return Err(e).with_context(ctx("read")),
                None => {
                    return Err(RelayError::StreamClosed {
                        database: self.database.clone(),
                    })
                    .with_context(ctx("read"))
                }
            };

            if raw.operation == RawOperation::Invalidate {
                return Err(RelayError::StreamInvalidated {
                    database: self.database.clone(),
                })
                .with_context(ctx("read"));
            }

            match self.normalizer.normalize(raw) {
                Ok(event) => {
                    trace!(
                        database = %self.database,
                        table = %event.table,
                        id = %event.id,
                        change_type = %event.change_type,
                        "Change received"
                    );
                    self.metrics.record_change(&event.table, event.change_type.as_str());
                    if tx.send(event).is_err() {
                        debug!(database = %self.database, "Receiver dropped");
                        return Ok(SessionEnd::ReceiverDropped);
                    }
                }
                Err(reason) => {
                    debug!(database = %self.database, reason = reason.as_str(), "Change dropped");
                    self.metrics.record_dropped(reason.as_str());
                }
            }
        }
    }

    /// Apply the configured timeout to a connection step
    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| RelayError::timeout(operation, limit.as_millis() as u64))?,
            None => fut.await,
        }
    }
}

// ============================================================================
// Mock Connector (for testing)
// ============================================================================

/// One scripted step of a mock session
#[derive(Debug, Clone)]
pub enum MockStep {
    Event(RawChangeEvent),
    Fail(String),
    Invalidate,
    Pause(Duration),
    /// End the stream; without it the stream idles after the last step
    Close,
}

/// Script for one mock session
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    fail_connect: bool,
    reject_connect: bool,
    hang_connect: bool,
    steps: Vec<MockStep>,
}

impl MockScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session whose connect fails
    pub fn failing() -> Self {
        Self {
            fail_connect: true,
            ..Default::default()
        }
    }

    /// Session whose connect is rejected as misconfigured
    pub fn rejected() -> Self {
        Self {
            reject_connect: true,
            ..Default::default()
        }
    }

    /// Session whose connect never completes
    pub fn hanging() -> Self {
        Self {
            hang_connect: true,
            ..Default::default()
        }
    }

    pub fn event(mut self, event: RawChangeEvent) -> Self {
        self.steps.push(MockStep::Event(event));
        self
    }

    pub fn step(mut self, step: MockStep) -> Self {
        self.steps.push(step);
        self
    }
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<MockScript>>,
    connects: HashMap<String, u32>,
    enabled: Vec<(String, String)>,
}

/// Mock connector replaying scripted sessions per database
///
/// Once a database's scripts are exhausted, further sessions idle.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a session script for a database
    pub async fn add_script(&self, database: &str, script: MockScript) {
        self.state
            .lock()
            .await
            .scripts
            .entry(database.to_string())
            .or_default()
            .push_back(script);
    }

    /// Number of connect attempts made against a database
    pub async fn connect_count(&self, database: &str) -> u32 {
        self.state.lock().await.connects.get(database).copied().unwrap_or(0)
    }

    /// (database, collection) pairs that had images enabled
    pub async fn enabled_images(&self) -> Vec<(String, String)> {
        self.state.lock().await.enabled.clone()
    }
}

#[async_trait]
impl ChangeStreamConnector for MockConnector {
    async fn connect(&self, _url: &str, database: &str) -> Result<Box<dyn ChangeStreamSession>> {
        let script = {
            let mut state = self.state.lock().await;
            *state.connects.entry(database.to_string()).or_default() += 1;
            state
                .scripts
                .get_mut(database)
                .and_then(VecDeque::pop_front)
                .unwrap_or_default()
        };

        if script.hang_connect {
            futures::future::pending::<()>().await;
        }
        if script.reject_connect {
            return Err(RelayError::config(format!("Mock connection string for '{}' rejected", database)));
        }
        if script.fail_connect {
            return Err(RelayError::database(format!("Mock connect to '{}' refused", database)));
        }

        Ok(Box::new(MockSession {
            state: self.state.clone(),
            database: database.to_string(),
            steps: script.steps,
        }))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct MockSession {
    state: Arc<Mutex<MockState>>,
    database: String,
    steps: Vec<MockStep>,
}

#[async_trait]
impl ChangeStreamSession for MockSession {
    async fn enable_images(&mut self, collection: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .enabled
            .push((self.database.clone(), collection.to_string()));
        Ok(())
    }

    async fn watch(&mut self, _collections: &BTreeSet<String>) -> Result<RawChangeStream> {
        let steps = std::mem::take(&mut self.steps);
        let closes = steps.iter().any(|s| matches!(s, MockStep::Close));

        let scripted = stream::iter(steps.into_iter().take_while(|s| !matches!(s, MockStep::Close)))
            .filter_map(|step| async move {
                match step {
                    MockStep::Event(event) => Some(Ok(event)),
                    MockStep::Fail(message) => Some(Err(RelayError::database(message))),
                    MockStep::Invalidate => Some(Ok(RawChangeEvent::new(RawOperation::Invalidate, ""))),
                    MockStep::Pause(duration) => {
                        tokio::time::sleep(duration).await;
                        None
                    }
                    MockStep::Close => None,
                }
            });

        if closes {
            Ok(Box::pin(scripted))
        } else {
            Ok(Box::pin(scripted.chain(stream::pending())))
        }
    }
}
