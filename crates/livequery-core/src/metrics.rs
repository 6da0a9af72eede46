//! Metrics for the livequery relay
//!
//! Provides Prometheus-compatible metrics through the `metrics` facade. No
//! exporter is installed here; the host process decides where they go.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Watcher metrics
    pub const WATCHER_CHANGES_TOTAL: &str = "lq_watcher_changes_total";
    pub const WATCHER_DROPPED_TOTAL: &str = "lq_watcher_dropped_total";
    pub const WATCHER_ERRORS_TOTAL: &str = "lq_watcher_errors_total";

    // Relay metrics
    pub const RELAY_EVENTS_EMITTED: &str = "lq_relay_events_emitted_total";
    pub const RELAY_PUBLISH_FAILED: &str = "lq_relay_publish_failed_total";
    pub const RELAY_FORMAT_LATENCY: &str = "lq_relay_format_latency_seconds";
    pub const RELAY_PUBLISH_LATENCY: &str = "lq_relay_publish_latency_seconds";

    // Connection metrics
    pub const CONNECTION_STATE: &str = "connection_state";
    pub const CONNECTION_RECONNECTS: &str = "connection_reconnects_total";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const DATABASE: &str = "database";
    pub const COLLECTION: &str = "collection";
    pub const TYPE: &str = "type";
    pub const REASON: &str = "reason";
    pub const ERROR_TYPE: &str = "error_type";
    pub const CONNECTION: &str = "connection";
}

/// Per-database watcher metrics
#[derive(Clone)]
pub struct WatcherMetrics {
    database: String,
}

impl WatcherMetrics {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }

    /// Record a normalized change
    pub fn record_change(&self, collection: &str, change_type: &str) {
        counter!(
            names::WATCHER_CHANGES_TOTAL,
            labels::DATABASE => self.database.clone(),
            labels::COLLECTION => collection.to_string(),
            labels::TYPE => change_type.to_string(),
        )
        .increment(1);
    }

    /// Record a raw event dropped during normalization
    pub fn record_dropped(&self, reason: &'static str) {
        counter!(
            names::WATCHER_DROPPED_TOTAL,
            labels::DATABASE => self.database.clone(),
            labels::REASON => reason,
        )
        .increment(1);
    }

    /// Record a transient stream error
    pub fn record_error(&self, error_type: &str) {
        counter!(
            names::WATCHER_ERRORS_TOTAL,
            labels::DATABASE => self.database.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }
}

/// Relay (formatter + sink) metrics
#[derive(Clone)]
pub struct RelayMetrics {
    component: String,
}

impl RelayMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record output events produced for one change
    pub fn record_emitted(&self, collection: &str, count: usize) {
        counter!(
            names::RELAY_EVENTS_EMITTED,
            labels::COMPONENT => self.component.clone(),
            labels::COLLECTION => collection.to_string(),
        )
        .increment(count as u64);
    }

    /// Record a failed publish
    pub fn record_publish_failed(&self) {
        counter!(
            names::RELAY_PUBLISH_FAILED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    /// Record formatter latency
    pub fn record_format_latency(&self, duration: Duration) {
        histogram!(
            names::RELAY_FORMAT_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record publish latency
    pub fn record_publish_latency(&self, duration: Duration) {
        histogram!(
            names::RELAY_PUBLISH_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Connection metrics
#[derive(Clone)]
pub struct ConnectionMetrics {
    connection_name: String,
}

impl ConnectionMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            connection_name: name.into(),
        }
    }

    /// Set connection state (1 = connected, 0 = disconnected)
    pub fn set_connected(&self, connected: bool) {
        gauge!(
            names::CONNECTION_STATE,
            labels::CONNECTION => self.connection_name.clone(),
        )
        .set(if connected { 1.0 } else { 0.0 });
    }

    /// Record reconnection
    pub fn record_reconnect(&self) {
        counter!(
            names::CONNECTION_RECONNECTS,
            labels::CONNECTION => self.connection_name.clone(),
        )
        .increment(1);
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    /// Start a new timer
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_timer() {
        let mut recorded = None;
        {
            let timer = LatencyTimer::start(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(10));
            timer.stop();
        }
        assert!(recorded.unwrap() >= Duration::from_millis(10));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = WatcherMetrics::new("app");
        metrics.record_change("posts", "added");
        metrics.record_dropped("unsupported_operation");

        let relay = RelayMetrics::new("relay");
        relay.record_emitted("posts", 3);
    }
}
