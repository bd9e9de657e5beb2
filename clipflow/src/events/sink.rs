//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn, Level};

use super::{RUN_ESCALATED, RUN_FAILED};

/// Receives orchestration events.
///
/// Sinks are injected into the orchestrator; emitting must never fail the
/// run, so both methods swallow their own errors.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - Dotted event name (e.g. `"stage.passed"`)
    /// * `data` - Optional payload
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits without awaiting.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// Writes events to `tracing`.
///
/// Escalations and failed runs always log at WARN.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level` (anything but DEBUG logs at INFO).
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: Option<&serde_json::Value>) {
        let run_id = data
            .and_then(|d| d.get("run_id"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("-");
        if event_type == RUN_ESCALATED || event_type == RUN_FAILED {
            warn!(event_type, run_id, event_data = ?data, "Event: {event_type}");
        } else if self.level == Level::DEBUG {
            debug!(event_type, run_id, event_data = ?data, "Event: {event_type}");
        } else {
            info!(event_type, run_id, event_data = ?data, "Event: {event_type}");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// Records events in memory. Used by tests to assert on the event stream.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Collected event names, in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Event names emitted for one run, in order.
    #[must_use]
    pub fn types_for_run(&self, run_id: &str) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|(_, data)| {
                data.as_ref()
                    .and_then(|d| d.get("run_id"))
                    .and_then(serde_json::Value::as_str)
                    == Some(run_id)
            })
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Events whose name starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<serde_json::Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit("run.created", None).await;
        let sink = LoggingEventSink::debug();
        sink.emit("run.created", Some(serde_json::json!({"run_id": "R1"})))
            .await;
        sink.try_emit("run.failed", None);
    }

    #[tokio::test]
    async fn test_collecting_sink_filters_by_prefix() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());
        sink.emit("stage.attempt", None).await;
        sink.emit("stage.passed", None).await;
        sink.try_emit("jobs.fired", Some(serde_json::json!({"count": 3})));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(
            sink.event_types(),
            vec!["stage.attempt", "stage.passed", "jobs.fired"]
        );
    }

    #[tokio::test]
    async fn test_collecting_sink_separates_runs() {
        let sink = CollectingEventSink::new();
        sink.emit(RUN_FAILED, Some(serde_json::json!({"run_id": "R1"}))).await;
        sink.emit("run.created", Some(serde_json::json!({"run_id": "R2"}))).await;
        sink.emit("stage.passed", Some(serde_json::json!({"run_id": "R1"}))).await;
        sink.emit("jobs.fired", None).await;

        assert_eq!(sink.types_for_run("R1"), vec![RUN_FAILED, "stage.passed"]);
        assert_eq!(sink.types_for_run("R2"), vec!["run.created"]);
        assert!(sink.types_for_run("R3").is_empty());
    }
}
