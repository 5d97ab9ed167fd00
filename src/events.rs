//! Event sink abstraction and the process-scoped current sink.
//!
//! Every core component reports through an [`EventSink`]: an async `emit`
//! for callers that can await persistence, and a fire-and-forget `try_emit`
//! that never blocks or panics. The engine ships a no-op sink (default), a
//! `tracing`-backed sink, and a collecting sink for tests; persistent sinks
//! live outside the core and plug in through this trait.
//!
//! Components that hold a [`StageContext`](crate::StageContext) emit through
//! its sink handle. A process-scoped slot serves deep call sites that have
//! no context (the circuit breaker, the provider-call logger); it defaults
//! to the no-op sink and has an explicit set/clear lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::error::Result;

/// Capability for event persistence/emission.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit an event, awaiting delivery. Implementations may propagate
    /// their own errors.
    async fn emit(&self, event_type: &str, data: Option<Map<String, Value>>) -> Result<()>;

    /// Emit an event without blocking. Must never panic; implementations
    /// may buffer, drop, or schedule.
    fn try_emit(&self, event_type: &str, data: Option<Map<String, Value>>);
}

/// Event sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Map<String, Value>>) -> Result<()> {
        Ok(())
    }

    fn try_emit(&self, _event_type: &str, _data: Option<Map<String, Value>>) {}
}

/// Event sink that logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl TracingEventSink {
    fn log(event_type: &str, data: &Option<Map<String, Value>>) {
        match data {
            Some(data) => {
                let data = Value::Object(data.clone());
                tracing::info!(
                    target: "stageflow::events",
                    event = event_type,
                    data = %data,
                    "event"
                )
            }
            None => tracing::info!(target: "stageflow::events", event = event_type, "event"),
        }
    }
}

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Map<String, Value>>) -> Result<()> {
        Self::log(event_type, &data);
        Ok(())
    }

    fn try_emit(&self, event_type: &str, data: Option<Map<String, Value>>) {
        Self::log(event_type, &data);
    }
}

/// Event sink that buffers events in memory for assertions.
///
/// # Example
///
/// ```
/// use stageflow::events::{CollectingEventSink, EventSink};
///
/// let sink = CollectingEventSink::new();
/// sink.try_emit("stage.echo.started", None);
/// assert_eq!(sink.types(), vec!["stage.echo.started".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, in emission order.
    pub fn events(&self) -> Vec<(String, Map<String, Value>)> {
        self.events.lock().clone()
    }

    /// Event types recorded so far, in emission order.
    pub fn types(&self) -> Vec<String> {
        self.events.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Number of events with exactly this type.
    pub fn count_of(&self, event_type: &str) -> usize {
        self.events.lock().iter().filter(|(t, _)| t == event_type).count()
    }

    /// Payloads of events with exactly this type, in emission order.
    pub fn payloads_of(&self, event_type: &str) -> Vec<Map<String, Value>> {
        self.events
            .lock()
            .iter()
            .filter(|(t, _)| t == event_type)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Map<String, Value>>) -> Result<()> {
        self.try_emit(event_type, data);
        Ok(())
    }

    fn try_emit(&self, event_type: &str, data: Option<Map<String, Value>>) {
        self.events
            .lock()
            .push((event_type.to_string(), data.unwrap_or_default()));
    }
}

static CURRENT_SINK: RwLock<Option<Arc<dyn EventSink>>> = RwLock::new(None);

/// Install the process-scoped current sink.
pub fn set_event_sink(sink: Arc<dyn EventSink>) {
    *CURRENT_SINK.write() = Some(sink);
}

/// Remove the process-scoped current sink, reverting to no-op.
pub fn clear_event_sink() {
    *CURRENT_SINK.write() = None;
}

/// The process-scoped current sink, or the no-op sink if none is set.
pub fn get_event_sink() -> Arc<dyn EventSink> {
    CURRENT_SINK
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(NoOpEventSink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_sink_discards() {
        let sink = NoOpEventSink;
        sink.emit("anything", None).await.unwrap();
        sink.try_emit("anything", None);
    }

    #[tokio::test]
    async fn test_collecting_sink_records_in_order() {
        let sink = CollectingEventSink::new();
        sink.try_emit("first", None);
        sink.emit("second", Some({
            let mut m = Map::new();
            m.insert("k".into(), json!(1));
            m
        }))
        .await
        .unwrap();

        assert_eq!(sink.types(), vec!["first".to_string(), "second".to_string()]);
        assert_eq!(sink.count_of("second"), 1);
        assert_eq!(sink.payloads_of("second")[0]["k"], 1);
    }

    #[test]
    fn test_current_sink_lifecycle() {
        let sink = Arc::new(CollectingEventSink::new());
        set_event_sink(sink.clone());
        get_event_sink().try_emit("during", None);
        assert_eq!(sink.count_of("during"), 1);

        clear_event_sink();
        // Default sink is a no-op; this must not reach the collector.
        get_event_sink().try_emit("after", None);
        assert_eq!(sink.count_of("after"), 0);
        sink.clear();
    }
}
