//! Core stage types: kinds, statuses, outputs, and the [`Stage`] contract.
//!
//! Every unit of work in a pipeline is a [`Stage`]: it has a name, a
//! [`StageKind`], and an async `execute` that receives a [`StageContext`]
//! and returns a [`StageOutput`]. Outputs are immutable tagged values; the
//! scheduler interprets their status, so stages signal skip/cancel/fail by
//! returning the matching output rather than by raising.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::ContextSnapshot;
use crate::error::Result;
use crate::events::EventSink;
use crate::inputs::StageInputs;

/// Categorization of stage types.
///
/// Informational only: the kind never alters scheduling, but it is carried
/// on events and logs so observability can group stages by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Change input form (STT, TTS, LLM).
    Transform,
    /// Add context (profile, memory, documents).
    Enrich,
    /// Select a path (router, dispatcher).
    Route,
    /// Validate (guardrails, policy).
    Guard,
    /// Side effects (assessment, persistence).
    Work,
    /// Main interactor.
    Agent,
}

impl StageKind {
    /// Stable lowercase name, as carried on events.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Transform => "transform",
            StageKind::Enrich => "enrich",
            StageKind::Route => "route",
            StageKind::Guard => "guard",
            StageKind::Work => "work",
            StageKind::Agent => "agent",
        }
    }
}

/// Outcome of a stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Completed successfully.
    Ok,
    /// Skipped (conditional).
    Skip,
    /// Pipeline cancelled gracefully (no error, just stop).
    Cancel,
    /// Failed (error).
    Fail,
    /// Failed but retryable.
    Retry,
}

impl StageStatus {
    /// Stable lowercase name, as carried on events.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Ok => "ok",
            StageStatus::Skip => "skip",
            StageStatus::Cancel => "cancel",
            StageStatus::Fail => "fail",
            StageStatus::Retry => "retry",
        }
    }
}

/// An artifact produced by a stage during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageArtifact {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// An event emitted by a stage during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Unified return type for all stage executions.
///
/// Immutable once constructed. `SKIP` data always carries `reason`;
/// `CANCEL` data always carries `cancel_reason`; `error` is set iff the
/// status is `Fail` or `Retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub status: StageStatus,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub artifacts: Vec<StageArtifact>,
    #[serde(default)]
    pub events: Vec<StageEvent>,
    pub error: Option<String>,
}

impl StageOutput {
    /// Create a successful output carrying the given data.
    pub fn ok(data: Map<String, Value>) -> Self {
        Self {
            status: StageStatus::Ok,
            data,
            artifacts: Vec::new(),
            events: Vec::new(),
            error: None,
        }
    }

    /// Create a successful output with no data.
    pub fn ok_empty() -> Self {
        Self::ok(Map::new())
    }

    /// Create a skipped output. `data["reason"]` records why.
    pub fn skip(reason: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("reason".into(), Value::String(reason.into()));
        Self {
            status: StageStatus::Skip,
            data,
            artifacts: Vec::new(),
            events: Vec::new(),
            error: None,
        }
    }

    /// Create a cancelled output to stop the pipeline without error.
    /// `data["cancel_reason"]` records why.
    pub fn cancel(reason: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("cancel_reason".into(), Value::String(reason.into()));
        Self {
            status: StageStatus::Cancel,
            data,
            artifacts: Vec::new(),
            events: Vec::new(),
            error: None,
        }
    }

    /// Create a failed output.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            data: Map::new(),
            artifacts: Vec::new(),
            events: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Create a retryable-failure output.
    pub fn retry(error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Retry,
            data: Map::new(),
            artifacts: Vec::new(),
            events: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Insert a data entry (builder style).
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Append an artifact (builder style).
    pub fn with_artifact(mut self, artifact_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        self.artifacts.push(StageArtifact {
            artifact_type: artifact_type.into(),
            payload,
            timestamp: Utc::now(),
        });
        self
    }

    /// Append an event (builder style).
    pub fn with_event(mut self, event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        self.events.push(StageEvent {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        });
        self
    }

    /// The skip reason this output signals to conditional dependents, if any.
    ///
    /// A dependency signals skip when its status is `Skip` (reason from
    /// `data["reason"]`) or when its data carries a truthy `skip_reason`.
    pub fn skip_signal(&self) -> Option<String> {
        if self.status == StageStatus::Skip {
            let reason = self
                .data
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("skipped");
            return Some(reason.to_string());
        }
        match self.data.get("skip_reason") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Shared wall-clock reference for a run.
///
/// All stages in a run share one timer so latency attribution is
/// consistent across stages.
#[derive(Debug, Clone, Copy)]
pub struct PipelineTimer {
    started: Instant,
    started_at: DateTime<Utc>,
}

impl PipelineTimer {
    /// Start a timer now.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Milliseconds elapsed since the run started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// When the run started (UTC wall clock).
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl Default for PipelineTimer {
    fn default() -> Self {
        Self::start()
    }
}

/// Per-invocation execution context handed to a stage.
///
/// Bundles the run's immutable snapshot, the stage's declared-dependency
/// inputs, the shared run timer, and the event sink. Stages must not retain
/// references to the context after `execute` returns.
pub struct StageContext {
    snapshot: Arc<ContextSnapshot>,
    inputs: StageInputs,
    timer: PipelineTimer,
    sink: Arc<dyn EventSink>,
}

impl StageContext {
    pub fn new(
        snapshot: Arc<ContextSnapshot>,
        inputs: StageInputs,
        timer: PipelineTimer,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            snapshot,
            inputs,
            timer,
            sink,
        }
    }

    /// The run's immutable snapshot.
    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    /// Outputs of declared dependencies plus injected capabilities.
    pub fn inputs(&self) -> &StageInputs {
        &self.inputs
    }

    /// Shared run timer.
    pub fn timer(&self) -> &PipelineTimer {
        &self.timer
    }

    /// The event sink bound to this run.
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Emit an event through the run's sink, fire-and-forget, with the
    /// run's identifiers merged into the payload.
    pub fn emit(&self, event_type: &str, data: Map<String, Value>) {
        self.sink.try_emit(event_type, Some(self.identify(data)));
    }

    /// Merge the snapshot's identifiers into an event payload.
    pub(crate) fn identify(&self, mut data: Map<String, Value>) -> Map<String, Value> {
        let ids = [
            ("pipeline_run_id", self.snapshot.pipeline_run_id),
            ("request_id", self.snapshot.request_id),
            ("session_id", self.snapshot.session_id),
            ("user_id", self.snapshot.user_id),
            ("org_id", self.snapshot.org_id),
        ];
        for (key, id) in ids {
            if let Some(id) = id {
                data.entry(key).or_insert(Value::String(id.to_string()));
            }
        }
        data
    }
}

/// Contract for all stage implementations.
///
/// The engine calls `execute` exactly once per invocation. FAIL and CANCEL
/// are returned as [`StageOutput`] statuses, not errors; an `Err` from
/// `execute` is treated like a FAIL by the scheduler.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Unique name within a pipeline.
    fn name(&self) -> &str;

    /// Kind categorization.
    fn kind(&self) -> StageKind;

    /// Execute the stage logic.
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput>;
}
