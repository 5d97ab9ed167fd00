//! Pipeline run lifecycle: state machine, status events, and the
//! process-scoped cancel registry.
//!
//! [`PipelineOrchestrator`] overlays lifecycle states on a graph run
//! (`created -> running -> (streaming ->)? completed | failed | cancelled |
//! cancelled_gracefully`), translates the scheduler's terminal outcome into
//! the matching state, and persists the record through the event sink.
//! Graceful stage-initiated cancel is a *successful* terminal state; only
//! `failed` carries an error.
//!
//! External callers cancel by identifier: [`request_cancel`] fires the
//! registered signal for a run and [`is_cancel_requested`] is the query
//! surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cancellation::CancelSignal;
use crate::context::ContextSnapshot;
use crate::events::{get_event_sink, EventSink};
use crate::graph::{RunContext, RunOutcome, StageGraph};
use crate::inputs::{SendStatus, SendToken, StagePorts};
use crate::stage::{PipelineTimer, StageOutput};

fn cancel_registry() -> &'static Mutex<HashMap<Uuid, CancelSignal>> {
    static REGISTRY: OnceLock<Mutex<HashMap<Uuid, CancelSignal>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fire the cancel signal for a registered run. Returns true iff the id
/// was registered.
pub fn request_cancel(pipeline_run_id: Uuid) -> bool {
    let registry = cancel_registry().lock();
    match registry.get(&pipeline_run_id) {
        Some(signal) => {
            signal.cancel();
            true
        }
        None => false,
    }
}

/// Whether cancellation has been requested for a registered run.
pub fn is_cancel_requested(pipeline_run_id: Uuid) -> bool {
    cancel_registry()
        .lock()
        .get(&pipeline_run_id)
        .map(CancelSignal::is_cancelled)
        .unwrap_or(false)
}

fn register_cancel(pipeline_run_id: Uuid) -> CancelSignal {
    let signal = CancelSignal::new();
    cancel_registry().lock().insert(pipeline_run_id, signal.clone());
    signal
}

fn deregister_cancel(pipeline_run_id: Uuid) {
    cancel_registry().lock().remove(&pipeline_run_id);
}

/// Lifecycle state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running,
    Streaming,
    Completed,
    Failed,
    Cancelled,
    CancelledGracefully,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Streaming => "streaming",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
            RunState::CancelledGracefully => "cancelled_gracefully",
        }
    }

    /// Terminal states that are not errors.
    pub fn is_success(&self) -> bool {
        matches!(self, RunState::Completed | RunState::CancelledGracefully)
    }
}

/// Final record of an orchestrated run.
#[derive(Debug)]
pub struct RunReport {
    pub pipeline_run_id: Uuid,
    pub state: RunState,
    pub success: bool,
    pub outputs: HashMap<String, StageOutput>,
    pub error: Option<String>,
    pub cancelled_by_stage: Option<String>,
    pub cancel_reason: Option<String>,
    pub duration_ms: u64,
}

/// Runs a compiled graph under the lifecycle state machine.
#[derive(Default)]
pub struct PipelineOrchestrator {
    sink: Option<Arc<dyn EventSink>>,
}

impl PipelineOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route lifecycle events to a specific sink instead of the
    /// process-scoped current sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone().unwrap_or_else(get_event_sink)
    }

    /// Execute a graph run end to end.
    ///
    /// A missing `pipeline_run_id` on the snapshot is minted here so the
    /// run is always addressable by [`request_cancel`]. The returned report
    /// is the authoritative summary; the event stream carries the same
    /// record incrementally.
    pub async fn run(
        &self,
        graph: &StageGraph,
        snapshot: ContextSnapshot,
        ports: Arc<StagePorts>,
        trigger: &str,
    ) -> RunReport {
        let snapshot = match snapshot.pipeline_run_id {
            Some(_) => snapshot,
            None => ContextSnapshot {
                pipeline_run_id: Some(Uuid::new_v4()),
                ..snapshot
            },
        };
        let run_id = snapshot.pipeline_run_id.expect("run id minted above");
        let topology = snapshot.topology.clone().unwrap_or_default();
        let sink = self.sink();
        let timer = PipelineTimer::start();

        let cancel = register_cancel(run_id);

        let mut created = Map::new();
        created.insert("trigger".into(), Value::String(trigger.into()));
        created.insert("topology".into(), Value::String(topology.clone()));
        sink.try_emit("pipeline.created", Some(created));
        sink.try_emit("pipeline.started", None);
        tracing::info!(pipeline_run_id = %run_id, trigger, "pipeline run started");

        let wrapped_ports = Arc::new(wrap_streaming_ports(&ports, &sink));

        let outcome = graph
            .run(
                RunContext::new(snapshot)
                    .with_ports(wrapped_ports)
                    .with_sink(Arc::clone(&sink))
                    .with_cancel(cancel)
                    .with_timer(timer),
            )
            .await;
        let duration_ms = timer.elapsed_ms();

        let report = match outcome {
            Ok(RunOutcome::Completed(outputs)) => {
                // A stage may publish an explicit `success` verdict; absent
                // that, completion is success.
                let success = !outputs
                    .values()
                    .any(|o| o.data.get("success") == Some(&Value::Bool(false)));
                let mut data = Map::new();
                data.insert("stages_completed".into(), Value::from(outputs.len()));
                data.insert("success".into(), Value::Bool(success));
                data.insert("duration_ms".into(), Value::from(duration_ms));
                sink.try_emit("pipeline.completed", Some(data));
                RunReport {
                    pipeline_run_id: run_id,
                    state: RunState::Completed,
                    success,
                    outputs,
                    error: None,
                    cancelled_by_stage: None,
                    cancel_reason: None,
                    duration_ms,
                }
            }
            Ok(RunOutcome::Cancelled { stage, reason, partial }) => {
                let mut data = Map::new();
                data.insert("reason".into(), Value::String(reason.clone()));
                data.insert("cancelled_by_stage".into(), Value::String(stage.clone()));
                data.insert("stages_completed".into(), Value::from(partial.len()));
                sink.try_emit("pipeline.cancelled_gracefully", Some(data));
                tracing::info!(
                    pipeline_run_id = %run_id,
                    cancelled_by_stage = %stage,
                    %reason,
                    "pipeline cancelled gracefully"
                );
                RunReport {
                    pipeline_run_id: run_id,
                    state: RunState::CancelledGracefully,
                    success: true,
                    outputs: partial,
                    error: None,
                    cancelled_by_stage: Some(stage),
                    cancel_reason: Some(reason),
                    duration_ms,
                }
            }
            Ok(RunOutcome::Interrupted(outputs)) => {
                sink.try_emit("pipeline.canceled", None);
                tracing::info!(pipeline_run_id = %run_id, "pipeline canceled");
                RunReport {
                    pipeline_run_id: run_id,
                    state: RunState::Cancelled,
                    success: false,
                    outputs,
                    error: Some("canceled".into()),
                    cancelled_by_stage: None,
                    cancel_reason: None,
                    duration_ms,
                }
            }
            Err(err) => {
                let message = err.to_string();
                let mut data = Map::new();
                data.insert("error".into(), Value::String(message.clone()));
                sink.try_emit("pipeline.failed", Some(data));
                tracing::error!(pipeline_run_id = %run_id, error = %message, "pipeline failed");
                RunReport {
                    pipeline_run_id: run_id,
                    state: RunState::Failed,
                    success: false,
                    outputs: HashMap::new(),
                    error: Some(message),
                    cancelled_by_stage: None,
                    cancel_reason: None,
                    duration_ms,
                }
            }
        };

        deregister_cancel(run_id);
        report
    }
}

/// Wrap a port bundle so the first streamed token -- or any `streaming`
/// status -- moves the run to the streaming state, emitted exactly once as
/// `pipeline.streaming`.
fn wrap_streaming_ports(ports: &Arc<StagePorts>, sink: &Arc<dyn EventSink>) -> StagePorts {
    let streaming_started = Arc::new(AtomicBool::new(false));
    let mut wrapped = StagePorts::clone(ports);

    let mark_streaming = {
        let sink = Arc::clone(sink);
        move |flag: &AtomicBool| {
            if !flag.swap(true, Ordering::SeqCst) {
                sink.try_emit("pipeline.streaming", None);
            }
        }
    };

    let inner_token = ports.send_token.clone();
    let token_flag = Arc::clone(&streaming_started);
    let token_mark = mark_streaming.clone();
    let send_token: SendToken = Arc::new(move |token: String| {
        let inner = inner_token.clone();
        let flag = Arc::clone(&token_flag);
        let mark = token_mark.clone();
        Box::pin(async move {
            mark(&flag);
            if let Some(inner) = inner {
                inner(token).await;
            }
        })
    });
    wrapped.send_token = Some(send_token);

    let inner_status = ports.send_status.clone();
    let status_flag = streaming_started;
    let send_status: SendStatus =
        Arc::new(move |stage: String, state: String, data: Option<Map<String, Value>>| {
            let inner = inner_status.clone();
            let flag = Arc::clone(&status_flag);
            let mark = mark_streaming.clone();
            Box::pin(async move {
                if state == "streaming" {
                    mark(&flag);
                }
                if let Some(inner) = inner {
                    inner(stage, state, data).await;
                }
            })
        });
    wrapped.send_status = Some(send_status);

    wrapped
}
