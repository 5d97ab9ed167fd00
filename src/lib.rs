//! # Stageflow
//!
//! Dependency-driven DAG orchestration for heterogeneous async work.
//!
//! Producers describe a pipeline as a set of named **stages** with typed
//! kinds, declared dependencies, and optional conditional gates; the engine
//! schedules them with maximal legal parallelism, propagates immutable
//! outputs along declared edges only, enforces cancellation and failure
//! semantics, and emits a structured event stream for observability.
//! Typical applications are multi-step AI/media pipelines (speech-in ->
//! enrich -> route -> LLM -> guard -> speech-out), but the engine is
//! domain-agnostic: stages are black boxes satisfying the [`Stage`]
//! contract.
//!
//! ## Core Concepts
//!
//! - **[`Stage`]** -- object-safe trait for units of work. Receives a
//!   [`StageContext`], returns a [`StageOutput`] whose status (`ok`,
//!   `skip`, `cancel`, `fail`, `retry`) the scheduler interprets.
//! - **[`Pipeline`]** -- persistent fluent builder; `build()` validates
//!   (uniqueness, dependency closure, acyclicity) and compiles to a
//!   runnable [`StageGraph`].
//! - **[`StageGraph`]** -- the scheduler: dispatches every ready stage
//!   concurrently and terminates via [`RunOutcome`] -- completed, cancelled
//!   gracefully by a stage, or interrupted by the ambient signal.
//! - **[`StageInputs`]** -- the immutable per-invocation view: a stage sees
//!   the run's [`ContextSnapshot`] plus outputs of *declared dependencies
//!   only*, alongside injected [`StagePorts`] capabilities.
//! - **[`EventSink`]** -- where `stage.*`, `pipeline.*`, `circuit.*`, and
//!   `provider.call.*` events go; `try_emit` is fire-and-forget.
//! - **[`PipelineOrchestrator`]** -- overlays the lifecycle state machine
//!   (`created -> running -> (streaming ->)? completed | failed | cancelled |
//!   cancelled_gracefully`) and the by-id cancellation surface.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use stageflow::testing::FnStage;
//! use stageflow::{
//!     ContextSnapshot, Pipeline, RunContext, StageContext, StageKind, StageOutput, StageSpec,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transcribe = Arc::new(FnStage::new("stt", StageKind::Transform, |ctx: &StageContext| {
//!         Box::pin(async move {
//!             let text = ctx.snapshot().input_text.clone().unwrap_or_default();
//!             Ok(StageOutput::ok_empty().with_data("transcript", text.into()))
//!         })
//!     }));
//!     let respond = Arc::new(FnStage::new("llm", StageKind::Transform, |ctx: &StageContext| {
//!         Box::pin(async move {
//!             let transcript = ctx.inputs().get_from("stt", "transcript");
//!             Ok(StageOutput::ok_empty().with_data("reply", transcript.cloned().unwrap_or_default()))
//!         })
//!     }));
//!
//!     let graph = Pipeline::new()
//!         .with_stage(StageSpec::new("stt", transcribe, StageKind::Transform))
//!         .with_stage(StageSpec::new("llm", respond, StageKind::Transform).with_dependencies(["stt"]))
//!         .build()?;
//!
//!     let snapshot = ContextSnapshot::builder().input_text("hello there").build();
//!     let outcome = graph.run(RunContext::new(snapshot)).await?;
//!     println!("{:?}", outcome.outputs()["llm"].data["reply"]);
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod graph;
pub mod guardrails;
pub mod inputs;
pub mod interceptor;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod stage;
pub mod subpipeline;
pub mod testing;
pub mod tools;

// --- Primary exports ---
pub use breaker::{BreakerKey, CircuitBreaker, CircuitState};
pub use cancellation::CancelSignal;
pub use config::{BreakerConfig, StageflowConfig};
pub use context::{
    ContextSnapshot, ContextSnapshotBuilder, DocumentEnrichment, MemoryEnrichment, Message,
    ProfileEnrichment, Role, RoutingDecision,
};
pub use error::{Result, StageflowError};
pub use events::{
    clear_event_sink, get_event_sink, set_event_sink, CollectingEventSink, EventSink,
    NoOpEventSink, TracingEventSink,
};
pub use graph::{RunContext, RunOutcome, StageGraph};
pub use guardrails::{
    global_guardrail_registry, Guardrail, GuardrailCheckpoint, GuardrailDecision,
    GuardrailRegistry, GuardrailResult, GuardrailStage,
};
pub use inputs::{StageInputs, StagePorts, StagePortsBuilder};
pub use interceptor::{
    default_interceptors, run_with_interceptors, BreakerInterceptor, Interceptor,
    InterceptorContext, InterceptorResult, LoggingInterceptor, MetricsInterceptor, StageMetrics,
    TimeoutInterceptor, TracingInterceptor,
};
pub use orchestrator::{
    is_cancel_requested, request_cancel, PipelineOrchestrator, RunReport, RunState,
};
pub use pipeline::{Pipeline, StageSpec};
pub use provider::{CallRecorder, CallUsage, MonitoredStream, ProviderCall, ProviderCallLogger};
pub use registry::{global_pipeline_registry, PipelineRegistry};
pub use stage::{
    PipelineTimer, Stage, StageArtifact, StageContext, StageEvent, StageKind, StageOutput,
    StageStatus,
};
pub use subpipeline::{
    global_child_tracker, ChildRunTracker, SubpipelineResult, SubpipelineSpawner,
};
pub use tools::{global_tool_registry, Tool, ToolInput, ToolOutput, ToolRegistry};
