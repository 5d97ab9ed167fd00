use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the engine and its components.
#[derive(Error, Debug)]
pub enum StageflowError {
    /// Pipeline construction invariants violated. Surfaced at `build()`,
    /// never during a run.
    #[error("Invalid pipeline: {0}")]
    Validation(String),

    /// A pipeline contained no stages.
    #[error("Pipeline requires at least one stage")]
    EmptyPipeline,

    /// A stage declared a dependency on a name that does not exist.
    #[error("Stage '{stage}' depends on undeclared stage '{dependency}'")]
    MissingDependency { stage: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// A stage raised or returned a FAIL output during a run.
    #[error("Stage '{stage}' failed: {message}")]
    StageExecution { stage: String, message: String },

    /// The scheduler made no progress with stages still pending. Cycles are
    /// caught at build time, so this indicates a scheduler bug.
    #[error("Deadlocked stage graph; remaining stages: {pending:?}")]
    Deadlock { pending: Vec<String> },

    /// An operation exceeded its wall-clock budget.
    #[error("Operation '{operation}' timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    /// A call was denied by an open circuit breaker.
    #[error("Call denied by open circuit: operation={operation} provider={provider} model={model_id:?}")]
    CircuitOpen {
        operation: String,
        provider: String,
        model_id: Option<String>,
    },

    /// An external provider call failed. Carries the provider-call id so
    /// failure summaries can link back to the recorded call.
    #[error("Provider call {call_id} failed: {message}")]
    ProviderCallFailed { call_id: Uuid, message: String },

    /// Subpipeline nesting exceeded the configured depth limit.
    #[error("Subpipeline depth {depth} exceeds maximum {max}")]
    MaxDepthExceeded { depth: usize, max: usize },

    /// The run was cancelled.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// JSON (de)serialization failed at the serde level.
    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for StageflowError {
    fn from(err: anyhow::Error) -> Self {
        StageflowError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StageflowError>;
