//! Guardrail policy seam: checkpointed content checks around a run.
//!
//! The engine defines where guardrails run (checkpoints), how their
//! verdicts aggregate, and how decisions are reported; the content rules
//! themselves are application code registered through the
//! [`GuardrailRegistry`]. [`GuardrailStage`] is the pipeline-facing
//! wrapper: a GUARD-kind stage that applies every guardrail registered for
//! its checkpoint and publishes the aggregate decision.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::stage::{Stage, StageContext, StageKind, StageOutput};

/// Where in a run a guardrail applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardrailCheckpoint {
    /// Before prompting the model.
    PreLlm,
    /// Before executing agent actions.
    PreAction,
    /// Before persisting results.
    PrePersist,
}

impl GuardrailCheckpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailCheckpoint::PreLlm => "pre_llm",
            GuardrailCheckpoint::PreAction => "pre_action",
            GuardrailCheckpoint::PrePersist => "pre_persist",
        }
    }
}

/// A guardrail's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Block,
}

impl GuardrailDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailDecision::Allow => "allow",
            GuardrailDecision::Block => "block",
        }
    }
}

/// Outcome of applying one guardrail.
#[derive(Debug, Clone)]
pub struct GuardrailResult {
    pub decision: GuardrailDecision,
    pub reason: String,
}

impl GuardrailResult {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: GuardrailDecision::Allow,
            reason: reason.into(),
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            decision: GuardrailDecision::Block,
            reason: reason.into(),
        }
    }

    pub fn should_block(&self) -> bool {
        self.decision == GuardrailDecision::Block
    }
}

/// A content rule applied at a checkpoint. Rules receive the stage context
/// and judge the run's content; they never mutate it.
#[async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, ctx: &StageContext) -> Result<GuardrailResult>;
}

/// Registry of guardrails per checkpoint.
#[derive(Default)]
pub struct GuardrailRegistry {
    guardrails: RwLock<HashMap<GuardrailCheckpoint, Vec<Arc<dyn Guardrail>>>>,
}

impl GuardrailRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a guardrail at a checkpoint. Order of registration is
    /// order of application.
    pub fn register(&self, checkpoint: GuardrailCheckpoint, guardrail: Arc<dyn Guardrail>) {
        self.guardrails.write().entry(checkpoint).or_default().push(guardrail);
    }

    /// Guardrails registered for a checkpoint, in registration order.
    pub fn lookup(&self, checkpoint: GuardrailCheckpoint) -> Vec<Arc<dyn Guardrail>> {
        self.guardrails
            .read()
            .get(&checkpoint)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop all registrations. Test hook for the process-scoped instance.
    pub fn clear(&self) {
        self.guardrails.write().clear();
    }
}

static GLOBAL_GUARDRAILS: RwLock<Option<Arc<GuardrailRegistry>>> = RwLock::new(None);

/// Process-scoped guardrail registry, created lazily.
pub fn global_guardrail_registry() -> Arc<GuardrailRegistry> {
    if let Some(registry) = GLOBAL_GUARDRAILS.read().as_ref() {
        return Arc::clone(registry);
    }
    let mut slot = GLOBAL_GUARDRAILS.write();
    slot.get_or_insert_with(|| Arc::new(GuardrailRegistry::new())).clone()
}

/// GUARD-kind stage applying every guardrail registered for a checkpoint.
///
/// Each guardrail's decision is emitted as a `guardrails.<checkpoint>`
/// event. A guardrail that errors is logged and skipped; the remaining
/// guardrails still run. Any block wins: the stage output carries
/// `decision = "block"` and the joined reasons, and downstream conditional
/// stages can key off the published `skip_reason`.
pub struct GuardrailStage {
    name: String,
    checkpoint: GuardrailCheckpoint,
    registry: Arc<GuardrailRegistry>,
}

impl GuardrailStage {
    pub fn new(checkpoint: GuardrailCheckpoint) -> Self {
        Self {
            name: format!("guardrails_{}", checkpoint.as_str()),
            checkpoint,
            registry: global_guardrail_registry(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<GuardrailRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

#[async_trait]
impl Stage for GuardrailStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Guard
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        let checkpoint = self.checkpoint.as_str();
        let guardrails = self.registry.lookup(self.checkpoint);

        if guardrails.is_empty() {
            return Ok(StageOutput::ok_empty()
                .with_data("decision", Value::String("allow".into()))
                .with_data("reason", Value::String("No guardrails configured".into())));
        }

        let mut blocked_reasons: Vec<String> = Vec::new();
        for guardrail in guardrails {
            let result = match guardrail.apply(ctx).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(
                        guardrail = guardrail.name(),
                        checkpoint,
                        error = %err,
                        "guardrail failed; continuing with remaining guardrails"
                    );
                    continue;
                }
            };

            let mut data = Map::new();
            data.insert("checkpoint".into(), Value::String(checkpoint.into()));
            data.insert("guardrail".into(), Value::String(guardrail.name().into()));
            data.insert("decision".into(), Value::String(result.decision.as_str().into()));
            data.insert("reason".into(), Value::String(result.reason.clone()));
            ctx.emit(&format!("guardrails.{checkpoint}"), data);

            if result.should_block() {
                blocked_reasons.push(result.reason);
            }
        }

        if blocked_reasons.is_empty() {
            Ok(StageOutput::ok_empty()
                .with_data("decision", Value::String("allow".into()))
                .with_data(
                    "reason",
                    Value::String("Content passed all guardrails".into()),
                ))
        } else {
            let reason = blocked_reasons.join("; ");
            Ok(StageOutput::ok_empty()
                .with_data("decision", Value::String("block".into()))
                .with_data("reason", Value::String(reason.clone()))
                .with_data("skip_reason", Value::String(reason)))
        }
    }
}
