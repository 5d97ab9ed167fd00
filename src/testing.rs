//! Test fixtures: closure-backed stages, canned stage behaviors, and a
//! snapshot fixture.
//!
//! Public so downstream crates can write deterministic pipeline tests
//! without a live provider. The [`CollectingEventSink`] lives in
//! [`events`](crate::events).

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::context::ContextSnapshot;
use crate::error::Result;
use crate::inputs::BoxFut;
use crate::stage::{Stage, StageContext, StageKind, StageOutput};

/// A stage backed by a closure.
///
/// # Example
///
/// ```
/// use stageflow::testing::FnStage;
/// use stageflow::{StageContext, StageKind, StageOutput};
///
/// let stage = FnStage::new("echo", StageKind::Work, |_ctx: &StageContext| {
///     Box::pin(async { Ok(StageOutput::ok_empty()) })
/// });
/// ```
pub struct FnStage<F> {
    name: String,
    kind: StageKind,
    f: F,
}

impl<F> FnStage<F>
where
    F: for<'a> Fn(&'a StageContext) -> BoxFut<'a, Result<StageOutput>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, kind: StageKind, f: F) -> Self {
        Self {
            name: name.into(),
            kind,
            f,
        }
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: for<'a> Fn(&'a StageContext) -> BoxFut<'a, Result<StageOutput>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        (self.f)(ctx).await
    }
}

/// A stage that returns `ok` with `{"step": <name>}` and records its
/// invocation in a shared log.
pub fn ok_stage(name: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Stage> {
    let step = name.to_string();
    Arc::new(FnStage::new(name, StageKind::Work, move |_ctx: &StageContext| {
        let step = step.clone();
        let log = Arc::clone(&log);
        Box::pin(async move {
            log.lock().push(step.clone());
            Ok(StageOutput::ok_empty().with_data("step", Value::String(step)))
        })
    }))
}

/// A stage that returns `ok` carrying one data entry.
pub fn data_stage(name: &str, key: &str, value: Value) -> Arc<dyn Stage> {
    let key = key.to_string();
    Arc::new(FnStage::new(name, StageKind::Work, move |_ctx: &StageContext| {
        let key = key.clone();
        let value = value.clone();
        Box::pin(async move { Ok(StageOutput::ok_empty().with_data(key, value)) })
    }))
}

/// A stage that returns `fail(error)`.
pub fn fail_stage(name: &str, error: &str) -> Arc<dyn Stage> {
    let error = error.to_string();
    Arc::new(FnStage::new(name, StageKind::Work, move |_ctx: &StageContext| {
        let error = error.clone();
        Box::pin(async move { Ok(StageOutput::fail(error)) })
    }))
}

/// A stage that returns `cancel(reason)`.
pub fn cancel_stage(name: &str, reason: &str) -> Arc<dyn Stage> {
    let reason = reason.to_string();
    Arc::new(FnStage::new(name, StageKind::Work, move |_ctx: &StageContext| {
        let reason = reason.clone();
        Box::pin(async move { Ok(StageOutput::cancel(reason)) })
    }))
}

/// A stage that completes OK but publishes a `skip_reason`, signalling
/// conditional dependents to skip.
pub fn skip_signal_stage(name: &str, reason: &str) -> Arc<dyn Stage> {
    data_stage(name, "skip_reason", json!(reason))
}

/// A stage that sleeps until cancelled.
pub fn hanging_stage(name: &str) -> Arc<dyn Stage> {
    Arc::new(FnStage::new(name, StageKind::Work, |_ctx: &StageContext| {
        Box::pin(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(StageOutput::ok_empty())
        })
    }))
}

/// A snapshot with a full set of identifiers, for tests.
pub fn snapshot_fixture() -> ContextSnapshot {
    ContextSnapshot::builder()
        .pipeline_run_id(Uuid::new_v4())
        .request_id(Uuid::new_v4())
        .session_id(Uuid::new_v4())
        .user_id(Uuid::new_v4())
        .topology("test_kernel")
        .execution_mode("test")
        .input_text("fixture input")
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoOpEventSink;
    use crate::inputs::{StageInputs, StagePorts};
    use crate::stage::PipelineTimer;
    use std::collections::BTreeMap;

    fn ctx_for(snapshot: ContextSnapshot) -> StageContext {
        let snapshot = Arc::new(snapshot);
        StageContext::new(
            Arc::clone(&snapshot),
            StageInputs::new(snapshot, BTreeMap::new(), Arc::new(StagePorts::default())),
            PipelineTimer::start(),
            Arc::new(NoOpEventSink),
        )
    }

    #[tokio::test]
    async fn test_fn_stage_executes_closure() {
        let stage = FnStage::new("double", StageKind::Transform, |ctx: &StageContext| {
            Box::pin(async move {
                let text = ctx.snapshot().input_text.clone().unwrap_or_default();
                Ok(StageOutput::ok_empty().with_data("echo", json!(text)))
            })
        });

        let output = stage.execute(&ctx_for(snapshot_fixture())).await.unwrap();
        assert_eq!(output.data["echo"], "fixture input");
    }

    #[tokio::test]
    async fn test_canned_stages() {
        let ctx = ctx_for(snapshot_fixture());

        let log = Arc::new(Mutex::new(Vec::new()));
        let ok = ok_stage("a", Arc::clone(&log));
        assert_eq!(ok.execute(&ctx).await.unwrap().data["step"], "a");
        assert_eq!(*log.lock(), vec!["a"]);

        let fail = fail_stage("f", "broken");
        assert_eq!(fail.execute(&ctx).await.unwrap().error.as_deref(), Some("broken"));

        let cancel = cancel_stage("c", "quiet");
        assert_eq!(
            cancel.execute(&ctx).await.unwrap().data["cancel_reason"],
            "quiet"
        );

        let signal = skip_signal_stage("s", "noop");
        let output = signal.execute(&ctx).await.unwrap();
        assert_eq!(output.skip_signal().as_deref(), Some("noop"));
    }
}
