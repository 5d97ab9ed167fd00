//! Ordered middleware around stage execution.
//!
//! Each stage invocation passes through a chain of [`Interceptor`]s wrapped
//! outermost-first. An interceptor can observe the invocation through its
//! `before_stage`/`after_stage` hooks, replace the output, request a retry,
//! or abort -- or override [`handle`](Interceptor::handle) to genuinely wrap
//! the inner future (the timeout interceptor does this).
//!
//! Canonical order, outermost first: logging, metrics, tracing, timeout,
//! circuit breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::Instrument;
use uuid::Uuid;

use crate::breaker::{BreakerKey, CircuitBreaker};
use crate::error::Result;
use crate::events::EventSink;
use crate::inputs::BoxFut;
use crate::stage::{PipelineTimer, StageKind, StageOutput, StageStatus};

/// Future type produced by the inner stage function.
pub type StageFuture = BoxFut<'static, Result<StageOutput>>;

/// The inner stage function: owns its captures (clone `Arc`s into it) so it
/// can be re-invoked on a retry signal.
pub type StageRunFn = Arc<dyn Fn() -> StageFuture + Send + Sync>;

/// Bounded number of re-runs a retry-signalling interceptor can trigger.
const MAX_INTERCEPTOR_RETRIES: u32 = 3;

/// Read-only view of one stage invocation handed to interceptors.
pub struct InterceptorContext {
    pub stage: String,
    pub kind: StageKind,
    /// Provider hint for the circuit breaker, when the stage config has one.
    pub provider: Option<String>,
    /// Model hint for the circuit breaker.
    pub model_id: Option<String>,
    /// Effective wall-clock budget for this invocation.
    pub timeout: Duration,
    pub pipeline_run_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
    pub timer: PipelineTimer,
    pub sink: Arc<dyn EventSink>,
}

/// Verdict from an interceptor's `after_stage` hook.
#[derive(Debug)]
pub enum InterceptorResult {
    /// Pass the outcome through unchanged.
    Unchanged,
    /// Substitute the stage output.
    Replace(StageOutput),
    /// Re-run the inner function (bounded).
    Retry { reason: String },
    /// Convert the outcome to a failure.
    Abort { reason: String },
}

/// The remainder of the interceptor chain plus the inner stage function.
///
/// Copyable so an interceptor can re-run the tail (retry semantics).
#[derive(Clone, Copy)]
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    inner: &'a StageRunFn,
}

impl<'a> Next<'a> {
    /// Run the rest of the chain, ending with the inner stage function.
    pub async fn run(self, ctx: &InterceptorContext) -> Result<StageOutput> {
        match self.interceptors.split_first() {
            Some((head, rest)) => {
                head.handle(
                    ctx,
                    Next {
                        interceptors: rest,
                        inner: self.inner,
                    },
                )
                .await
            }
            None => (self.inner)().await,
        }
    }
}

/// Middleware around stage execution.
///
/// Implement the hooks for observation-style interceptors, or override
/// [`handle`](Self::handle) to wrap the inner future. The default `handle`
/// runs `before_stage`, the rest of the chain exactly once, then
/// `after_stage`, honoring the returned [`InterceptorResult`].
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Name for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Called before the stage runs. Returning `Some(output)` short-circuits
    /// the invocation: the inner function is never called and the output is
    /// used as the outcome (the circuit breaker denies calls this way).
    async fn before_stage(&self, _ctx: &InterceptorContext) -> Option<StageOutput> {
        None
    }

    /// Called after the stage ran (or was short-circuited), with the
    /// outcome produced so far.
    async fn after_stage(
        &self,
        _ctx: &InterceptorContext,
        _outcome: &Result<StageOutput>,
    ) -> InterceptorResult {
        InterceptorResult::Unchanged
    }

    /// Wrap the rest of the chain.
    async fn handle(&self, ctx: &InterceptorContext, next: Next<'_>) -> Result<StageOutput> {
        if let Some(replacement) = self.before_stage(ctx).await {
            let outcome = Ok(replacement);
            return match self.after_stage(ctx, &outcome).await {
                InterceptorResult::Replace(output) => Ok(output),
                InterceptorResult::Abort { reason } => Ok(StageOutput::fail(reason)),
                _ => outcome,
            };
        }

        let mut outcome = next.run(ctx).await;
        let mut retries = 0;
        loop {
            match self.after_stage(ctx, &outcome).await {
                InterceptorResult::Unchanged => return outcome,
                InterceptorResult::Replace(output) => return Ok(output),
                InterceptorResult::Abort { reason } => return Ok(StageOutput::fail(reason)),
                InterceptorResult::Retry { reason } => {
                    if retries >= MAX_INTERCEPTOR_RETRIES {
                        return outcome;
                    }
                    retries += 1;
                    tracing::debug!(
                        stage = %ctx.stage,
                        interceptor = self.name(),
                        attempt = retries,
                        %reason,
                        "interceptor requested retry"
                    );
                    outcome = next.run(ctx).await;
                }
            }
        }
    }
}

/// Run a stage function through an interceptor chain.
///
/// `before` hooks fire in chain order, the inner function runs exactly once
/// (absent retry signals), and `after` hooks fire in reverse order as the
/// stack unwinds.
pub async fn run_with_interceptors(
    ctx: &InterceptorContext,
    interceptors: &[Arc<dyn Interceptor>],
    inner: &StageRunFn,
) -> Result<StageOutput> {
    Next { interceptors, inner }.run(ctx).await
}

/// Structured start/end logging with correlation ids and durations.
#[derive(Debug, Default)]
pub struct LoggingInterceptor;

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(&self, ctx: &InterceptorContext, next: Next<'_>) -> Result<StageOutput> {
        let started = Instant::now();
        tracing::info!(
            stage = %ctx.stage,
            kind = ctx.kind.as_str(),
            pipeline_run_id = ?ctx.pipeline_run_id,
            request_id = ?ctx.request_id,
            "stage started"
        );

        let outcome = next.run(ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(output) => tracing::info!(
                stage = %ctx.stage,
                status = output.status.as_str(),
                duration_ms,
                pipeline_run_id = ?ctx.pipeline_run_id,
                "stage finished"
            ),
            Err(err) => tracing::error!(
                stage = %ctx.stage,
                error = %err,
                duration_ms,
                pipeline_run_id = ?ctx.pipeline_run_id,
                "stage errored"
            ),
        }
        outcome
    }
}

/// Per-stage counters accumulated by [`MetricsInterceptor`].
#[derive(Debug, Clone, Default)]
pub struct StageStats {
    pub invocations: u64,
    pub by_status: HashMap<&'static str, u64>,
    pub errors: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
}

/// Shared metrics store, keyed by stage name.
#[derive(Debug, Default)]
pub struct StageMetrics {
    stats: Mutex<HashMap<String, StageStats>>,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn observe(&self, stage: &str, status: Option<StageStatus>, duration_ms: u64) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(stage.to_string()).or_default();
        entry.invocations += 1;
        match status {
            Some(status) => *entry.by_status.entry(status.as_str()).or_insert(0) += 1,
            None => entry.errors += 1,
        }
        entry.total_duration_ms += duration_ms;
        entry.max_duration_ms = entry.max_duration_ms.max(duration_ms);
    }

    /// Snapshot of all per-stage stats.
    pub fn snapshot(&self) -> HashMap<String, StageStats> {
        self.stats.lock().clone()
    }
}

/// Accumulates invocation counts, per-status completions, and durations.
#[derive(Debug, Default)]
pub struct MetricsInterceptor {
    metrics: Arc<StageMetrics>,
}

impl MetricsInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<StageMetrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        Arc::clone(&self.metrics)
    }
}

#[async_trait]
impl Interceptor for MetricsInterceptor {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn handle(&self, ctx: &InterceptorContext, next: Next<'_>) -> Result<StageOutput> {
        let started = Instant::now();
        let outcome = next.run(ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let status = outcome.as_ref().ok().map(|o| o.status);
        self.metrics.observe(&ctx.stage, status, duration_ms);
        outcome
    }
}

/// Runs the stage inside a tracing span carrying a minted span id, so
/// subpipelines spawned from the stage inherit the parent span context.
#[derive(Debug, Default)]
pub struct TracingInterceptor;

#[async_trait]
impl Interceptor for TracingInterceptor {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn handle(&self, ctx: &InterceptorContext, next: Next<'_>) -> Result<StageOutput> {
        let span_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "stage",
            stage = %ctx.stage,
            kind = ctx.kind.as_str(),
            span_id = %span_id,
            pipeline_run_id = ?ctx.pipeline_run_id,
        );
        next.run(ctx).instrument(span).await
    }
}

/// Enforces a per-stage wall-clock budget. On expiry the inner task is
/// cancelled (dropped) and the invocation resolves to a FAIL output with
/// reason `timeout`.
#[derive(Debug)]
pub struct TimeoutInterceptor {
    default_timeout: Duration,
}

impl TimeoutInterceptor {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl Default for TimeoutInterceptor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Interceptor for TimeoutInterceptor {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn handle(&self, ctx: &InterceptorContext, next: Next<'_>) -> Result<StageOutput> {
        let budget = if ctx.timeout.is_zero() {
            self.default_timeout
        } else {
            ctx.timeout
        };
        match tokio::time::timeout(budget, next.run(ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(stage = %ctx.stage, ?budget, "stage timed out");
                Ok(StageOutput::fail(format!(
                    "Stage '{}' timed out after {budget:?}",
                    ctx.stage
                ))
                .with_data("reason", Value::String("timeout".into())))
            }
        }
    }
}

/// Consults the circuit breaker for `(stage, provider, model)` before the
/// stage runs and reports the outcome after.
///
/// Stages without provider hints bypass the breaker entirely. When the
/// circuit is open the stage is never invoked: the invocation resolves to a
/// FAIL output with reason `circuit_open` and a `<stage>.breaker.denied`
/// event is emitted.
pub struct BreakerInterceptor {
    breaker: Arc<CircuitBreaker>,
}

impl BreakerInterceptor {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    fn key_for(ctx: &InterceptorContext) -> Option<BreakerKey> {
        ctx.provider
            .as_ref()
            .map(|provider| BreakerKey::new(ctx.stage.clone(), provider.clone(), ctx.model_id.clone()))
    }
}

#[async_trait]
impl Interceptor for BreakerInterceptor {
    fn name(&self) -> &'static str {
        "breaker"
    }

    async fn handle(&self, ctx: &InterceptorContext, next: Next<'_>) -> Result<StageOutput> {
        let Some(key) = Self::key_for(ctx) else {
            return next.run(ctx).await;
        };

        if self.breaker.is_open(&key).await {
            let mut data = Map::new();
            data.insert("operation".into(), Value::String(key.operation.clone()));
            data.insert("provider".into(), Value::String(key.provider.clone()));
            data.insert(
                "model_id".into(),
                key.model_id.clone().map(Value::String).unwrap_or(Value::Null),
            );
            data.insert("reason".into(), Value::String("circuit_open".into()));
            ctx.sink
                .try_emit(&format!("{}.breaker.denied", ctx.stage), Some(data));
            return Ok(StageOutput::fail(format!(
                "Stage '{}' denied by open circuit",
                ctx.stage
            ))
            .with_data("reason", Value::String("circuit_open".into())));
        }

        self.breaker.note_attempt(&key).await;
        let outcome = next.run(ctx).await;
        match &outcome {
            Ok(output) if matches!(output.status, StageStatus::Fail | StageStatus::Retry) => {
                let reason = output.error.as_deref().unwrap_or("stage_failed");
                self.breaker.record_failure(&key, reason).await;
            }
            Ok(_) => self.breaker.record_success(&key).await,
            Err(err) => {
                let reason = err.to_string();
                self.breaker.record_failure(&key, &reason).await;
            }
        }
        outcome
    }
}

/// The canonical chain, outermost first: logging, metrics, tracing,
/// timeout, breaker.
pub fn default_interceptors(
    default_timeout: Duration,
    breaker: Arc<CircuitBreaker>,
) -> Vec<Arc<dyn Interceptor>> {
    vec![
        Arc::new(LoggingInterceptor),
        Arc::new(MetricsInterceptor::new()),
        Arc::new(TracingInterceptor),
        Arc::new(TimeoutInterceptor::new(default_timeout)),
        Arc::new(BreakerInterceptor::new(breaker)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::events::CollectingEventSink;
    use crate::events::NoOpEventSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_ctx(sink: Arc<dyn EventSink>) -> InterceptorContext {
        InterceptorContext {
            stage: "llm".into(),
            kind: StageKind::Transform,
            provider: None,
            model_id: None,
            timeout: Duration::from_secs(5),
            pipeline_run_id: Some(Uuid::new_v4()),
            request_id: None,
            timer: PipelineTimer::start(),
            sink,
        }
    }

    fn counted_inner(counter: Arc<AtomicU32>) -> StageRunFn {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(StageOutput::ok_empty())
            })
        })
    }

    #[tokio::test]
    async fn test_empty_chain_runs_inner_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let inner = counted_inner(Arc::clone(&counter));
        let ctx = test_ctx(Arc::new(NoOpEventSink));

        let output = run_with_interceptors(&ctx, &[], &inner).await.unwrap();
        assert_eq!(output.status, StageStatus::Ok);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_and_reverse() {
        struct Recorder {
            tag: &'static str,
            log: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Interceptor for Recorder {
            fn name(&self) -> &'static str {
                self.tag
            }
            async fn before_stage(&self, _ctx: &InterceptorContext) -> Option<StageOutput> {
                self.log.lock().push(format!("before:{}", self.tag));
                None
            }
            async fn after_stage(
                &self,
                _ctx: &InterceptorContext,
                _outcome: &Result<StageOutput>,
            ) -> InterceptorResult {
                self.log.lock().push(format!("after:{}", self.tag));
                InterceptorResult::Unchanged
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Recorder { tag: "outer", log: Arc::clone(&log) }),
            Arc::new(Recorder { tag: "inner", log: Arc::clone(&log) }),
        ];
        let counter = Arc::new(AtomicU32::new(0));
        let inner = counted_inner(Arc::clone(&counter));
        let ctx = test_ctx(Arc::new(NoOpEventSink));

        run_with_interceptors(&ctx, &chain, &inner).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["before:outer", "before:inner", "after:inner", "after:outer"]
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replace_substitutes_output() {
        struct Replacer;

        #[async_trait]
        impl Interceptor for Replacer {
            fn name(&self) -> &'static str {
                "replacer"
            }
            async fn after_stage(
                &self,
                _ctx: &InterceptorContext,
                _outcome: &Result<StageOutput>,
            ) -> InterceptorResult {
                InterceptorResult::Replace(StageOutput::skip("replaced"))
            }
        }

        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(Replacer)];
        let counter = Arc::new(AtomicU32::new(0));
        let inner = counted_inner(Arc::clone(&counter));
        let ctx = test_ctx(Arc::new(NoOpEventSink));

        let output = run_with_interceptors(&ctx, &chain, &inner).await.unwrap();
        assert_eq!(output.status, StageStatus::Skip);
    }

    #[tokio::test]
    async fn test_retry_signal_reruns_inner_bounded() {
        struct AlwaysRetry;

        #[async_trait]
        impl Interceptor for AlwaysRetry {
            fn name(&self) -> &'static str {
                "always-retry"
            }
            async fn after_stage(
                &self,
                _ctx: &InterceptorContext,
                _outcome: &Result<StageOutput>,
            ) -> InterceptorResult {
                InterceptorResult::Retry { reason: "again".into() }
            }
        }

        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(AlwaysRetry)];
        let counter = Arc::new(AtomicU32::new(0));
        let inner = counted_inner(Arc::clone(&counter));
        let ctx = test_ctx(Arc::new(NoOpEventSink));

        run_with_interceptors(&ctx, &chain, &inner).await.unwrap();
        // Initial run plus the bounded retries.
        assert_eq!(counter.load(Ordering::SeqCst), 1 + MAX_INTERCEPTOR_RETRIES);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_fail() {
        let chain: Vec<Arc<dyn Interceptor>> =
            vec![Arc::new(TimeoutInterceptor::new(Duration::from_secs(30)))];
        let mut ctx = test_ctx(Arc::new(NoOpEventSink));
        ctx.timeout = Duration::from_millis(20);

        let inner: StageRunFn = Arc::new(|| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(StageOutput::ok_empty())
            })
        });

        let output = run_with_interceptors(&ctx, &chain, &inner).await.unwrap();
        assert_eq!(output.status, StageStatus::Fail);
        assert_eq!(output.data["reason"], "timeout");
        assert!(output.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_metrics_accumulate() {
        let metrics_interceptor = MetricsInterceptor::new();
        let metrics = metrics_interceptor.metrics();
        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(metrics_interceptor)];
        let counter = Arc::new(AtomicU32::new(0));
        let inner = counted_inner(Arc::clone(&counter));
        let ctx = test_ctx(Arc::new(NoOpEventSink));

        run_with_interceptors(&ctx, &chain, &inner).await.unwrap();
        run_with_interceptors(&ctx, &chain, &inner).await.unwrap();

        let snapshot = metrics.snapshot();
        let stats = &snapshot["llm"];
        assert_eq!(stats.invocations, 2);
        assert_eq!(stats.by_status["ok"], 2);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_breaker_denies_without_invoking() {
        let sink = Arc::new(CollectingEventSink::new());
        let breaker = Arc::new(
            CircuitBreaker::new(BreakerConfig::default().with_failure_threshold(1))
                .with_sink(sink.clone()),
        );
        let key = BreakerKey::new("llm", "groq", Some("llama".into()));
        breaker.record_failure(&key, "boom").await;

        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(BreakerInterceptor::new(breaker))];
        let counter = Arc::new(AtomicU32::new(0));
        let inner = counted_inner(Arc::clone(&counter));
        let mut ctx = test_ctx(sink.clone());
        ctx.provider = Some("groq".into());
        ctx.model_id = Some("llama".into());

        let output = run_with_interceptors(&ctx, &chain, &inner).await.unwrap();
        assert_eq!(output.status, StageStatus::Fail);
        assert_eq!(output.data["reason"], "circuit_open");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(sink.count_of("llm.breaker.denied"), 1);
    }

    #[tokio::test]
    async fn test_breaker_bypassed_without_hints() {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::default().with_failure_threshold(1),
        ));
        let chain: Vec<Arc<dyn Interceptor>> =
            vec![Arc::new(BreakerInterceptor::new(Arc::clone(&breaker)))];
        let counter = Arc::new(AtomicU32::new(0));
        let inner = counted_inner(Arc::clone(&counter));
        let ctx = test_ctx(Arc::new(NoOpEventSink));

        run_with_interceptors(&ctx, &chain, &inner).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // No hints means no breaker state was created for the stage.
        let key = BreakerKey::new("llm", "groq", None);
        assert!(breaker.state_of(&key).await.is_none());
    }
}
