//! Dependency-driven DAG scheduler.
//!
//! [`StageGraph`] executes a validated set of stage specs with maximal
//! legal concurrency: every stage whose dependencies have completed is
//! dispatched as its own task, outputs flow only along declared edges, and
//! the run terminates through one of four doors -- completion, graceful
//! stage-initiated cancel, ambient cancel, or failure. Only failure is an
//! error; the other terminal states are [`RunOutcome`] variants.
//!
//! Graphs are built by [`Pipeline::build`](crate::pipeline::Pipeline::build),
//! which validates names, dependency closure, and acyclicity, so the
//! scheduler itself only has the deadlock guard as a safety net.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::task::JoinSet;

use crate::cancellation::CancelSignal;
use crate::context::ContextSnapshot;
use crate::error::{Result, StageflowError};
use crate::events::{get_event_sink, EventSink};
use crate::inputs::{StageInputs, StagePorts};
use crate::interceptor::{
    run_with_interceptors, Interceptor, InterceptorContext, StageRunFn,
};
use crate::pipeline::StageSpec;
use crate::stage::{PipelineTimer, StageContext, StageOutput, StageStatus};

/// Terminal state of a graph run. Only failures are `Err`; cancellation in
/// either form is control flow, not an error.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every stage completed; the map covers all stage names.
    Completed(HashMap<String, StageOutput>),
    /// A stage returned CANCEL: the run stopped gracefully. Success-with-
    /// no-work, not an error. The reason is preserved verbatim and the map
    /// holds the outputs gathered before the stop.
    Cancelled {
        stage: String,
        reason: String,
        partial: HashMap<String, StageOutput>,
    },
    /// The ambient cancel signal fired. Stages that never completed are
    /// recorded with a synthetic failed output.
    Interrupted(HashMap<String, StageOutput>),
}

impl RunOutcome {
    /// The outputs gathered by the run, whatever the terminal state.
    pub fn outputs(&self) -> &HashMap<String, StageOutput> {
        match self {
            RunOutcome::Completed(map) => map,
            RunOutcome::Cancelled { partial, .. } => partial,
            RunOutcome::Interrupted(map) => map,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

/// Per-run inputs to [`StageGraph::run`].
///
/// # Example
///
/// ```ignore
/// let outcome = graph.run(RunContext::new(snapshot).with_sink(sink)).await?;
/// ```
pub struct RunContext {
    pub(crate) snapshot: Arc<ContextSnapshot>,
    pub(crate) ports: Arc<StagePorts>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) cancel: CancelSignal,
    pub(crate) timer: PipelineTimer,
}

impl RunContext {
    /// Wrap a snapshot with default ports, the process-scoped sink, a fresh
    /// cancel signal, and a fresh timer.
    pub fn new(snapshot: ContextSnapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
            ports: Arc::new(StagePorts::default()),
            sink: get_event_sink(),
            cancel: CancelSignal::new(),
            timer: PipelineTimer::start(),
        }
    }

    pub fn with_ports(mut self, ports: Arc<StagePorts>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timer(mut self, timer: PipelineTimer) -> Self {
        self.timer = timer;
        self
    }
}

/// Parallel, cancellable DAG executor over validated stage specs.
pub struct StageGraph {
    specs: HashMap<String, StageSpec>,
    order: Vec<String>,
    interceptors: Arc<Vec<Arc<dyn Interceptor>>>,
    default_timeout: Duration,
}

impl std::fmt::Debug for StageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageGraph")
            .field("order", &self.order)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl StageGraph {
    /// Assemble a graph from validated specs. Callers outside the crate go
    /// through `Pipeline::build`, which validates first.
    pub(crate) fn from_specs(
        specs: Vec<StageSpec>,
        interceptors: Vec<Arc<dyn Interceptor>>,
        default_timeout: Duration,
    ) -> Self {
        let order: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let specs = specs.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self {
            specs,
            order,
            interceptors: Arc::new(interceptors),
            default_timeout,
        }
    }

    /// Replace the interceptor chain.
    pub fn with_interceptors(mut self, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        self.interceptors = Arc::new(interceptors);
        self
    }

    /// Stage names in insertion order.
    pub fn stage_names(&self) -> &[String] {
        &self.order
    }

    /// Execute every stage exactly once in dependency order, with maximal
    /// concurrency. The snapshot is never mutated.
    pub async fn run(&self, run: RunContext) -> Result<RunOutcome> {
        let RunContext {
            snapshot,
            ports,
            sink,
            cancel,
            timer,
        } = run;

        tracing::info!(
            stage_count = self.specs.len(),
            pipeline_run_id = ?snapshot.pipeline_run_id,
            "stage graph execution started"
        );

        let mut completed: HashMap<String, StageOutput> = HashMap::new();
        let mut in_degree: HashMap<String, usize> = self
            .specs
            .iter()
            .map(|(name, spec)| (name.clone(), spec.dependencies.len()))
            .collect();
        let mut tasks: JoinSet<(String, Result<StageOutput>)> = JoinSet::new();
        let mut task_names: HashMap<tokio::task::Id, String> = HashMap::new();

        for name in &self.order {
            if in_degree[name] == 0 {
                self.dispatch(name, &completed, &snapshot, &ports, &sink, &timer, &mut tasks, &mut task_names);
            }
        }

        while completed.len() < self.specs.len() {
            if tasks.is_empty() {
                let mut pending: Vec<String> = self
                    .specs
                    .keys()
                    .filter(|name| !completed.contains_key(*name))
                    .cloned()
                    .collect();
                pending.sort();
                tracing::error!(?pending, "deadlock detected in stage graph");
                return Err(StageflowError::Deadlock { pending });
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    Self::settle(&mut tasks).await;
                    for name in &self.order {
                        completed
                            .entry(name.clone())
                            .or_insert_with(|| StageOutput::fail("Pipeline canceled"));
                    }
                    tracing::info!(
                        pipeline_run_id = ?snapshot.pipeline_run_id,
                        "stage graph interrupted by cancel signal"
                    );
                    return Ok(RunOutcome::Interrupted(completed));
                }
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Err(join_err) => {
                            let stage = task_names
                                .remove(&join_err.id())
                                .unwrap_or_else(|| "<unknown>".to_string());
                            Self::settle(&mut tasks).await;
                            let message = if join_err.is_panic() {
                                "stage task panicked".to_string()
                            } else {
                                "stage task was cancelled".to_string()
                            };
                            return Err(StageflowError::StageExecution { stage, message });
                        }
                        Ok((task_id, (name, outcome))) => {
                            task_names.remove(&task_id);
                            match outcome {
                                Err(err) => {
                                    Self::settle(&mut tasks).await;
                                    return Err(err);
                                }
                                Ok(output) if output.status == StageStatus::Cancel => {
                                    let reason = output
                                        .data
                                        .get("cancel_reason")
                                        .and_then(Value::as_str)
                                        .unwrap_or("Pipeline cancelled")
                                        .to_string();
                                    completed.insert(name.clone(), output);
                                    Self::settle(&mut tasks).await;
                                    tracing::info!(
                                        stage = %name,
                                        %reason,
                                        stages_completed = completed.len(),
                                        "pipeline cancelled by stage"
                                    );
                                    return Ok(RunOutcome::Cancelled {
                                        stage: name,
                                        reason,
                                        partial: completed,
                                    });
                                }
                                Ok(output) => {
                                    completed.insert(name.clone(), output);
                                    for child in &self.order {
                                        if self.specs[child].dependencies.contains(&name) {
                                            let remaining = in_degree
                                                .get_mut(child)
                                                .expect("in-degree entry exists for every stage");
                                            *remaining -= 1;
                                            if *remaining == 0 {
                                                self.dispatch(child, &completed, &snapshot, &ports, &sink, &timer, &mut tasks, &mut task_names);
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(
            stage_count = completed.len(),
            pipeline_run_id = ?snapshot.pipeline_run_id,
            "stage graph execution completed"
        );
        Ok(RunOutcome::Completed(completed))
    }

    /// Cancel in-flight tasks and await their settlement, ignoring results.
    async fn settle(tasks: &mut JoinSet<(String, Result<StageOutput>)>) {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    /// Spawn one stage task. Dependencies are complete at dispatch time, so
    /// the inputs map is frozen here and moved into the task.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        name: &str,
        completed: &HashMap<String, StageOutput>,
        snapshot: &Arc<ContextSnapshot>,
        ports: &Arc<StagePorts>,
        sink: &Arc<dyn EventSink>,
        timer: &PipelineTimer,
        tasks: &mut JoinSet<(String, Result<StageOutput>)>,
        task_names: &mut HashMap<tokio::task::Id, String>,
    ) {
        let spec = self.specs[name].clone();
        let prior_outputs: BTreeMap<String, StageOutput> = spec
            .dependencies
            .iter()
            .map(|dep| (dep.clone(), completed[dep].clone()))
            .collect();

        let inputs = StageInputs::new(Arc::clone(snapshot), prior_outputs, Arc::clone(ports));
        let stage_ctx = Arc::new(StageContext::new(
            Arc::clone(snapshot),
            inputs,
            *timer,
            Arc::clone(sink),
        ));
        let ictx = InterceptorContext {
            stage: spec.name.clone(),
            kind: spec.kind,
            provider: spec.provider.clone(),
            model_id: spec.model_id.clone(),
            timeout: spec.timeout.unwrap_or(self.default_timeout),
            pipeline_run_id: snapshot.pipeline_run_id,
            request_id: snapshot.request_id,
            timer: *timer,
            sink: Arc::clone(sink),
        };
        let interceptors = Arc::clone(&self.interceptors);

        let handle = tasks.spawn(async move {
            let name = spec.name.clone();
            let output = Self::execute_node(spec, stage_ctx, ictx, interceptors).await;
            (name, output)
        });
        task_names.insert(handle.id(), name.to_string());
        tracing::debug!(stage = %name, "stage scheduled");
    }

    /// Run one stage: conditional-skip check, started/completed/failed
    /// events, interceptor chain, output normalization.
    async fn execute_node(
        spec: StageSpec,
        stage_ctx: Arc<StageContext>,
        ictx: InterceptorContext,
        interceptors: Arc<Vec<Arc<dyn Interceptor>>>,
    ) -> Result<StageOutput> {
        let name = spec.name.clone();

        if spec.conditional {
            let skip_reason = stage_ctx
                .inputs()
                .prior_outputs()
                .values()
                .find_map(StageOutput::skip_signal);
            if let Some(reason) = skip_reason {
                tracing::info!(stage = %name, %reason, "conditional stage skipped");
                let mut data = Map::new();
                data.insert("stage".into(), Value::String(name.clone()));
                data.insert("reason".into(), Value::String(reason.clone()));
                stage_ctx.emit(&format!("stage.{name}.skipped"), data);
                return Ok(StageOutput::skip(reason));
            }
        }

        let mut data = Map::new();
        data.insert("stage".into(), Value::String(name.clone()));
        data.insert("kind".into(), Value::String(spec.kind.as_str().into()));
        stage_ctx.emit(&format!("stage.{name}.started"), data);

        let started = Instant::now();
        let run_fn: StageRunFn = {
            let runner = Arc::clone(&spec.runner);
            let ctx = Arc::clone(&stage_ctx);
            Arc::new(move || {
                let runner = Arc::clone(&runner);
                let ctx = Arc::clone(&ctx);
                Box::pin(async move { runner.execute(&ctx).await })
            })
        };

        let outcome = run_with_interceptors(&ictx, &interceptors, &run_fn).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) if output.status == StageStatus::Fail => {
                let error = output
                    .error
                    .clone()
                    .unwrap_or_else(|| "Stage failed".to_string());
                let mut data = Map::new();
                data.insert("stage".into(), Value::String(name.clone()));
                data.insert("error".into(), Value::String(error.clone()));
                data.insert("duration_ms".into(), Value::from(duration_ms));
                stage_ctx.emit(&format!("stage.{name}.failed"), data);
                tracing::error!(stage = %name, %error, duration_ms, "stage failed");
                Err(StageflowError::StageExecution {
                    stage: name,
                    message: error,
                })
            }
            Ok(output) => {
                let mut data = Map::new();
                data.insert("stage".into(), Value::String(name.clone()));
                data.insert("status".into(), Value::String(output.status.as_str().into()));
                data.insert("duration_ms".into(), Value::from(duration_ms));
                stage_ctx.emit(&format!("stage.{name}.completed"), data);
                Ok(output)
            }
            Err(err) => {
                let error = err.to_string();
                let mut data = Map::new();
                data.insert("stage".into(), Value::String(name.clone()));
                data.insert("error".into(), Value::String(error.clone()));
                data.insert("duration_ms".into(), Value::from(duration_ms));
                stage_ctx.emit(&format!("stage.{name}.failed"), data);
                tracing::error!(stage = %name, %error, duration_ms, "stage errored");
                Err(StageflowError::StageExecution {
                    stage: name,
                    message: error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::pipeline::{Pipeline, StageSpec};
    use crate::stage::StageKind;
    use crate::testing::{
        cancel_stage, data_stage, fail_stage, hanging_stage, ok_stage, skip_signal_stage,
        snapshot_fixture, FnStage,
    };
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn collecting_run(snapshot: ContextSnapshot) -> (RunContext, Arc<CollectingEventSink>) {
        let sink = Arc::new(CollectingEventSink::new());
        let run = RunContext::new(snapshot).with_sink(sink.clone());
        (run, sink)
    }

    #[tokio::test]
    async fn test_linear_chain_runs_in_topological_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = Pipeline::new()
            .with_stage(StageSpec::new("a", ok_stage("a", Arc::clone(&log)), StageKind::Work))
            .with_stage(
                StageSpec::new("b", ok_stage("b", Arc::clone(&log)), StageKind::Work)
                    .with_dependencies(["a"]),
            )
            .with_stage(
                StageSpec::new("c", ok_stage("c", Arc::clone(&log)), StageKind::Work)
                    .with_dependencies(["b"]),
            )
            .build()
            .unwrap();

        let (run, _sink) = collecting_run(snapshot_fixture());
        let outcome = graph.run(run).await.unwrap();
        let RunOutcome::Completed(outputs) = outcome else {
            panic!("expected completed outcome");
        };

        let mut names: Vec<&String> = outputs.keys().collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_prior_outputs_restricted_to_declared_dependencies() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer = {
            let seen = Arc::clone(&seen);
            Arc::new(FnStage::new("c", StageKind::Work, move |ctx: &StageContext| {
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    let mut deps: Vec<String> =
                        ctx.inputs().prior_outputs().keys().cloned().collect();
                    deps.sort();
                    seen.lock().extend(deps);
                    Ok(StageOutput::ok_empty())
                })
            }))
        };

        let graph = Pipeline::new()
            .with_stage(StageSpec::new("a", data_stage("a", "from", json!("a")), StageKind::Work))
            .with_stage(
                StageSpec::new("b", data_stage("b", "from", json!("b")), StageKind::Work)
                    .with_dependencies(["a"]),
            )
            // c depends on b only; it must not see a's output.
            .with_stage(StageSpec::new("c", observer, StageKind::Work).with_dependencies(["b"]))
            .build()
            .unwrap();

        let (run, _sink) = collecting_run(snapshot_fixture());
        graph.run(run).await.unwrap();
        assert_eq!(*seen.lock(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_parallel_fan_in() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = Pipeline::new()
            .with_stage(StageSpec::new("x", ok_stage("x", Arc::clone(&log)), StageKind::Work))
            .with_stage(StageSpec::new("y", ok_stage("y", Arc::clone(&log)), StageKind::Work))
            .with_stage(
                StageSpec::new("z", ok_stage("z", Arc::clone(&log)), StageKind::Work)
                    .with_dependencies(["x", "y"]),
            )
            .build()
            .unwrap();

        let (run, sink) = collecting_run(snapshot_fixture());
        let outcome = graph.run(run).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.outputs().len(), 3);

        // x and y may start in either order, but both precede z.
        let types = sink.types();
        let started = |stage: &str| {
            types
                .iter()
                .position(|t| t == &format!("stage.{stage}.started"))
                .unwrap()
        };
        assert!(started("x") < started("z"));
        assert!(started("y") < started("z"));
    }

    #[tokio::test]
    async fn test_conditional_skip_propagation() {
        let invoked = Arc::new(Mutex::new(Vec::<String>::new()));
        let worker = {
            let invoked = Arc::clone(&invoked);
            Arc::new(FnStage::new("worker", StageKind::Work, move |_ctx: &StageContext| {
                let invoked = Arc::clone(&invoked);
                Box::pin(async move {
                    invoked.lock().push("worker".into());
                    Ok(StageOutput::ok_empty())
                })
            }))
        };

        let graph = Pipeline::new()
            .with_stage(StageSpec::new("router", skip_signal_stage("router", "noop"), StageKind::Route))
            .with_stage(
                StageSpec::new("worker", worker, StageKind::Work)
                    .with_dependencies(["router"])
                    .conditional(),
            )
            .build()
            .unwrap();

        let (run, sink) = collecting_run(snapshot_fixture());
        let outcome = graph.run(run).await.unwrap();
        let outputs = outcome.outputs();

        assert_eq!(outputs["worker"].status, StageStatus::Skip);
        assert_eq!(outputs["worker"].data["reason"], "noop");
        assert!(invoked.lock().is_empty(), "runner must never be invoked");

        let skipped = sink.payloads_of("stage.worker.skipped");
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0]["reason"], "noop");
    }

    #[tokio::test]
    async fn test_skip_status_also_propagates() {
        let skipper = Arc::new(FnStage::new("router", StageKind::Route, |_ctx: &StageContext| {
            Box::pin(async { Ok(StageOutput::skip("nothing_to_do")) })
        }));
        let graph = Pipeline::new()
            .with_stage(StageSpec::new("router", skipper, StageKind::Route))
            .with_stage(
                StageSpec::new("worker", fail_stage("worker", "must not run"), StageKind::Work)
                    .with_dependencies(["router"])
                    .conditional(),
            )
            .build()
            .unwrap();

        let (run, _sink) = collecting_run(snapshot_fixture());
        let outcome = graph.run(run).await.unwrap();
        assert_eq!(outcome.outputs()["worker"].status, StageStatus::Skip);
        assert_eq!(outcome.outputs()["worker"].data["reason"], "nothing_to_do");
    }

    #[tokio::test]
    async fn test_graceful_cancel_preserves_reason_and_partial_results() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = Pipeline::new()
            .with_stage(StageSpec::new("a", ok_stage("a", Arc::clone(&log)), StageKind::Work))
            .with_stage(
                StageSpec::new("b", cancel_stage("b", "no_speech"), StageKind::Guard)
                    .with_dependencies(["a"]),
            )
            .with_stage(
                StageSpec::new("c", ok_stage("c", Arc::clone(&log)), StageKind::Work)
                    .with_dependencies(["b"]),
            )
            .build()
            .unwrap();

        let (run, _sink) = collecting_run(snapshot_fixture());
        let outcome = graph.run(run).await.unwrap();
        let RunOutcome::Cancelled { stage, reason, partial } = outcome else {
            panic!("expected cancelled outcome");
        };

        assert_eq!(stage, "b");
        assert_eq!(reason, "no_speech");
        let mut names: Vec<&String> = partial.keys().collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        // c never started.
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_fail_cancels_in_flight_and_propagates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = Pipeline::new()
            .with_stage(StageSpec::new("bad", fail_stage("bad", "exploded"), StageKind::Work))
            .with_stage(StageSpec::new("slow", hanging_stage("slow"), StageKind::Work))
            .with_stage(
                StageSpec::new("after", ok_stage("after", Arc::clone(&log)), StageKind::Work)
                    .with_dependencies(["bad"]),
            )
            .build()
            .unwrap();

        let (run, sink) = collecting_run(snapshot_fixture());
        let err = graph.run(run).await.unwrap_err();
        let StageflowError::StageExecution { stage, message } = err else {
            panic!("expected stage execution error");
        };
        assert_eq!(stage, "bad");
        assert!(message.contains("exploded"));
        assert!(log.lock().is_empty());

        let failed = sink.payloads_of("stage.bad.failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["error"], "exploded");
        assert!(failed[0]["duration_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_ambient_cancel_marks_incomplete_stages() {
        let graph = Pipeline::new()
            .with_stage(StageSpec::new("slow", hanging_stage("slow"), StageKind::Work))
            .with_stage(
                StageSpec::new("after", fail_stage("after", "unreached"), StageKind::Work)
                    .with_dependencies(["slow"]),
            )
            .build()
            .unwrap();

        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let run = RunContext::new(snapshot_fixture()).with_cancel(cancel);
        let outcome = graph.run(run).await.unwrap();
        let RunOutcome::Interrupted(outputs) = outcome else {
            panic!("expected interrupted outcome");
        };

        assert_eq!(outputs.len(), 2);
        for output in outputs.values() {
            assert_eq!(output.status, StageStatus::Fail);
            assert_eq!(output.error.as_deref(), Some("Pipeline canceled"));
        }
    }

    #[tokio::test]
    async fn test_deadlock_guard_names_pending_set() {
        // Bypass build-time validation to inject an unsatisfiable graph,
        // the way a scheduler bug would manifest.
        let log = Arc::new(Mutex::new(Vec::new()));
        let specs = vec![
            StageSpec::new("a", ok_stage("a", Arc::clone(&log)), StageKind::Work)
                .with_dependencies(["b"]),
            StageSpec::new("b", ok_stage("b", Arc::clone(&log)), StageKind::Work)
                .with_dependencies(["a"]),
        ];
        let graph = StageGraph::from_specs(specs, Vec::new(), Duration::from_secs(30));

        let (run, _sink) = collecting_run(snapshot_fixture());
        let err = graph.run(run).await.unwrap_err();
        let StageflowError::Deadlock { pending } = err else {
            panic!("expected deadlock error");
        };
        assert_eq!(pending, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_started_events_carry_run_identifiers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let snapshot = snapshot_fixture();
        let run_id = snapshot.pipeline_run_id.unwrap();
        let graph = Pipeline::new()
            .with_stage(StageSpec::new("only", ok_stage("only", log), StageKind::Work))
            .build()
            .unwrap();

        let (run, sink) = collecting_run(snapshot);
        graph.run(run).await.unwrap();

        let started = sink.payloads_of("stage.only.started");
        assert_eq!(started[0]["stage"], "only");
        assert_eq!(started[0]["kind"], "work");
        assert_eq!(started[0]["pipeline_run_id"], run_id.to_string());

        let completed = sink.payloads_of("stage.only.completed");
        assert_eq!(completed[0]["status"], "ok");
        assert!(completed[0]["duration_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_duplicate_dependencies_collapse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = Pipeline::new()
            .with_stage(StageSpec::new("a", ok_stage("a", Arc::clone(&log)), StageKind::Work))
            .with_stage(
                StageSpec::new("b", ok_stage("b", Arc::clone(&log)), StageKind::Work)
                    .with_dependencies(["a", "a", "a"]),
            )
            .build()
            .unwrap();

        let (run, _sink) = collecting_run(snapshot_fixture());
        let outcome = graph.run(run).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }
}
