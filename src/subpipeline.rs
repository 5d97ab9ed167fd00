//! Subpipeline spawning: child runs that share identity with their parent
//! for correlation but execute under their own context and are
//! independently cancellable.
//!
//! Ownership in the tracker is strictly by run id; it never keeps stage or
//! context objects alive. Cancellation cascades depth-first, children
//! before parents, and is idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::context::ContextSnapshot;
use crate::error::{Result, StageflowError};
use crate::events::{get_event_sink, EventSink};
use crate::orchestrator::request_cancel;

#[derive(Debug, Default)]
struct TrackerState {
    children: HashMap<Uuid, HashSet<Uuid>>,
    parents: HashMap<Uuid, Uuid>,
    canceled: HashSet<Uuid>,
}

/// Tracks parent/child run relationships for cancellation propagation.
#[derive(Debug, Default)]
pub struct ChildRunTracker {
    state: Mutex<TrackerState>,
}

impl ChildRunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a child run under a parent.
    pub async fn register(&self, parent_id: Uuid, child_id: Uuid) {
        let mut state = self.state.lock().await;
        state.children.entry(parent_id).or_default().insert(child_id);
        state.parents.insert(child_id, parent_id);
    }

    /// Remove a child from its parent's set.
    pub async fn unregister(&self, parent_id: Uuid, child_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(children) = state.children.get_mut(&parent_id) {
            children.remove(&child_id);
            if children.is_empty() {
                state.children.remove(&parent_id);
            }
        }
        state.parents.remove(&child_id);
    }

    /// Direct children of a run.
    pub async fn children_of(&self, parent_id: Uuid) -> HashSet<Uuid> {
        self.state
            .lock()
            .await
            .children
            .get(&parent_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The parent of a run, if it is a child.
    pub async fn parent_of(&self, child_id: Uuid) -> Option<Uuid> {
        self.state.lock().await.parents.get(&child_id).copied()
    }

    /// All descendants of a run (children, grandchildren, ...).
    pub async fn descendants(&self, run_id: Uuid) -> HashSet<Uuid> {
        let state = self.state.lock().await;
        let mut found = HashSet::new();
        let mut stack = vec![run_id];
        while let Some(current) = stack.pop() {
            if let Some(children) = state.children.get(&current) {
                for child in children {
                    if found.insert(*child) {
                        stack.push(*child);
                    }
                }
            }
        }
        found
    }

    /// Nesting depth of a run, chasing parent links. A root run is depth 0.
    pub async fn depth_of(&self, run_id: Uuid) -> usize {
        let state = self.state.lock().await;
        let mut depth = 0;
        let mut current = run_id;
        while let Some(parent) = state.parents.get(&current) {
            depth += 1;
            current = *parent;
        }
        depth
    }

    /// Mark a run as canceled. Returns true iff it was not already marked.
    pub async fn mark_canceled(&self, run_id: Uuid) -> bool {
        self.state.lock().await.canceled.insert(run_id)
    }

    /// Whether a run has been marked canceled.
    pub async fn is_canceled(&self, run_id: Uuid) -> bool {
        self.state.lock().await.canceled.contains(&run_id)
    }

    /// Drop the run's links in both directions.
    pub async fn cleanup_run(&self, run_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(parent) = state.parents.remove(&run_id) {
            if let Some(children) = state.children.get_mut(&parent) {
                children.remove(&run_id);
                if children.is_empty() {
                    state.children.remove(&parent);
                }
            }
        }
        state.children.remove(&run_id);
    }

    /// Drop all tracked state. Test hook for the process-scoped instance.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.children.clear();
        state.parents.clear();
        state.canceled.clear();
    }
}

static GLOBAL_TRACKER: parking_lot::RwLock<Option<Arc<ChildRunTracker>>> =
    parking_lot::RwLock::new(None);

/// Process-scoped child-run tracker, created lazily.
pub fn global_child_tracker() -> Arc<ChildRunTracker> {
    if let Some(tracker) = GLOBAL_TRACKER.read().as_ref() {
        return Arc::clone(tracker);
    }
    let mut slot = GLOBAL_TRACKER.write();
    slot.get_or_insert_with(|| Arc::new(ChildRunTracker::new())).clone()
}

/// Replace the process-scoped tracker (tests).
pub fn set_global_child_tracker(tracker: Arc<ChildRunTracker>) {
    *GLOBAL_TRACKER.write() = Some(tracker);
}

/// Outcome of a subpipeline run.
#[derive(Debug, Clone)]
pub struct SubpipelineResult {
    pub success: bool,
    pub child_run_id: Uuid,
    pub data: Option<Map<String, Value>>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Spawns child pipeline runs: derives the child context, tracks the
/// parent/child link, emits spawn/completion events, and cascades
/// cancellation.
pub struct SubpipelineSpawner {
    tracker: Arc<ChildRunTracker>,
    sink: Option<Arc<dyn EventSink>>,
    max_depth: Option<usize>,
}

impl Default for SubpipelineSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl SubpipelineSpawner {
    pub fn new() -> Self {
        Self {
            tracker: global_child_tracker(),
            sink: None,
            max_depth: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<ChildRunTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Guard against runaway recursion: spawning at a depth beyond the
    /// limit fails with `MaxDepthExceeded`.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn tracker(&self) -> Arc<ChildRunTracker> {
        Arc::clone(&self.tracker)
    }

    fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone().unwrap_or_else(get_event_sink)
    }

    /// Spawn a child pipeline run.
    ///
    /// The child snapshot is derived from the parent (fresh run id, copied
    /// identity, optional topology/mode overrides) and handed to `runner`.
    /// The link is registered before the runner starts and the result --
    /// success or failure -- is reported as events; runner failures are
    /// captured in the [`SubpipelineResult`], not propagated.
    pub async fn spawn<F, Fut>(
        &self,
        pipeline_name: &str,
        parent: &ContextSnapshot,
        correlation_id: Uuid,
        parent_stage_id: &str,
        topology: Option<String>,
        execution_mode: Option<String>,
        runner: F,
    ) -> Result<SubpipelineResult>
    where
        F: FnOnce(ContextSnapshot) -> Fut,
        Fut: std::future::Future<Output = Result<Map<String, Value>>>,
    {
        let parent_run_id = parent.pipeline_run_id;

        if let (Some(max), Some(parent_id)) = (self.max_depth, parent_run_id) {
            let depth = self.tracker.depth_of(parent_id).await + 1;
            if depth > max {
                return Err(StageflowError::MaxDepthExceeded { depth, max });
            }
        }

        let child = parent.derive_child(correlation_id, parent_stage_id, topology, execution_mode);
        let child_run_id = child
            .pipeline_run_id
            .expect("derive_child always mints a run id");

        if let Some(parent_id) = parent_run_id {
            self.tracker.register(parent_id, child_run_id).await;

            let mut data = Map::new();
            data.insert("parent_run_id".into(), Value::String(parent_id.to_string()));
            data.insert("child_run_id".into(), Value::String(child_run_id.to_string()));
            data.insert("parent_stage_id".into(), Value::String(parent_stage_id.into()));
            data.insert("pipeline_name".into(), Value::String(pipeline_name.into()));
            data.insert("correlation_id".into(), Value::String(correlation_id.to_string()));
            self.sink().try_emit("pipeline.spawned_child", Some(data));
        }

        let started = Instant::now();
        let outcome = runner(child).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(data) => {
                if let Some(parent_id) = parent_run_id {
                    let mut payload = Map::new();
                    payload.insert("parent_run_id".into(), Value::String(parent_id.to_string()));
                    payload.insert("child_run_id".into(), Value::String(child_run_id.to_string()));
                    payload.insert("pipeline_name".into(), Value::String(pipeline_name.into()));
                    payload.insert("duration_ms".into(), Value::from(duration_ms));
                    self.sink().try_emit("pipeline.child_completed", Some(payload));
                }
                SubpipelineResult {
                    success: true,
                    child_run_id,
                    data: Some(data),
                    error: None,
                    duration_ms,
                }
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(
                    child_run_id = %child_run_id,
                    error = %message,
                    "child pipeline failed"
                );
                if let Some(parent_id) = parent_run_id {
                    let mut payload = Map::new();
                    payload.insert("parent_run_id".into(), Value::String(parent_id.to_string()));
                    payload.insert("child_run_id".into(), Value::String(child_run_id.to_string()));
                    payload.insert("pipeline_name".into(), Value::String(pipeline_name.into()));
                    payload.insert("error_message".into(), Value::String(message.clone()));
                    payload.insert("duration_ms".into(), Value::from(duration_ms));
                    self.sink().try_emit("pipeline.child_failed", Some(payload));
                }
                SubpipelineResult {
                    success: false,
                    child_run_id,
                    data: None,
                    error: Some(message),
                    duration_ms,
                }
            }
        };

        if let Some(parent_id) = parent_run_id {
            self.tracker.unregister(parent_id, child_run_id).await;
        }
        Ok(result)
    }

    /// Cancel a run and every descendant, depth-first (children before
    /// parents). Each newly-canceled run gets a `pipeline.canceled` event
    /// with its depth relative to the root, its cancel signal is fired, and
    /// its tracker links are removed. Idempotent: already-canceled runs
    /// emit nothing. Returns the newly canceled ids in emission order.
    pub async fn cancel_with_children(&self, run_id: Uuid, reason: &str) -> Vec<Uuid> {
        // Post-order walk so children come before parents.
        let mut order: Vec<(Uuid, usize)> = Vec::new();
        let mut stack: Vec<(Uuid, usize, bool)> = vec![(run_id, 0, false)];
        while let Some((id, depth, processed)) = stack.pop() {
            if processed {
                order.push((id, depth));
                continue;
            }
            stack.push((id, depth, true));
            for child in self.tracker.children_of(id).await {
                stack.push((child, depth + 1, false));
            }
        }

        let mut canceled = Vec::new();
        for (id, depth) in order {
            if !self.tracker.mark_canceled(id).await {
                continue;
            }
            let parent = self.tracker.parent_of(id).await;
            request_cancel(id);
            self.tracker.cleanup_run(id).await;

            let mut data = Map::new();
            data.insert("pipeline_run_id".into(), Value::String(id.to_string()));
            data.insert(
                "parent_run_id".into(),
                parent.map(|p| Value::String(p.to_string())).unwrap_or(Value::Null),
            );
            data.insert("reason".into(), Value::String(reason.into()));
            data.insert("cascade_depth".into(), Value::from(depth));
            self.sink().try_emit("pipeline.canceled", Some(data));
            canceled.push(id);
        }
        canceled
    }

    /// Whether a run was canceled through this spawner's tracker.
    pub async fn is_canceled(&self, run_id: Uuid) -> bool {
        self.tracker.is_canceled(run_id).await
    }
}
