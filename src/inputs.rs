//! Per-stage immutable inputs and injected capabilities.
//!
//! [`StageInputs`] is the view the scheduler synthesizes before each stage
//! invocation: the run's snapshot plus the outputs of declared dependencies
//! only. It replaces any shared mutable scratchpad; a stage can never
//! observe an output it did not declare a dependency on.
//!
//! [`StagePorts`] bundles the capabilities the host injects for a run
//! (streaming callbacks, opaque provider handles, the provider-call
//! logger). The core never interprets the handles.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::ContextSnapshot;
use crate::provider::ProviderCallLogger;
use crate::stage::StageOutput;

/// A boxed, pinned, Send future -- the return type of port callbacks.
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback for status updates: `(stage, state, data)`.
pub type SendStatus =
    Arc<dyn Fn(String, String, Option<Map<String, Value>>) -> BoxFut<'static, ()> + Send + Sync>;

/// Callback for streamed tokens.
pub type SendToken = Arc<dyn Fn(String) -> BoxFut<'static, ()> + Send + Sync>;

/// Callback for streamed audio chunks: `(bytes, format, sequence, last)`.
pub type SendAudioChunk =
    Arc<dyn Fn(Vec<u8>, String, u32, bool) -> BoxFut<'static, ()> + Send + Sync>;

/// Immutable view of prior stage outputs available to one stage invocation.
#[derive(Clone)]
pub struct StageInputs {
    snapshot: Arc<ContextSnapshot>,
    prior_outputs: BTreeMap<String, StageOutput>,
    ports: Arc<StagePorts>,
}

impl StageInputs {
    /// Build inputs from a snapshot, the declared dependencies' outputs,
    /// and the run's ports.
    pub fn new(
        snapshot: Arc<ContextSnapshot>,
        prior_outputs: BTreeMap<String, StageOutput>,
        ports: Arc<StagePorts>,
    ) -> Self {
        Self {
            snapshot,
            prior_outputs,
            ports,
        }
    }

    /// The run's immutable snapshot.
    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    /// Outputs of declared dependencies, keyed by stage name.
    pub fn prior_outputs(&self) -> &BTreeMap<String, StageOutput> {
        &self.prior_outputs
    }

    /// Injected capabilities for this run.
    pub fn ports(&self) -> &StagePorts {
        &self.ports
    }

    /// Shared handle to the ports bundle.
    pub fn ports_arc(&self) -> Arc<StagePorts> {
        Arc::clone(&self.ports)
    }

    /// Search every dependency's output data for a key, in sorted
    /// dependency-name order, returning the first match.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.prior_outputs
            .values()
            .find_map(|output| output.data.get(key))
    }

    /// Get a value from a specific dependency's output data. Preferred over
    /// [`get`](Self::get) because it names the dependency explicitly.
    pub fn get_from(&self, stage_name: &str, key: &str) -> Option<&Value> {
        self.prior_outputs
            .get(stage_name)
            .and_then(|output| output.data.get(key))
    }

    /// Whether a dependency has produced output.
    pub fn has_output(&self, stage_name: &str) -> bool {
        self.prior_outputs.contains_key(stage_name)
    }

    /// A dependency's complete output.
    pub fn output(&self, stage_name: &str) -> Option<&StageOutput> {
        self.prior_outputs.get(stage_name)
    }
}

impl std::fmt::Debug for StageInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageInputs")
            .field("dependencies", &self.prior_outputs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Injected capabilities for stages: streaming callbacks and opaque
/// provider handles. Immutable once built; shared by every stage of a run.
#[derive(Default, Clone)]
pub struct StagePorts {
    /// Callback for status updates `(stage, state, data)`.
    pub send_status: Option<SendStatus>,
    /// Callback for streamed LLM tokens.
    pub send_token: Option<SendToken>,
    /// Callback for streamed TTS audio chunks.
    pub send_audio_chunk: Option<SendAudioChunk>,

    /// Opaque provider handles; stage implementations downcast.
    pub llm_provider: Option<Arc<dyn Any + Send + Sync>>,
    pub stt_provider: Option<Arc<dyn Any + Send + Sync>>,
    pub tts_provider: Option<Arc<dyn Any + Send + Sync>>,

    /// Logger wrapping external provider calls (timeout, breaker, records).
    pub call_logger: Option<Arc<ProviderCallLogger>>,

    /// Open-ended extras for application-specific wiring.
    pub extras: Map<String, Value>,
}

impl StagePorts {
    /// Create a new builder.
    pub fn builder() -> StagePortsBuilder {
        StagePortsBuilder::default()
    }

    /// Send a status update if the callback is wired.
    pub async fn status(&self, stage: &str, state: &str, data: Option<Map<String, Value>>) {
        if let Some(ref send) = self.send_status {
            send(stage.to_string(), state.to_string(), data).await;
        }
    }

    /// Send a token if the callback is wired.
    pub async fn token(&self, token: impl Into<String>) {
        if let Some(ref send) = self.send_token {
            send(token.into()).await;
        }
    }
}

impl std::fmt::Debug for StagePorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagePorts")
            .field("has_send_status", &self.send_status.is_some())
            .field("has_send_token", &self.send_token.is_some())
            .field("has_send_audio_chunk", &self.send_audio_chunk.is_some())
            .field("has_llm_provider", &self.llm_provider.is_some())
            .field("has_stt_provider", &self.stt_provider.is_some())
            .field("has_tts_provider", &self.tts_provider.is_some())
            .field("has_call_logger", &self.call_logger.is_some())
            .field("extras_count", &self.extras.len())
            .finish()
    }
}

/// Builder for [`StagePorts`].
#[derive(Default)]
pub struct StagePortsBuilder {
    ports: StagePorts,
}

impl StagePortsBuilder {
    pub fn send_status(mut self, f: SendStatus) -> Self {
        self.ports.send_status = Some(f);
        self
    }

    pub fn send_token(mut self, f: SendToken) -> Self {
        self.ports.send_token = Some(f);
        self
    }

    pub fn send_audio_chunk(mut self, f: SendAudioChunk) -> Self {
        self.ports.send_audio_chunk = Some(f);
        self
    }

    pub fn llm_provider(mut self, provider: Arc<dyn Any + Send + Sync>) -> Self {
        self.ports.llm_provider = Some(provider);
        self
    }

    pub fn stt_provider(mut self, provider: Arc<dyn Any + Send + Sync>) -> Self {
        self.ports.stt_provider = Some(provider);
        self
    }

    pub fn tts_provider(mut self, provider: Arc<dyn Any + Send + Sync>) -> Self {
        self.ports.tts_provider = Some(provider);
        self
    }

    pub fn call_logger(mut self, logger: Arc<ProviderCallLogger>) -> Self {
        self.ports.call_logger = Some(logger);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.ports.extras.insert(key.into(), value);
        self
    }

    pub fn build(self) -> StagePorts {
        self.ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot() -> Arc<ContextSnapshot> {
        Arc::new(ContextSnapshot::builder().build())
    }

    fn inputs_with(outputs: BTreeMap<String, StageOutput>) -> StageInputs {
        StageInputs::new(snapshot(), outputs, Arc::new(StagePorts::default()))
    }

    #[test]
    fn test_get_from_declared_dependency() {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "stt".to_string(),
            StageOutput::ok_empty().with_data("transcript", json!("hello")),
        );
        let inputs = inputs_with(outputs);

        assert_eq!(inputs.get_from("stt", "transcript"), Some(&json!("hello")));
        assert_eq!(inputs.get("transcript"), Some(&json!("hello")));
        assert!(inputs.has_output("stt"));
        assert!(inputs.output("stt").is_some());
    }

    #[test]
    fn test_missing_dependency_yields_none() {
        let inputs = inputs_with(BTreeMap::new());
        assert!(inputs.get("anything").is_none());
        assert!(inputs.get_from("nope", "anything").is_none());
        assert!(!inputs.has_output("nope"));
    }

    #[test]
    fn test_get_searches_sorted_name_order() {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "b_stage".to_string(),
            StageOutput::ok_empty().with_data("k", json!("from_b")),
        );
        outputs.insert(
            "a_stage".to_string(),
            StageOutput::ok_empty().with_data("k", json!("from_a")),
        );
        let inputs = inputs_with(outputs);
        assert_eq!(inputs.get("k"), Some(&json!("from_a")));
    }

    #[tokio::test]
    async fn test_ports_status_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let ports = StagePorts::builder()
            .send_status(Arc::new(move |_stage, _state, _data| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .build();

        ports.status("stt", "started", None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ports_without_callbacks_are_noops() {
        let ports = StagePorts::default();
        ports.status("a", "b", None).await;
        ports.token("tok").await;
    }
}
