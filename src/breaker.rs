//! Circuit breaker for external provider calls.
//!
//! One breaker instance tracks independent state per
//! `(operation, provider, model_id)` key: closed until enough failures land
//! inside a sliding window, open for a cooldown, then half-open while a
//! handful of probe calls decide whether to close again. In observe-only
//! mode the breaker keeps full state and emits transition events but never
//! actually denies a call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config::BreakerConfig;
use crate::events::{get_event_sink, EventSink};

/// Breaker state index: `model_id` may be absent, and an absent model is a
/// distinct key from any concrete one. Compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub operation: String,
    pub provider: String,
    pub model_id: Option<String>,
}

impl BreakerKey {
    pub fn new(
        operation: impl Into<String>,
        provider: impl Into<String>,
        model_id: Option<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            provider: provider.into(),
            model_id,
        }
    }
}

/// Position in the breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    failures: VecDeque<Instant>,
    half_open_successes: u32,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            failures: VecDeque::new(),
            half_open_successes: 0,
        }
    }
}

/// Per-key circuit breaker.
///
/// All mutations are serialized by a single async lock over the key map.
/// Lazily creates state on first use of a key; never evicts.
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: Mutex<HashMap<BreakerKey, BreakerState>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            sink: None,
        }
    }

    /// Route transition events to a specific sink instead of the
    /// process-scoped current sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn emit(&self, event_type: &str, data: Map<String, Value>) {
        match &self.sink {
            Some(sink) => sink.try_emit(event_type, Some(data)),
            None => get_event_sink().try_emit(event_type, Some(data)),
        }
    }

    fn transition_payload(
        key: &BreakerKey,
        previous: CircuitState,
        new: CircuitState,
        reason: &str,
    ) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("operation".into(), Value::String(key.operation.clone()));
        data.insert("provider".into(), Value::String(key.provider.clone()));
        data.insert(
            "model_id".into(),
            key.model_id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        data.insert("previous_state".into(), Value::String(previous.as_str().into()));
        data.insert("new_state".into(), Value::String(new.as_str().into()));
        data.insert("reason".into(), Value::String(reason.into()));
        data
    }

    /// Record that a call is about to be attempted. Creates state lazily
    /// and moves an expired open circuit to half-open. Has no effect on a
    /// closed breaker's decision.
    pub async fn note_attempt(&self, key: &BreakerKey) {
        let now = Instant::now();
        let mut event = None;
        {
            let mut states = self.states.lock().await;
            let state = states.entry(key.clone()).or_insert_with(BreakerState::new);

            if state.state == CircuitState::Open {
                if let Some(opened_at) = state.opened_at {
                    if now.duration_since(opened_at) >= self.config.open_duration {
                        let previous = state.state;
                        state.state = CircuitState::HalfOpen;
                        state.half_open_successes = 0;
                        event = Some(Self::transition_payload(
                            key,
                            previous,
                            CircuitState::HalfOpen,
                            "open_duration_elapsed",
                        ));
                    }
                }
            }
        }
        if let Some(data) = event {
            self.emit("circuit.half_opened", data);
        }
    }

    /// Record a successful call. Enough half-open successes close the
    /// circuit and clear the failure window.
    pub async fn record_success(&self, key: &BreakerKey) {
        let mut event = None;
        {
            let mut states = self.states.lock().await;
            let state = states.entry(key.clone()).or_insert_with(BreakerState::new);

            if state.state == CircuitState::HalfOpen {
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.half_open_probe_count {
                    let previous = state.state;
                    state.state = CircuitState::Closed;
                    state.opened_at = None;
                    state.failures.clear();
                    state.half_open_successes = 0;
                    event = Some(Self::transition_payload(
                        key,
                        previous,
                        CircuitState::Closed,
                        "half_open_probe_succeeded",
                    ));
                }
            }
        }
        if let Some(data) = event {
            self.emit("circuit.closed", data);
        }
    }

    /// Record a failed call. A half-open circuit re-opens immediately; a
    /// closed circuit opens once the windowed failure count reaches the
    /// threshold.
    pub async fn record_failure(&self, key: &BreakerKey, reason: &str) {
        let now = Instant::now();
        let mut event = None;
        {
            let mut states = self.states.lock().await;
            let state = states.entry(key.clone()).or_insert_with(BreakerState::new);

            if state.state == CircuitState::HalfOpen {
                let previous = state.state;
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.half_open_successes = 0;
                let reason = if reason.is_empty() { "half_open_probe_failed" } else { reason };
                event = Some(Self::transition_payload(key, previous, CircuitState::Open, reason));
            } else {
                // Prune the window, then count this failure against the
                // threshold.
                let cutoff = now.checked_sub(self.config.failure_window);
                while let (Some(front), Some(cutoff)) = (state.failures.front(), cutoff) {
                    if *front < cutoff {
                        state.failures.pop_front();
                    } else {
                        break;
                    }
                }
                state.failures.push_back(now);

                if state.state == CircuitState::Closed
                    && state.failures.len() >= self.config.failure_threshold
                {
                    let previous = state.state;
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    state.half_open_successes = 0;
                    let reason = if reason.is_empty() { "failure_threshold_exceeded" } else { reason };
                    let mut data =
                        Self::transition_payload(key, previous, CircuitState::Open, reason);
                    data.insert("failure_count".into(), Value::from(state.failures.len()));
                    data.insert(
                        "window_seconds".into(),
                        Value::from(self.config.failure_window.as_secs()),
                    );
                    event = Some(data);
                }
            }
        }
        if let Some(data) = event {
            self.emit("circuit.opened", data);
        }
    }

    /// Whether calls for this key should currently be denied.
    ///
    /// An open circuit whose cooldown has elapsed transitions to half-open
    /// and lets the probe call through. In observe-only mode this always
    /// returns false.
    pub async fn is_open(&self, key: &BreakerKey) -> bool {
        if self.config.observe_only {
            return false;
        }

        let mut event = None;
        let open = {
            let mut states = self.states.lock().await;
            match states.get_mut(key) {
                None => false,
                Some(state) if state.state != CircuitState::Open => false,
                Some(state) => {
                    let expired = state
                        .opened_at
                        .is_some_and(|opened_at| opened_at.elapsed() >= self.config.open_duration);
                    if expired {
                        let previous = state.state;
                        state.state = CircuitState::HalfOpen;
                        state.half_open_successes = 0;
                        event = Some(Self::transition_payload(
                            key,
                            previous,
                            CircuitState::HalfOpen,
                            "open_duration_elapsed",
                        ));
                        false
                    } else {
                        true
                    }
                }
            }
        };
        if let Some(data) = event {
            self.emit("circuit.half_opened", data);
        }
        open
    }

    /// Current state for a key, if any state has been created.
    pub async fn state_of(&self, key: &BreakerKey) -> Option<CircuitState> {
        self.states.lock().await.get(key).map(|s| s.state)
    }

    /// Drop all per-key state. Test hook for the process-scoped instance.
    pub async fn reset(&self) {
        self.states.lock().await.clear();
    }
}

static GLOBAL_BREAKER: parking_lot::RwLock<Option<Arc<CircuitBreaker>>> =
    parking_lot::RwLock::new(None);

/// Process-scoped breaker with default configuration, created lazily.
pub fn global_circuit_breaker() -> Arc<CircuitBreaker> {
    if let Some(breaker) = GLOBAL_BREAKER.read().as_ref() {
        return Arc::clone(breaker);
    }
    let mut slot = GLOBAL_BREAKER.write();
    slot.get_or_insert_with(|| Arc::new(CircuitBreaker::new(BreakerConfig::default())))
        .clone()
}

/// Replace the process-scoped breaker (tests, custom configuration).
pub fn set_global_circuit_breaker(breaker: Arc<CircuitBreaker>) {
    *GLOBAL_BREAKER.write() = Some(breaker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use std::time::Duration;

    fn key() -> BreakerKey {
        BreakerKey::new("llm.generate", "groq", Some("llama-3".into()))
    }

    fn fast_config() -> BreakerConfig {
        BreakerConfig::default()
            .with_failure_threshold(2)
            .with_open_duration(Duration::from_millis(30))
            .with_half_open_probe_count(2)
    }

    #[tokio::test]
    async fn test_closed_until_threshold() {
        let sink = Arc::new(CollectingEventSink::new());
        let breaker = CircuitBreaker::new(fast_config()).with_sink(sink.clone());

        breaker.record_failure(&key(), "boom").await;
        assert!(!breaker.is_open(&key()).await);
        assert_eq!(breaker.state_of(&key()).await, Some(CircuitState::Closed));
        assert_eq!(sink.count_of("circuit.opened"), 0);

        breaker.record_failure(&key(), "boom").await;
        assert!(breaker.is_open(&key()).await);
        assert_eq!(sink.count_of("circuit.opened"), 1);

        let payload = &sink.payloads_of("circuit.opened")[0];
        assert_eq!(payload["operation"], "llm.generate");
        assert_eq!(payload["previous_state"], "closed");
        assert_eq!(payload["new_state"], "open");
        assert_eq!(payload["failure_count"], 2);
    }

    #[tokio::test]
    async fn test_open_transitions_to_half_open_after_cooldown() {
        let sink = Arc::new(CollectingEventSink::new());
        let breaker = CircuitBreaker::new(fast_config()).with_sink(sink.clone());

        breaker.record_failure(&key(), "boom").await;
        breaker.record_failure(&key(), "boom").await;
        assert!(breaker.is_open(&key()).await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Cooldown elapsed: the probe call is allowed through.
        assert!(!breaker.is_open(&key()).await);
        assert_eq!(breaker.state_of(&key()).await, Some(CircuitState::HalfOpen));
        assert_eq!(sink.count_of("circuit.half_opened"), 1);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_probe_successes() {
        let sink = Arc::new(CollectingEventSink::new());
        let breaker = CircuitBreaker::new(fast_config()).with_sink(sink.clone());

        breaker.record_failure(&key(), "boom").await;
        breaker.record_failure(&key(), "boom").await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!breaker.is_open(&key()).await);

        breaker.record_success(&key()).await;
        assert_eq!(breaker.state_of(&key()).await, Some(CircuitState::HalfOpen));
        breaker.record_success(&key()).await;
        assert_eq!(breaker.state_of(&key()).await, Some(CircuitState::Closed));
        assert_eq!(sink.count_of("circuit.closed"), 1);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let sink = Arc::new(CollectingEventSink::new());
        let breaker = CircuitBreaker::new(fast_config()).with_sink(sink.clone());

        breaker.record_failure(&key(), "boom").await;
        breaker.record_failure(&key(), "boom").await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!breaker.is_open(&key()).await);

        breaker.record_failure(&key(), "probe failed").await;
        assert_eq!(breaker.state_of(&key()).await, Some(CircuitState::Open));
        assert_eq!(sink.count_of("circuit.opened"), 2);
    }

    #[tokio::test]
    async fn test_observe_only_never_denies() {
        let sink = Arc::new(CollectingEventSink::new());
        let breaker =
            CircuitBreaker::new(fast_config().with_observe_only(true)).with_sink(sink.clone());

        breaker.record_failure(&key(), "boom").await;
        breaker.record_failure(&key(), "boom").await;
        // State is tracked and the transition event emitted, but no denial.
        assert_eq!(breaker.state_of(&key()).await, Some(CircuitState::Open));
        assert_eq!(sink.count_of("circuit.opened"), 1);
        assert!(!breaker.is_open(&key()).await);
    }

    #[tokio::test]
    async fn test_note_attempt_no_effect_when_closed() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.note_attempt(&key()).await;
        assert_eq!(breaker.state_of(&key()).await, Some(CircuitState::Closed));
        assert!(!breaker.is_open(&key()).await);
        breaker.note_attempt(&key()).await;
        assert!(!breaker.is_open(&key()).await);
    }

    #[tokio::test]
    async fn test_null_model_is_distinct_key() {
        let breaker = CircuitBreaker::new(fast_config());
        let with_model = key();
        let without_model = BreakerKey::new("llm.generate", "groq", None);

        breaker.record_failure(&with_model, "boom").await;
        breaker.record_failure(&with_model, "boom").await;
        assert!(breaker.is_open(&with_model).await);
        assert!(!breaker.is_open(&without_model).await);
        assert_eq!(breaker.state_of(&without_model).await, None);
    }

    #[tokio::test]
    async fn test_window_pruning_forgets_old_failures() {
        let config = fast_config().with_failure_window(Duration::from_millis(20));
        let breaker = CircuitBreaker::new(config);

        breaker.record_failure(&key(), "boom").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        // First failure fell out of the window, so this is failure #1 again.
        breaker.record_failure(&key(), "boom").await;
        assert_eq!(breaker.state_of(&key()).await, Some(CircuitState::Closed));
    }
}
