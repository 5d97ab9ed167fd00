//! Provider-call logging: timeout enforcement, circuit-breaker gating, and
//! call records around external I/O.
//!
//! [`ProviderCallLogger`] wraps a one-shot call future or a streamed
//! response. Every wrapped call produces a [`ProviderCall`] record (latency,
//! usage, success/error), reports the outcome to the circuit breaker, and
//! emits `provider.call.*` events. Streamed calls additionally measure TTFT
//! (time to first token) and emit `provider.call.ttft` when the first
//! element arrives. Errors are annotated with the provider-call id so
//! failure summaries can link back to the record.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::time::Sleep;
use uuid::Uuid;

use crate::breaker::{BreakerKey, CircuitBreaker};
use crate::context::ContextSnapshot;
use crate::error::{Result, StageflowError};
use crate::events::{get_event_sink, EventSink};

/// Record of one external provider call.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub id: Uuid,
    pub pipeline_run_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub operation: String,
    pub provider: String,
    pub model_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub latency_ms: Option<u64>,
    pub ttft_ms: Option<u64>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub audio_duration_ms: Option<u64>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub timed_out: bool,
}

/// Usage numbers a call can attach to its record.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallUsage {
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub audio_duration_ms: Option<u64>,
}

/// Seam for persisting finished [`ProviderCall`] records. The core only
/// calls this interface; storage lives outside.
#[async_trait]
pub trait CallRecorder: Send + Sync {
    async fn record(&self, call: ProviderCall);
}

/// Recorder that buffers records in memory (tests, diagnostics).
#[derive(Debug, Default)]
pub struct InMemoryCallRecorder {
    calls: Mutex<Vec<ProviderCall>>,
}

impl InMemoryCallRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CallRecorder for InMemoryCallRecorder {
    async fn record(&self, call: ProviderCall) {
        self.calls.lock().push(call);
    }
}

/// Identity fields stamped onto records and events.
#[derive(Debug, Clone, Copy, Default)]
struct CallIdentity {
    pipeline_run_id: Option<Uuid>,
    request_id: Option<Uuid>,
    session_id: Option<Uuid>,
    user_id: Option<Uuid>,
    org_id: Option<Uuid>,
}

/// Wraps external provider calls with timeout, breaker gating, call
/// records, and `provider.call.*` events.
pub struct ProviderCallLogger {
    breaker: Arc<CircuitBreaker>,
    sink: Option<Arc<dyn EventSink>>,
    recorder: Option<Arc<dyn CallRecorder>>,
    identity: CallIdentity,
}

impl ProviderCallLogger {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            sink: None,
            recorder: None,
            identity: CallIdentity::default(),
        }
    }

    /// Route events to a specific sink instead of the process-scoped one.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Persist finished records through the given recorder.
    pub fn with_recorder(mut self, recorder: Arc<dyn CallRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Stamp records and events with a run's identity.
    pub fn with_identity(mut self, snapshot: &ContextSnapshot) -> Self {
        self.identity = CallIdentity {
            pipeline_run_id: snapshot.pipeline_run_id,
            request_id: snapshot.request_id,
            session_id: snapshot.session_id,
            user_id: snapshot.user_id,
            org_id: snapshot.org_id,
        };
        self
    }

    fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone().unwrap_or_else(get_event_sink)
    }

    fn new_call(&self, operation: &str, provider: &str, model_id: &Option<String>) -> ProviderCall {
        ProviderCall {
            id: Uuid::new_v4(),
            pipeline_run_id: self.identity.pipeline_run_id,
            request_id: self.identity.request_id,
            session_id: self.identity.session_id,
            user_id: self.identity.user_id,
            org_id: self.identity.org_id,
            operation: operation.to_string(),
            provider: provider.to_string(),
            model_id: model_id.clone(),
            started_at: Utc::now(),
            latency_ms: None,
            ttft_ms: None,
            tokens_in: None,
            tokens_out: None,
            audio_duration_ms: None,
            success: None,
            error: None,
            timed_out: false,
        }
    }

    fn event_payload(call: &ProviderCall) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("operation".into(), Value::String(call.operation.clone()));
        data.insert("provider".into(), Value::String(call.provider.clone()));
        data.insert(
            "model_id".into(),
            call.model_id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        data.insert("provider_call_id".into(), Value::String(call.id.to_string()));
        if let Some(run_id) = call.pipeline_run_id {
            data.insert("pipeline_run_id".into(), Value::String(run_id.to_string()));
        }
        data
    }

    /// Check the breaker; on denial emit `<operation>.breaker.denied` and
    /// return the denial error.
    async fn gate(&self, key: &BreakerKey) -> Result<()> {
        if self.breaker.is_open(key).await {
            let mut data = Map::new();
            data.insert("operation".into(), Value::String(key.operation.clone()));
            data.insert("provider".into(), Value::String(key.provider.clone()));
            data.insert(
                "model_id".into(),
                key.model_id.clone().map(Value::String).unwrap_or(Value::Null),
            );
            data.insert("reason".into(), Value::String("circuit_open".into()));
            self.sink()
                .try_emit(&format!("{}.breaker.denied", key.operation), Some(data));
            tracing::warn!(
                operation = %key.operation,
                provider = %key.provider,
                "provider call denied by circuit breaker"
            );
            return Err(StageflowError::CircuitOpen {
                operation: key.operation.clone(),
                provider: key.provider.clone(),
                model_id: key.model_id.clone(),
            });
        }
        Ok(())
    }

    fn finalize(&self, call: ProviderCall, key: &BreakerKey) {
        let succeeded = call.success == Some(true);
        let mut data = Self::event_payload(&call);
        data.insert("latency_ms".into(), call.latency_ms.map(Value::from).unwrap_or(Value::Null));
        data.insert("success".into(), Value::Bool(succeeded));
        data.insert(
            "error".into(),
            call.error.clone().map(Value::String).unwrap_or(Value::Null),
        );
        data.insert("timeout".into(), Value::Bool(call.timed_out));
        let event = if succeeded {
            "provider.call.succeeded"
        } else {
            "provider.call.failed"
        };
        self.sink().try_emit(event, Some(data));

        let breaker = Arc::clone(&self.breaker);
        let recorder = self.recorder.clone();
        let breaker_key = key.clone();
        let failure_reason = call.error.clone();
        tokio::spawn(async move {
            if succeeded {
                breaker.record_success(&breaker_key).await;
            } else {
                let reason = failure_reason.as_deref().unwrap_or("provider_call_failed");
                breaker.record_failure(&breaker_key, reason).await;
            }
            if let Some(recorder) = recorder {
                recorder.record(call).await;
            }
        });
    }

    /// Execute a one-shot provider call under the given wall-clock budget.
    pub async fn call<T, F>(
        &self,
        operation: &str,
        provider: &str,
        model_id: Option<String>,
        timeout: Duration,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.call_with_usage(operation, provider, model_id, timeout, fut, |_| CallUsage::default())
            .await
    }

    /// Execute a one-shot provider call, extracting usage numbers from the
    /// successful result for the call record.
    pub async fn call_with_usage<T, F>(
        &self,
        operation: &str,
        provider: &str,
        model_id: Option<String>,
        timeout: Duration,
        fut: F,
        usage: impl FnOnce(&T) -> CallUsage,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let key = BreakerKey::new(operation, provider, model_id.clone());
        self.gate(&key).await?;

        let mut call = self.new_call(operation, provider, &model_id);
        let call_id = call.id;
        self.breaker.note_attempt(&key).await;
        self.sink()
            .try_emit("provider.call.started", Some(Self::event_payload(&call)));

        let started = Instant::now();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => {
                let u = usage(&value);
                call.latency_ms = Some(started.elapsed().as_millis() as u64);
                call.tokens_in = u.tokens_in;
                call.tokens_out = u.tokens_out;
                call.audio_duration_ms = u.audio_duration_ms;
                call.success = Some(true);
                self.finalize(call, &key);
                Ok(value)
            }
            Ok(Err(err)) => {
                call.latency_ms = Some(started.elapsed().as_millis() as u64);
                call.success = Some(false);
                call.error = Some(err.to_string());
                self.finalize(call, &key);
                Err(StageflowError::ProviderCallFailed {
                    call_id,
                    message: err.to_string(),
                })
            }
            Err(_) => {
                call.latency_ms = Some(started.elapsed().as_millis() as u64);
                call.success = Some(false);
                call.timed_out = true;
                call.error = Some(format!("timed out after {timeout:?}"));
                self.finalize(call, &key);
                Err(StageflowError::ProviderCallFailed {
                    call_id,
                    message: format!("timed out after {timeout:?}"),
                })
            }
        }
    }

    /// Wrap a streamed provider response.
    ///
    /// The returned stream forwards every element of `stream`, records TTFT
    /// when the first element arrives (emitting `provider.call.ttft`), fails
    /// the call if no element arrives within `ttft_timeout`, and finalizes
    /// the record when the stream ends or errors. The inner stream is
    /// dropped on timeout or error.
    pub async fn stream<S, T>(
        &self,
        operation: &str,
        provider: &str,
        model_id: Option<String>,
        ttft_timeout: Duration,
        stream: S,
    ) -> Result<MonitoredStream<S>>
    where
        S: Stream<Item = Result<T>> + Unpin,
    {
        let key = BreakerKey::new(operation, provider, model_id.clone());
        self.gate(&key).await?;

        let call = self.new_call(operation, provider, &model_id);
        self.breaker.note_attempt(&key).await;
        self.sink()
            .try_emit("provider.call.started", Some(Self::event_payload(&call)));

        Ok(MonitoredStream {
            inner: Some(stream),
            shared: StreamShared {
                breaker: Arc::clone(&self.breaker),
                key,
                sink: self.sink(),
                recorder: self.recorder.clone(),
                call: Some(call),
            },
            ttft_deadline: Box::pin(tokio::time::sleep(ttft_timeout)),
            ttft_timeout,
            started: Instant::now(),
            first_seen: false,
        })
    }
}

struct StreamShared {
    breaker: Arc<CircuitBreaker>,
    key: BreakerKey,
    sink: Arc<dyn EventSink>,
    recorder: Option<Arc<dyn CallRecorder>>,
    call: Option<ProviderCall>,
}

impl StreamShared {
    fn finalize(&mut self, latency_ms: u64, error: Option<String>, timed_out: bool) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        call.latency_ms = Some(latency_ms);
        call.timed_out = timed_out;
        call.success = Some(error.is_none());
        call.error = error;

        let succeeded = call.success == Some(true);
        let mut data = ProviderCallLogger::event_payload(&call);
        data.insert("latency_ms".into(), Value::from(latency_ms));
        data.insert("ttft_ms".into(), call.ttft_ms.map(Value::from).unwrap_or(Value::Null));
        data.insert("success".into(), Value::Bool(succeeded));
        data.insert(
            "error".into(),
            call.error.clone().map(Value::String).unwrap_or(Value::Null),
        );
        data.insert("timeout".into(), Value::Bool(timed_out));
        let event = if succeeded {
            "provider.call.succeeded"
        } else {
            "provider.call.failed"
        };
        self.sink.try_emit(event, Some(data));

        let breaker = Arc::clone(&self.breaker);
        let key = self.key.clone();
        let recorder = self.recorder.clone();
        let failure_reason = call.error.clone();
        tokio::spawn(async move {
            if succeeded {
                breaker.record_success(&key).await;
            } else {
                let reason = failure_reason.as_deref().unwrap_or("provider_stream_failed");
                breaker.record_failure(&key, reason).await;
            }
            if let Some(recorder) = recorder {
                recorder.record(call).await;
            }
        });
    }
}

/// Stream wrapper produced by [`ProviderCallLogger::stream`].
pub struct MonitoredStream<S> {
    inner: Option<S>,
    shared: StreamShared,
    ttft_deadline: Pin<Box<Sleep>>,
    ttft_timeout: Duration,
    started: Instant,
    first_seen: bool,
}

impl<S> MonitoredStream<S> {
    /// The provider-call id for this stream, if it has not yet finalized.
    pub fn call_id(&self) -> Option<Uuid> {
        self.shared.call.as_ref().map(|c| c.id)
    }
}

impl<S, T> Stream for MonitoredStream<S>
where
    S: Stream<Item = Result<T>> + Unpin,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        if !this.first_seen {
            if this.ttft_deadline.as_mut().poll(cx).is_ready() {
                let latency = this.started.elapsed().as_millis() as u64;
                let message = format!("no first element within {:?}", this.ttft_timeout);
                let call_id = this.shared.call.as_ref().map(|c| c.id).unwrap_or_default();
                this.shared.finalize(latency, Some(message.clone()), true);
                this.inner = None;
                return Poll::Ready(Some(Err(StageflowError::ProviderCallFailed {
                    call_id,
                    message,
                })));
            }
        }

        match Pin::new(inner).poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => {
                if !this.first_seen {
                    this.first_seen = true;
                    let ttft_ms = this.started.elapsed().as_millis() as u64;
                    if let Some(call) = this.shared.call.as_mut() {
                        call.ttft_ms = Some(ttft_ms);
                        let mut data = ProviderCallLogger::event_payload(call);
                        data.insert("ttft_ms".into(), Value::from(ttft_ms));
                        this.shared.sink.try_emit("provider.call.ttft", Some(data));
                    }
                }
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(Err(err))) => {
                let latency = this.started.elapsed().as_millis() as u64;
                let call_id = this.shared.call.as_ref().map(|c| c.id).unwrap_or_default();
                let message = err.to_string();
                this.shared.finalize(latency, Some(message.clone()), false);
                this.inner = None;
                Poll::Ready(Some(Err(StageflowError::ProviderCallFailed {
                    call_id,
                    message,
                })))
            }
            Poll::Ready(None) => {
                let latency = this.started.elapsed().as_millis() as u64;
                this.shared.finalize(latency, None, false);
                this.inner = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
