//! Engine configuration knobs.
//!
//! Plain structs with sensible defaults. Pass a [`StageflowConfig`] into the
//! orchestrator (or construct components directly with a [`BreakerConfig`])
//! to override.

use std::time::Duration;

/// Circuit breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// When true, `is_open` always reports closed. State is still tracked
    /// and transition events still emitted.
    pub observe_only: bool,

    /// Number of failures inside the sliding window that opens the circuit.
    pub failure_threshold: usize,

    /// Sliding window over which failures are counted.
    pub failure_window: Duration,

    /// How long an open circuit stays open before probing (half-open).
    pub open_duration: Duration,

    /// Consecutive half-open successes required to close the circuit.
    pub half_open_probe_count: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            observe_only: false,
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            half_open_probe_count: 3,
        }
    }
}

impl BreakerConfig {
    /// Enable or disable observe-only mode.
    pub fn with_observe_only(mut self, observe_only: bool) -> Self {
        self.observe_only = observe_only;
        self
    }

    /// Set the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the failure sliding window.
    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    /// Set the open duration.
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Set the half-open probe count.
    pub fn with_half_open_probe_count(mut self, count: u32) -> Self {
        self.half_open_probe_count = count;
        self
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct StageflowConfig {
    /// Circuit breaker parameters shared by the breaker interceptor and the
    /// provider-call logger.
    pub breaker: BreakerConfig,

    /// Wall-clock budget applied to a stage when its spec carries no
    /// per-stage override.
    pub default_stage_timeout: Duration,
}

impl Default for StageflowConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            default_stage_timeout: Duration::from_secs(30),
        }
    }
}

impl StageflowConfig {
    /// Set the breaker configuration.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set the default per-stage timeout.
    pub fn with_default_stage_timeout(mut self, timeout: Duration) -> Self {
        self.default_stage_timeout = timeout;
        self
    }
}
