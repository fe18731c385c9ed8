//! Telemetry hooks for generation performance measurement.
//!
//! Provides:
//! - [`GenerationMetrics`]: time to first fragment, fragments/sec, totals
//! - [`TelemetryHook`] trait: callback interface for real-time reporting
//! - [`GenerationTimer`]: records timestamps and computes metrics
//! - [`NoopTelemetry`] / [`LogTelemetry`] / [`TracingTelemetry`]: built-in hooks

use std::sync::{Arc, Mutex};
use std::time::Instant;

use instruct_engine::BackendKind;

/// Aggregate metrics from one generation call.
#[derive(Debug, Clone)]
pub struct GenerationMetrics {
    /// Engine that served the call.
    pub backend: BackendKind,
    /// Time to first fragment in milliseconds (0 when nothing was produced).
    pub ttff_ms: f64,
    /// Fragments per second after the first one arrived.
    pub fragments_per_sec: f64,
    /// Number of turns sent to the engine.
    pub history_turns: usize,
    /// Number of fragments produced.
    pub fragments: usize,
    /// Total wall-clock time in milliseconds.
    pub total_time_ms: f64,
}

/// Callback trait for real-time generation telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called when the first fragment arrives.
    fn on_first_fragment(&self, _ttff_ms: f64) {}

    /// Called after each fragment.
    fn on_fragment(&self, _index: usize, _elapsed_ms: f64) {}

    /// Called when generation finishes, whatever the outcome.
    fn on_generation_complete(&self, _metrics: &GenerationMetrics) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Keeps the last report in memory.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<GenerationMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics of the last completed generation.
    pub fn last_metrics(&self) -> Option<GenerationMetrics> {
        self.last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_generation_complete(&self, metrics: &GenerationMetrics) {
        *self
            .last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(metrics.clone());
    }
}

/// Emits `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_first_fragment(&self, ttff_ms: f64) {
        tracing::debug!(ttff_ms, "first fragment");
    }

    fn on_generation_complete(&self, metrics: &GenerationMetrics) {
        tracing::info!(
            backend = %metrics.backend,
            fragments = metrics.fragments,
            ttff_ms = metrics.ttff_ms,
            fragments_per_sec = metrics.fragments_per_sec,
            total_time_ms = metrics.total_time_ms,
            "generation complete"
        );
    }
}

/// Records timestamps during generation to compute [`GenerationMetrics`].
///
/// Usage:
/// 1. Call [`GenerationTimer::new`] when the engine call starts
/// 2. Call [`GenerationTimer::mark_fragment`] after each fragment
/// 3. Call [`GenerationTimer::finish`] to compute final metrics
pub struct GenerationTimer {
    backend: BackendKind,
    history_turns: usize,
    start: Instant,
    first_fragment: Option<Instant>,
    fragments: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl GenerationTimer {
    pub fn new(backend: BackendKind, history_turns: usize, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            backend,
            history_turns,
            start: Instant::now(),
            first_fragment: None,
            fragments: 0,
            hook,
        }
    }

    /// Mark a fragment received. The first call also fires `on_first_fragment`.
    pub fn mark_fragment(&mut self) {
        let now = Instant::now();
        if self.first_fragment.is_none() {
            self.first_fragment = Some(now);
            self.hook
                .on_first_fragment(now.duration_since(self.start).as_secs_f64() * 1000.0);
        }
        self.fragments += 1;
        let elapsed_ms = now.duration_since(self.start).as_secs_f64() * 1000.0;
        self.hook.on_fragment(self.fragments, elapsed_ms);
    }

    /// Finalize and return metrics. Fires `on_generation_complete`.
    pub fn finish(self) -> GenerationMetrics {
        let total_time_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let ttff_ms = self
            .first_fragment
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let stream_time_ms = total_time_ms - ttff_ms;
        let fragments_per_sec = if stream_time_ms > 0.0 && self.fragments > 0 {
            self.fragments as f64 / (stream_time_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = GenerationMetrics {
            backend: self.backend,
            ttff_ms,
            fragments_per_sec,
            history_turns: self.history_turns,
            fragments: self.fragments,
            total_time_ms,
        };
        self.hook.on_generation_complete(&metrics);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_basic_flow() {
        let mut timer = GenerationTimer::new(BackendKind::Mock, 3, Arc::new(NoopTelemetry));
        timer.mark_fragment();
        timer.mark_fragment();
        timer.mark_fragment();

        let metrics = timer.finish();
        assert_eq!(metrics.backend, BackendKind::Mock);
        assert_eq!(metrics.history_turns, 3);
        assert_eq!(metrics.fragments, 3);
        assert!(metrics.ttff_ms >= 0.0);
        assert!(metrics.total_time_ms >= metrics.ttff_ms);
    }

    #[test]
    fn timer_fires_hooks() {
        let log = LogTelemetry::new();
        let mut timer = GenerationTimer::new(BackendKind::Hf, 2, Arc::new(log.clone()));
        timer.mark_fragment();
        timer.mark_fragment();
        timer.finish();

        let captured = log.last_metrics().unwrap();
        assert_eq!(captured.fragments, 2);
        assert_eq!(captured.backend, BackendKind::Hf);
    }

    #[test]
    fn timer_without_fragments() {
        let log = LogTelemetry::new();
        assert!(log.last_metrics().is_none());
        let metrics = GenerationTimer::new(BackendKind::Mock, 1, Arc::new(log.clone())).finish();
        assert_eq!(metrics.ttff_ms, 0.0);
        assert_eq!(metrics.fragments_per_sec, 0.0);
        assert!(log.last_metrics().is_some());
    }

    #[test]
    fn tracing_hook_runs_without_subscriber() {
        let hook = TracingTelemetry;
        hook.on_first_fragment(1.0);
        hook.on_fragment(1, 1.0);
        hook.on_generation_complete(&GenerationMetrics {
            backend: BackendKind::Vllm,
            ttff_ms: 1.0,
            fragments_per_sec: 10.0,
            history_turns: 2,
            fragments: 1,
            total_time_ms: 2.0,
        });
    }
}
