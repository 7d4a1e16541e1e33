//! Observability collaborator.
//!
//! The orchestrator reports tick durations, per-engine call latency, and
//! event bus counters to an injected [`MetricsSink`]. The core never
//! exports metrics itself.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use epoch_events::BusStats;
use serde::Serialize;

/// Receives measurements from the tick loop.
///
/// Calls happen on the tick path, so implementations should return quickly.
pub trait MetricsSink: Send + Sync {
    /// A tick finished after `duration` of wall-clock time.
    fn record_tick(&self, tick: u64, duration: Duration);

    /// One engine call finished. `ok` is false for failures and timeouts.
    fn record_engine_call(&self, engine: &str, latency: Duration, ok: bool);

    /// Current event bus counters and queue depth.
    fn record_bus(&self, stats: &BusStats);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_tick(&self, _tick: u64, _duration: Duration) {}

    fn record_engine_call(&self, _engine: &str, _latency: Duration, _ok: bool) {}

    fn record_bus(&self, _stats: &BusStats) {}
}

/// Keeps aggregates in memory for inspection.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<MetricsSummary>,
}

/// Aggregated measurements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    /// Ticks recorded.
    pub ticks: u64,
    /// Last tick recorded.
    pub last_tick: Option<u64>,
    /// Sum of tick durations.
    pub total_tick_time: Duration,
    /// Longest tick.
    pub max_tick_time: Duration,
    /// Per-engine call aggregates.
    pub engines: BTreeMap<String, EngineCallStats>,
    /// Most recent bus counters.
    pub bus: Option<BusStats>,
}

/// Call aggregates for one engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineCallStats {
    /// Calls recorded.
    pub calls: u64,
    /// Calls that failed or timed out.
    pub failures: u64,
    /// Sum of call latencies.
    pub total_latency: Duration,
    /// Slowest call.
    pub max_latency: Duration,
}

impl EngineCallStats {
    /// Mean call latency.
    pub fn mean_latency(&self) -> Duration {
        mean(self.total_latency, self.calls)
    }
}

impl MetricsSummary {
    /// Mean tick duration.
    pub fn mean_tick_time(&self) -> Duration {
        mean(self.total_tick_time, self.ticks)
    }
}

fn mean(total: Duration, count: u64) -> Duration {
    u32::try_from(count)
        .ok()
        .and_then(|count| total.checked_div(count))
        .unwrap_or_default()
}

impl InMemoryMetrics {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn summary(&self) -> MetricsSummary {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_tick(&self, tick: u64, duration: Duration) {
        let mut summary = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        summary.ticks = summary.ticks.saturating_add(1);
        summary.last_tick = Some(tick);
        summary.total_tick_time = summary.total_tick_time.saturating_add(duration);
        summary.max_tick_time = summary.max_tick_time.max(duration);
    }

    fn record_engine_call(&self, engine: &str, latency: Duration, ok: bool) {
        let mut summary = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = summary.engines.entry(engine.to_owned()).or_default();
        stats.calls = stats.calls.saturating_add(1);
        if !ok {
            stats.failures = stats.failures.saturating_add(1);
        }
        stats.total_latency = stats.total_latency.saturating_add(latency);
        stats.max_latency = stats.max_latency.max(latency);
    }

    fn record_bus(&self, stats: &BusStats) {
        let mut summary = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        summary.bus = Some(*stats);
    }
}
