//! Prometheus metrics for the profiling agent

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};
use std::path::Path;

// ── Dispatch metrics ─────────────────────────────────────────────────────────

pub static DISPATCHES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "kdprof_dispatches_total",
        "Dispatches observed, by filter outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static SESSIONS_OPENED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "kdprof_sessions_opened_total",
        "Profiling sessions opened on the runtime"
    )
    .unwrap()
});

// ── Context metrics ──────────────────────────────────────────────────────────

pub static CONTEXTS_FINALIZED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "kdprof_contexts_finalized_total",
        "Contexts finalized, by path (handler or sweep)",
        &["path"]
    )
    .unwrap()
});

pub static COMPLETION_RETRIES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "kdprof_completion_retries_total",
        "Completion reports that arrived before the dispatch finished"
    )
    .unwrap()
});

pub static COMPLETIONS_ABSENT: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "kdprof_completions_absent_total",
        "Completion reports for contexts already finalized"
    )
    .unwrap()
});

pub static CONTEXTS_IN_FLIGHT: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "kdprof_contexts_in_flight",
        "Contexts registered and not yet finalized"
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Write the text exposition to `path`
pub fn write_metrics(path: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    let text = encode_metrics()?;
    std::fs::write(path, text).with_context(|| format!("Failed to write metrics to {}", path.display()))
}
