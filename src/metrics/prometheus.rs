//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by hint_forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all hint_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks dispatched, labeled by task type and outcome.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task handling duration in seconds, labeled by task type.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Tasks republished after a failure, labeled by task type.
pub static TASK_RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Requests that became ready for hint generation.
pub static READINESS_TRANSITIONS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// LLM API request latency in seconds, labeled by model.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Calling it
/// again is harmless: the first set of metrics stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("hint_forge_tasks_total", "Total number of tasks dispatched"),
        &["task_type", "outcome"],
    )?;

    let task_duration = HistogramVec::new(
        HistogramOpts::new(
            "hint_forge_task_duration_seconds",
            "Task handling duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 600.0]),
        &["task_type"],
    )?;

    let task_retries_total = CounterVec::new(
        Opts::new(
            "hint_forge_task_retries_total",
            "Tasks republished after a failure",
        ),
        &["task_type"],
    )?;

    let readiness_transitions_total = Counter::new(
        "hint_forge_readiness_transitions_total",
        "Requests that became ready for hint generation",
    )?;

    // LLM metrics
    let llm_latency = HistogramVec::new(
        HistogramOpts::new(
            "hint_forge_llm_latency_seconds",
            "LLM API request latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["model"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new("hint_forge_active_workers", "Number of active workers")?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(task_retries_total.clone()))?;
    registry.register(Box::new(readiness_transitions_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = TASK_RETRIES_TOTAL.set(task_retries_total);
    let _ = READINESS_TRANSITIONS_TOTAL.set(readiness_transitions_total);
    let _ = LLM_LATENCY.set(llm_latency);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// text is a single comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = READINESS_TRANSITIONS_TOTAL.get() {
            counter.inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("hint_forge_readiness_transitions_total"));
    }
}
