//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, LLM_LATENCY, READINESS_TRANSITIONS_TOTAL, TASKS_TOTAL, TASK_DURATION,
    TASK_RETRIES_TOTAL,
};

/// Metrics collector for recording pipeline metrics.
///
/// # Example
///
/// ```ignore
/// use hint_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_task("generate_hint", "succeeded", Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one dispatched task.
    ///
    /// # Arguments
    ///
    /// * `task_type` - Task type as found on the message (unknown types included)
    /// * `outcome` - Dispatch outcome (e.g., "succeeded", "retried", "terminal")
    /// * `duration` - Time spent handling the task
    pub fn record_task(&self, task_type: &str, outcome: &str, duration: Duration) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[task_type, outcome]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[task_type])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            task_type = task_type,
            outcome = outcome,
            duration_secs = duration.as_secs_f64(),
            "Recorded task metric"
        );
    }

    /// Record a task republished for another attempt.
    pub fn record_retry(&self, task_type: &str) {
        if let Some(retries) = TASK_RETRIES_TOTAL.get() {
            retries.with_label_values(&[task_type]).inc();
        }
    }

    pub fn record_readiness_transition(&self) {
        if let Some(transitions) = READINESS_TRANSITIONS_TOTAL.get() {
            transitions.inc();
        }
    }

    /// Record the latency of one LLM call.
    pub fn record_llm_latency(&self, model: &str, latency_secs: f64) {
        if let Some(llm_latency) = LLM_LATENCY.get() {
            llm_latency
                .with_label_values(&[model])
                .observe(latency_secs);
        }

        tracing::trace!(model = model, latency_secs = latency_secs, "Recorded LLM latency");
    }

    pub fn inc_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }
}
