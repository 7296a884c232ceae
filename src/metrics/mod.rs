//! Metrics module for Prometheus-based monitoring.
//!
//! Covers task dispatch outcomes, retries, readiness transitions, LLM latency
//! and worker activity.
//!
//! # Example
//!
//! ```ignore
//! use hint_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_retry("generate_enhanced_programs");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, LLM_LATENCY, READINESS_TRANSITIONS_TOTAL, REGISTRY, TASKS_TOTAL,
    TASK_DURATION, TASK_RETRIES_TOTAL,
};
