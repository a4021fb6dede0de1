//! Observability Module
//!
//! - `events`: Structured event logging with consistent fields
//! - `metrics`: Prometheus metrics for membership, registration and the pool
//! - `tracing`: Subscriber setup for binaries
//! - `supervision`: Restart policies for components that stop when their stream ends

pub mod events;
pub mod metrics;
pub mod supervision;
pub mod tracing;

pub use metrics::init_metrics_listener;
pub use supervision::{supervise, RestartPolicy, RestartTracker};
pub use tracing::{init_tracing, TracingConfig};
