//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `peerlink_known_peers` - gauge of peers in the membership cache
//! - `peerlink_watch_events_total` - counter of applied watch events by kind
//! - `peerlink_registrations_total` - counter of successful registration cycles
//! - `peerlink_registration_failures_total` - counter of failed registration cycles
//! - `peerlink_pool_connections` - gauge of live pooled connections
//! - `peerlink_dial_failures_total` - counter of failed dials
//! - `peerlink_dial_duration_seconds` - histogram of dial latencies

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus recorder with its own HTTP scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics_listener(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    register_metric_descriptions();
    Ok(())
}

fn register_metric_descriptions() {
    describe_gauge!(
        "peerlink_known_peers",
        "Number of peers in the membership cache"
    );
    describe_counter!(
        "peerlink_watch_events_total",
        "Total number of applied watch events"
    );
    describe_counter!(
        "peerlink_registrations_total",
        "Total number of successful registration cycles"
    );
    describe_counter!(
        "peerlink_registration_failures_total",
        "Total number of failed registration cycles"
    );
    describe_gauge!(
        "peerlink_pool_connections",
        "Number of live pooled connections"
    );
    describe_counter!(
        "peerlink_dial_failures_total",
        "Total number of failed dials"
    );
    describe_histogram!(
        "peerlink_dial_duration_seconds",
        "Duration of connection establishment in seconds"
    );
}

pub fn set_known_peers(namespace: &str, count: usize) {
    gauge!("peerlink_known_peers", "namespace" => namespace.to_string()).set(count as f64);
}

pub fn record_watch_event(namespace: &str, kind: &'static str) {
    counter!(
        "peerlink_watch_events_total",
        "namespace" => namespace.to_string(),
        "kind" => kind
    )
    .increment(1);
}

pub fn record_registration(namespace: &str) {
    counter!("peerlink_registrations_total", "namespace" => namespace.to_string()).increment(1);
}

pub fn record_registration_failure(namespace: &str) {
    counter!("peerlink_registration_failures_total", "namespace" => namespace.to_string())
        .increment(1);
}

pub fn set_pool_connections(namespace: &str, count: usize) {
    gauge!("peerlink_pool_connections", "namespace" => namespace.to_string()).set(count as f64);
}

pub fn record_dial(namespace: &str, duration: Duration, success: bool) {
    histogram!("peerlink_dial_duration_seconds", "namespace" => namespace.to_string())
        .record(duration.as_secs_f64());
    if !success {
        counter!("peerlink_dial_failures_total", "namespace" => namespace.to_string())
            .increment(1);
    }
}
