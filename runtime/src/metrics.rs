//! Prometheus metrics recorder installation.
//!
//! Library code records metrics through the `metrics` facade. Binaries call
//! [`install_prometheus_recorder`] once at startup and render the handle
//! wherever they expose metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use fulfillment_runtime::metrics::install_prometheus_recorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = install_prometheus_recorder()?;
//! println!("{}", handle.render());
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Latency buckets (seconds) for every `*_duration_seconds` histogram.
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

/// Install the global Prometheus recorder and describe the store metrics.
///
/// # Errors
///
/// Returns [`MetricsError`] if the exporter cannot be built or a recorder is
/// already installed.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), DURATION_BUCKETS)
        .map_err(|e| MetricsError::Build(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    describe_store_metrics();
    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Register descriptions for the metrics emitted by [`crate::Store`].
pub fn describe_store_metrics() {
    describe_counter!(
        "fulfillment_store_commands_total",
        "Commands processed by per-key stores, by aggregate kind and outcome (accepted, noop, rejected)"
    );
    describe_histogram!(
        "fulfillment_store_command_duration_seconds",
        "Time spent inside a store's critical section for accepted commands"
    );
}
