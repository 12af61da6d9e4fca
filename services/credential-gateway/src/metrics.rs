//! Prometheus metrics exposition
//!
//! - `gateway_logins_total` (counter): labels `surface`, `outcome`
//! - `gateway_profile_operations_total` (counter): labels `operation`, `outcome`
//! - `gateway_token_refresh_total` (counter): label `outcome`, emitted by
//!   the token lifecycle crate

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a handle for rendering.
///
/// Only one global recorder can exist per process; a second call fails
/// instead of panicking.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record the end of a login attempt on the portal or machine surface.
pub fn record_login(surface: &'static str, outcome: &'static str) {
    metrics::counter!("gateway_logins_total", "surface" => surface, "outcome" => outcome)
        .increment(1);
}

/// Record a user-facing profile operation.
pub fn record_profile_operation(operation: &'static str, outcome: &'static str) {
    metrics::counter!(
        "gateway_profile_operations_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}
