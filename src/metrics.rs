use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub const CONNECTIONS_ACCEPTED: &str = "harbr_balancer_connections_accepted_total";
pub const CONNECTIONS_REJECTED: &str = "harbr_balancer_connections_rejected_total";
pub const CONNECTIONS_EXHAUSTED: &str = "harbr_balancer_connections_exhausted_total";
pub const CONNECTIONS_ERRORED: &str = "harbr_balancer_connections_errored_total";
pub const BACKEND_CONNECT_FAILURES: &str = "harbr_balancer_backend_connect_failures_total";
pub const BACKEND_STATE_CHANGES: &str = "harbr_balancer_backend_state_changes_total";
pub const SESSION_DURATION: &str = "harbr_balancer_session_duration_seconds";

/// Install the Prometheus exporter, scraped at `addr`.
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}
