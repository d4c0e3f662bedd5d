use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) work anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`. Install is
/// idempotent — repeated calls share the first recorder.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    pub fn install() -> Self {
        static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
        let handle = HANDLE.get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .set_buckets_for_metric(
                    metrics_exporter_prometheus::Matcher::Suffix(
                        "_duration_seconds".to_string(),
                    ),
                    LATENCY_BUCKETS,
                )
                .expect("valid matcher")
                .install_recorder()
                .expect("failed to install metrics recorder");
            describe_all();
            handle
        });
        Self {
            handle: handle.clone(),
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe_all() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );

    // admission pipeline
    describe_counter!(
        "gateway_rate_limit_rejected_total",
        Unit::Count,
        "Requests rejected by a rate limiter (service, route, or tier scope)"
    );
    describe_counter!(
        "gateway_rate_limit_fail_open_total",
        Unit::Count,
        "Distributed rate limit checks that failed open"
    );
    describe_counter!(
        "gateway_throttle_timeouts_total",
        Unit::Count,
        "Requests whose throttle wait exceeded max_wait"
    );
    describe_counter!(
        "gateway_priority_rejected_total",
        Unit::Count,
        "Requests rejected by the priority admitter"
    );
    describe_counter!(
        "gateway_adaptive_rejected_total",
        Unit::Count,
        "Requests rejected by the adaptive concurrency limiter"
    );
    describe_counter!(
        "gateway_bot_blocked_total",
        Unit::Count,
        "Requests blocked by bot detection"
    );
    describe_counter!(
        "gateway_mtls_rejected_total",
        Unit::Count,
        "Requests rejected by client certificate verification"
    );
    describe_counter!(
        "gateway_auth_failures_total",
        Unit::Count,
        "Authentication failures by route"
    );

    // handlers
    describe_counter!(
        "gateway_upstream_errors_total",
        Unit::Count,
        "Upstream dial/read failures"
    );
    describe_counter!(
        "gateway_composer_errors_total",
        Unit::Count,
        "Sequential composer step failures"
    );

    // control plane
    describe_gauge!(
        "gateway_control_connected_nodes",
        Unit::Count,
        "Data-plane nodes currently connected"
    );
    describe_counter!(
        "gateway_control_heartbeats_total",
        Unit::Count,
        "Heartbeats received from data planes"
    );
    describe_counter!(
        "gateway_control_updates_sent_total",
        Unit::Count,
        "Config updates sent to data planes"
    );
    describe_counter!(
        "gateway_control_version_rejected_total",
        Unit::Count,
        "Node connections rejected by the version gate"
    );

    // config
    describe_gauge!(
        "gateway_config_routes_total",
        Unit::Count,
        "Number of routes currently loaded"
    );

    // runtime
    describe_gauge!(
        "gateway_worker_threads",
        Unit::Count,
        "Tokio worker threads the runtime was sized to"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        let a = Metrics::install();
        let b = Metrics::install();
        metrics::counter!("gateway_http_requests_total", "route" => "t", "method" => "GET", "status_code" => "200").increment(1);
        assert!(a.render().contains("gateway_http_requests_total"));
        let _ = b;
    }
}
