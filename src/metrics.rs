use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Histogram bucket boundaries for response body size (bytes).
const SIZE_BUCKETS: &[f64] = &[
    100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0, 100000.0, 500000.0, 1000000.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup before any `counter!` / `gauge!` /
    /// `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "proxy_response_size_bytes".to_string(),
                ),
                SIZE_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // request path
        describe_counter!(
            "proxy_requests_total",
            Unit::Count,
            "Total client requests processed"
        );
        describe_histogram!(
            "proxy_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_histogram!(
            "proxy_fetch_duration_seconds",
            Unit::Seconds,
            "Upstream fetch duration (time spent waiting for the origin)"
        );
        describe_histogram!(
            "proxy_response_size_bytes",
            Unit::Bytes,
            "Response body size in bytes"
        );

        // codec
        describe_counter!(
            "proxy_codec_failures_total",
            Unit::Count,
            "Total content-codec encode/decode failures, by direction and encoding"
        );

        // plugin chain
        describe_counter!(
            "proxy_plugin_drop_connection_total",
            Unit::Count,
            "Total transactions terminated by a plugin's DropConnection signal"
        );
        describe_counter!(
            "proxy_plugin_errors_total",
            Unit::Count,
            "Total plugin hook invocations that raised an error"
        );

        // loop detection
        describe_counter!(
            "proxy_loop_detected_total",
            Unit::Count,
            "Total requests refused because they would form a reverse-proxy loop"
        );

        // TLS interception
        describe_counter!(
            "proxy_connect_total",
            Unit::Count,
            "Total CONNECT requests, by outcome (intercepted, relayed, rejected)"
        );
        describe_counter!(
            "proxy_cert_issued_total",
            Unit::Count,
            "Total leaf certificates issued, by cache outcome (hit, generated)"
        );
        describe_counter!(
            "proxy_cert_issue_failures_total",
            Unit::Count,
            "Total leaf certificate issuance failures"
        );

        // connections
        describe_gauge!(
            "proxy_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "proxy_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
