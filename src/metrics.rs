//! Prometheus metrics for the gateway.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Peak concurrent streams seen since start.
static PEAK_STREAMS: AtomicU64 = AtomicU64::new(0);

/// Initialize metrics descriptions.
pub fn init_metrics() {
    // API metrics
    describe_counter!("gateway_api_requests_total", "API requests by route and status");
    describe_counter!(
        "gateway_rate_limited_total",
        "Requests rejected by the rate limiter"
    );
    describe_histogram!(
        "gateway_request_duration_seconds",
        "API request duration by route"
    );

    // Upstream provider metrics
    describe_counter!(
        "gateway_upstream_requests_total",
        "Completed upstream provider calls"
    );
    describe_counter!("gateway_upstream_errors_total", "Upstream provider errors");
    describe_histogram!(
        "gateway_upstream_duration_seconds",
        "Upstream provider call duration"
    );

    // Fetch metrics
    describe_counter!(
        "gateway_fetch_errors_total",
        "Document fetches refused or failed, by reason"
    );

    // Streaming metrics
    describe_gauge!("gateway_active_streams", "Currently open SSE streams");
    describe_gauge!("gateway_peak_streams", "Peak concurrent SSE streams");
    describe_counter!("gateway_tokens_sent_total", "Token events sent to clients");
    describe_counter!("gateway_bytes_sent_total", "SSE bytes sent to clients");
    describe_histogram!(
        "gateway_stream_duration_seconds",
        "Total duration per SSE stream"
    );
}

/// Start the Prometheus metrics HTTP server.
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    // 10ms to ~163s, doubling
    let duration_buckets: [f64; 15] = [
        0.01, 0.02, 0.04, 0.08, 0.16, 0.32, 0.64, 1.28, 2.56, 5.12, 10.24, 20.48, 40.96, 81.92,
        163.84,
    ];

    let mut builder = PrometheusBuilder::new();
    for name in [
        "gateway_request_duration_seconds",
        "gateway_upstream_duration_seconds",
        "gateway_stream_duration_seconds",
    ] {
        builder = builder.set_buckets_for_metric(Matcher::Full(name.to_string()), &duration_buckets)?;
    }

    builder
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to start metrics server: {}", e))?;

    tracing::info!(%addr, "Metrics server started");
    Ok(())
}

/// Record one finished API request.
pub fn record_api_request(route: &'static str, status: u16, duration: Duration) {
    counter!("gateway_api_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    histogram!("gateway_request_duration_seconds", "route" => route)
        .record(duration.as_secs_f64());
}

/// Record a rate-limit rejection.
pub fn record_rate_limited() {
    counter!("gateway_rate_limited_total").increment(1);
}

/// Record a completed upstream call. `mode` is `single` or `stream`.
pub fn record_upstream_request(provider: &'static str, mode: &'static str, duration: Duration) {
    counter!("gateway_upstream_requests_total", "provider" => provider, "mode" => mode)
        .increment(1);
    histogram!("gateway_upstream_duration_seconds", "provider" => provider, "mode" => mode)
        .record(duration.as_secs_f64());
}

/// Record an upstream error with reason label.
pub fn record_upstream_error(provider: &'static str, reason: &'static str) {
    counter!("gateway_upstream_errors_total", "provider" => provider, "reason" => reason)
        .increment(1);
}

/// Record a refused or failed document fetch.
pub fn record_fetch_error(reason: &'static str) {
    counter!("gateway_fetch_errors_total", "reason" => reason).increment(1);
}

/// Record one token event sent.
pub fn record_token_sent() {
    counter!("gateway_tokens_sent_total").increment(1);
}

/// Record bytes sent to client.
pub fn record_bytes_sent(bytes: u64) {
    counter!("gateway_bytes_sent_total").increment(bytes);
}

/// Update the active stream gauge, raising the peak if needed.
pub fn set_active_streams(count: u64) {
    gauge!("gateway_active_streams").set(count as f64);

    let mut peak = PEAK_STREAMS.load(Ordering::Relaxed);
    while count > peak {
        match PEAK_STREAMS.compare_exchange_weak(peak, count, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => {
                gauge!("gateway_peak_streams").set(count as f64);
                break;
            }
            Err(current) => peak = current,
        }
    }
}

/// Record total stream duration.
pub fn record_stream_duration(duration: Duration) {
    histogram!("gateway_stream_duration_seconds").record(duration.as_secs_f64());
}
