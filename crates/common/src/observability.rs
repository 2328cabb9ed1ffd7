//! Observability module for the Portcullis gateway
//!
//! Provides the tracing/logging bootstrap and the Prometheus metrics used by
//! the request pipeline.

use anyhow::Result;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing/logging subsystem
pub fn init_tracing() -> Result<()> {
    // JSON format for structured logging in production, pretty for dev
    let format = std::env::var("PORTCULLIS_LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let json_layer = if format == "json" {
        Some(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let pretty_layer = if format == "pretty" {
        Some(fmt::layer().pretty().with_target(true))
    } else {
        None
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .init();

    info!("Tracing initialized");
    Ok(())
}

/// Gateway request metrics collector
pub struct GatewayMetrics {
    /// Request latency histogram by API
    request_duration: HistogramVec,
    /// Request count by API and status code
    request_count: IntCounterVec,
    /// Requests currently in flight
    active_requests: IntGauge,
    /// Policy interruptions by policy id and kind (failure / short_circuit)
    policy_interruptions: IntCounterVec,
    /// Upstream connection attempts by API
    upstream_attempts: IntCounterVec,
    /// Upstream failures by API
    upstream_failures: IntCounterVec,
    /// Rate limited requests by API
    rate_limited: IntCounterVec,
}

impl GatewayMetrics {
    /// Create a new metrics collector and register with Prometheus
    pub fn new() -> Result<Self> {
        let latency_buckets = vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ];

        Ok(Self {
            request_duration: register_histogram_vec!(
                "portcullis_request_duration_seconds",
                "Request processing duration by API",
                &["api"],
                latency_buckets
            )?,
            request_count: register_int_counter_vec!(
                "portcullis_requests_total",
                "Total requests by API and status code",
                &["api", "status"]
            )?,
            active_requests: register_int_gauge!(
                "portcullis_active_requests",
                "Requests currently in flight"
            )?,
            policy_interruptions: register_int_counter_vec!(
                "portcullis_policy_interruptions_total",
                "Policy chain interruptions by policy and kind",
                &["policy", "kind"]
            )?,
            upstream_attempts: register_int_counter_vec!(
                "portcullis_upstream_attempts_total",
                "Upstream connection attempts by API",
                &["api"]
            )?,
            upstream_failures: register_int_counter_vec!(
                "portcullis_upstream_failures_total",
                "Upstream failures by API",
                &["api"]
            )?,
            rate_limited: register_int_counter_vec!(
                "portcullis_rate_limited_total",
                "Rate limited requests by API",
                &["api"]
            )?,
        })
    }

    pub fn request_started(&self) {
        self.active_requests.inc();
    }

    pub fn request_finished(&self, api: &str, status: u16, duration_secs: f64) {
        self.active_requests.dec();
        self.request_duration
            .with_label_values(&[api])
            .observe(duration_secs);
        self.request_count
            .with_label_values(&[api, &status.to_string()])
            .inc();
    }

    pub fn policy_interrupted(&self, policy: &str, kind: &str) {
        self.policy_interruptions
            .with_label_values(&[policy, kind])
            .inc();
    }

    pub fn upstream_attempt(&self, api: &str) {
        self.upstream_attempts.with_label_values(&[api]).inc();
    }

    pub fn upstream_failure(&self, api: &str) {
        self.upstream_failures.with_label_values(&[api]).inc();
    }

    pub fn rate_limited(&self, api: &str) {
        self.rate_limited.with_label_values(&[api]).inc();
    }
}
