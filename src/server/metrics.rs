use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Metric name prefix for all tickgate metrics
const PREFIX: &str = "tickgate";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref SCHEDULER_INVOCATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_scheduler_invocations_total"),
            "Job invocations by terminal decision"
        ),
        &["job", "decision"]
    ).expect("Failed to create scheduler_invocations_total metric");

    pub static ref SCHEDULER_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_scheduler_job_duration_seconds"),
            "Duration of job invocations that reached execution"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0]),
        &["job"]
    ).expect("Failed to create scheduler_job_duration_seconds metric");

    pub static ref SCHEDULER_PERIODS_PROCESSED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_scheduler_periods_processed_total"),
            "Periods completed by period-based jobs"
        ),
        &["job"]
    ).expect("Failed to create scheduler_periods_processed_total metric");
}

/// Register all metrics with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(SCHEDULER_INVOCATIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULER_JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULER_PERIODS_PROCESSED_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record the outcome of one coordinator invocation. Only executed and
/// failed invocations are timed; skips are counted.
pub fn record_scheduler_invocation(job: &str, decision: &str, duration: Duration) {
    SCHEDULER_INVOCATIONS_TOTAL
        .with_label_values(&[job, decision])
        .inc();

    if decision == "executed" || decision == "failed" {
        SCHEDULER_JOB_DURATION_SECONDS
            .with_label_values(&[job])
            .observe(duration.as_secs_f64());
    }
}

pub fn record_periods_processed(job: &str, count: u64) {
    if count > 0 {
        SCHEDULER_PERIODS_PROCESSED_TOTAL
            .with_label_values(&[job])
            .inc_by(count as f64);
    }
}

/// Handler for the `/metrics` endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
