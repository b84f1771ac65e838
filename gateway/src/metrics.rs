//! Prometheus metrics for token operations.
//!
//! Exposed on `/metrics`. Every API operation goes through [`observe`], which
//! counts it by outcome and times it.

use std::future::Future;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, CounterVec, Encoder,
    HistogramVec, TextEncoder,
};

use crate::errors::AppError;

pub struct OperationMetrics {
    operations_total: CounterVec,
    operation_duration_seconds: HistogramVec,
}

static METRICS: Lazy<Option<OperationMetrics>> = Lazy::new(|| match OperationMetrics::register() {
    Ok(m) => Some(m),
    Err(e) => {
        tracing::warn!("failed to register token metrics: {}", e);
        None
    }
});

impl OperationMetrics {
    fn register() -> prometheus::Result<Self> {
        let operations_total = register_counter_vec!(
            opts!("tokend_operations_total", "Token operations by outcome"),
            &["operation", "outcome"]
        )?;

        let operation_duration_seconds = register_histogram_vec!(
            histogram_opts!(
                "tokend_operation_duration_seconds",
                "Token operation latency in seconds",
                // file-backed: sub-millisecond to lock timeout
                vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
            ),
            &["operation"]
        )?;

        Ok(Self {
            operations_total,
            operation_duration_seconds,
        })
    }
}

/// Record one finished operation. `outcome` is `ok` or an error code.
pub fn record(operation: &str, outcome: &str, elapsed: Duration) {
    let Some(m) = METRICS.as_ref() else {
        return;
    };
    m.operations_total
        .with_label_values(&[operation, outcome])
        .inc();
    m.operation_duration_seconds
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());
}

/// Run `fut`, recording its outcome and latency under `operation`.
pub async fn observe<T, F>(operation: &'static str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    let started = Instant::now();
    let result = fut.await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    record(operation, outcome, started.elapsed());
    result
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    Lazy::force(&METRICS);
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_operation_is_exported() {
        record("issue", "ok", Duration::from_millis(3));
        record("issue", "identity_conflict", Duration::from_millis(1));

        let output = encode_metrics();
        assert!(output.contains("tokend_operations_total"));
        assert!(output.contains("outcome=\"identity_conflict\""));
        assert!(output.contains("tokend_operation_duration_seconds_bucket"));
    }

    #[tokio::test]
    async fn test_observe_passes_result_through() {
        let ok: Result<u8, AppError> = observe("status", async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u8, AppError> =
            observe("status", async { Err(AppError::BadRequest("nope".into())) }).await;
        assert!(matches!(err, Err(AppError::BadRequest(_))));
    }
}
