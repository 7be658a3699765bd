//! Liveness and metrics servers.
//!
//! - `GET :80/` — liveness, always 200 while the process runs
//! - `GET :8080/metrics` — Prometheus metrics

use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tracing::info;

/// Labels for the execution counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ExecutionLabels {
    pub policy_type: String,
    pub name: String,
    pub code: String,
}

impl EncodeLabelSet for ExecutionLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("type", self.policy_type.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("code", self.code.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for the execution duration histogram.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DurationLabels {
    pub policy_type: String,
    pub name: String,
}

impl EncodeLabelSet for DurationLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("type", self.policy_type.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Histogram buckets for policy execution latency.
const DURATION_BUCKETS: [f64; 14] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Shared metrics for the engine.
pub struct EngineMetrics {
    executions: Family<ExecutionLabels, Counter>,
    durations: Family<DurationLabels, Histogram>,
    registry: Registry,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let executions = Family::<ExecutionLabels, Counter>::default();
        registry.register(
            "policy_execution",
            "Total number of policy executions",
            executions.clone(),
        );

        let durations = Family::<DurationLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(DURATION_BUCKETS.into_iter())
        });
        registry.register(
            "policy_execution_duration_seconds",
            "Duration of policy executions in seconds",
            durations.clone(),
        );

        Self {
            executions,
            durations,
            registry,
        }
    }

    /// Record one policy execution.
    pub fn record_execution(&self, policy_type: &str, name: &str, code: u16, seconds: f64) {
        self.executions
            .get_or_create(&ExecutionLabels {
                policy_type: policy_type.to_string(),
                name: name.to_string(),
                code: code.to_string(),
            })
            .inc();
        self.durations
            .get_or_create(&DurationLabels {
                policy_type: policy_type.to_string(),
                name: name.to_string(),
            })
            .observe(seconds);
    }

    /// Encode metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("failed to encode metrics");
            return "# error encoding metrics".to_string();
        }
        buffer
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics_handler(State(metrics): State<Arc<EngineMetrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics.encode(),
    )
}

/// Run the liveness server on :80. Responds 200 to everything.
pub async fn run_liveness_server() -> Result<(), std::io::Error> {
    let app = Router::new().route("/", get(livez)).fallback(get(livez));
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 80));
    info!(port = 80, "starting liveness server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

/// Run the metrics server on :8080.
pub async fn run_metrics_server(metrics: Arc<EngineMetrics>) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 8080));
    info!(port = 8080, "starting metrics server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_metrics_encode_with_labels() {
        let metrics = EngineMetrics::new();
        metrics.record_execution("Validating", "a.test", 400, 0.02);
        metrics.record_execution("Controller", "bg.test", 200, 1.5);

        let encoded = metrics.encode();
        assert!(encoded.contains("policy_execution_total"));
        assert!(encoded.contains("policy_execution_duration_seconds"));
        assert!(encoded.contains("name=\"a.test\""));
        assert!(encoded.contains("code=\"400\""));
    }

    #[test]
    fn duration_buckets_cover_the_specified_range() {
        assert_eq!(DURATION_BUCKETS.first(), Some(&0.001));
        assert_eq!(DURATION_BUCKETS.last(), Some(&60.0));
    }
}
