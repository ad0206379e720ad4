//! Health, readiness and metrics server (ambient observability).
//!
//! One `axum` server per process, bound to `global.healthBindAddr`, exposing:
//! - `GET /healthz` — process liveness, always 200 once the server is up.
//! - `GET /readyz` — per-topic readiness, 200 only if every topic is `Ready`
//!   or `Degraded`; 503 if any topic is `Stopped` or `CircuitOpen`.
//! - `GET /metrics` — Prometheus text exposition via `metrics-exporter-prometheus`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::RwLock;
use tracing::info;

/// Per-topic pipeline state surfaced on `/readyz` ("Readiness").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicHealth {
    Ready,
    Degraded,
    Stopped,
    CircuitOpen,
}

impl TopicHealth {
    fn is_ready(self) -> bool {
        matches!(self, TopicHealth::Ready | TopicHealth::Degraded)
    }

    fn as_str(self) -> &'static str {
        match self {
            TopicHealth::Ready => "READY",
            TopicHealth::Degraded => "DEGRADED",
            TopicHealth::Stopped => "STOPPED",
            TopicHealth::CircuitOpen => "CIRCUIT_OPEN",
        }
    }
}

#[derive(Default)]
pub struct HealthRegistry {
    topics: RwLock<HashMap<String, TopicHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(HealthRegistry { topics: RwLock::new(HashMap::new()) })
    }

    pub async fn set(&self, topic: &str, health: TopicHealth) {
        self.topics.write().await.insert(topic.to_string(), health);
    }

    async fn all_ready(&self) -> bool {
        self.topics.read().await.values().all(|h| h.is_ready())
    }

    async fn snapshot(&self) -> HashMap<String, TopicHealth> {
        self.topics.read().await.clone()
    }
}

struct AppState {
    registry: Arc<HealthRegistry>,
    prometheus: PrometheusHandle,
}

/// Installs the process-wide Prometheus recorder and binds the health server.
/// Must be called once per process before any `metrics::counter!`/`gauge!` call.
pub async fn serve(bind_addr: SocketAddr, registry: Arc<HealthRegistry>) -> anyhow::Result<()> {
    let prometheus = PrometheusBuilder::new().install_recorder()?;
    let state = Arc::new(AppState { registry, prometheus });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    info!(%bind_addr, "health server listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot().await;
    let ready = state.registry.all_ready().await;
    let body: Vec<String> = snapshot
        .iter()
        .map(|(topic, health)| format!("{topic}={}", health.as_str()))
        .collect();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, body.join("\n"))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.prometheus.render()
}

/// Thin wrappers around the `metrics` macros, named for the counters/gauges
/// calls out explicitly, so call sites read as intent rather than
/// string-typed metric names scattered through the pipeline.
pub mod record {
    pub fn dlq_count(topic: &str, kind: &str) {
        metrics::counter!("dlq_count", "topic" => topic.to_string(), "kind" => kind.to_string()).increment(1);
    }

    pub fn pipeline_stopped(topic: &str, stopped: bool) {
        metrics::gauge!("pipeline_stopped", "topic" => topic.to_string())
            .set(if stopped { 1.0 } else { 0.0 });
    }

    pub fn commit_count(topic: &str) {
        metrics::counter!("commit_count", "topic" => topic.to_string()).increment(1);
    }

    pub fn commit_rows(topic: &str, rows: u64) {
        metrics::counter!("commit_rows", "topic" => topic.to_string()).increment(rows);
    }

    pub fn circuit_state(topic: &str, state: &str) {
        metrics::gauge!("circuit_state", "topic" => topic.to_string(), "state" => state.to_string()).set(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_is_ready_when_empty() {
        let registry = HealthRegistry::new();
        assert!(registry.all_ready().await);
    }

    #[tokio::test]
    async fn registry_not_ready_when_any_topic_stopped() {
        let registry = HealthRegistry::new();
        registry.set("orders", TopicHealth::Ready).await;
        registry.set("trades", TopicHealth::Stopped).await;
        assert!(!registry.all_ready().await);
    }

    #[tokio::test]
    async fn degraded_counts_as_ready() {
        let registry = HealthRegistry::new();
        registry.set("orders", TopicHealth::Degraded).await;
        assert!(registry.all_ready().await);
    }
}
