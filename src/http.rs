use crate::collectors::{Clock, SnapshotAssembler, SystemClock};
use crate::metrics::Metrics;
use crate::snapshot::Snapshot;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_TYPE,
};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::map_response_with_state;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{debug, error};

#[derive(Clone)]
pub struct HttpAppState {
    pub assembler: Arc<SnapshotAssembler>,
    pub metrics: Arc<Metrics>,
}

pub fn build_router(state: HttpAppState, cors_allow_origin: HeaderValue) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(snapshot_handler).options(preflight))
        .route("/agent/metrics", get(agent_metrics_handler))
        .layer(map_response_with_state(cors_allow_origin, add_cors_headers))
        .with_state(state)
}

async fn add_cors_headers(State(origin): State<HeaderValue>, mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn preflight() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> Response {
    let assembler = state.assembler.clone();
    let started = Instant::now();
    let outcome = tokio::task::spawn_blocking(move || assembler.assemble()).await;
    let snapshot = snapshot_or_unavailable(outcome, &SystemClock);

    let elapsed = started.elapsed();
    state.metrics.observe_snapshot(&snapshot, elapsed);
    debug!(elapsed_ms = elapsed.as_millis() as u64, "snapshot served");
    Json(snapshot).into_response()
}

/// A lost assembly task still answers with the full snapshot shape.
fn snapshot_or_unavailable(outcome: Result<Snapshot, JoinError>, clock: &dyn Clock) -> Snapshot {
    match outcome {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(error = %err, "snapshot task failed");
            Snapshot::unavailable(clock.now(), format!("snapshot task failed: {err}"))
        }
    }
}

async fn agent_metrics_handler(State(state): State<HttpAppState>) -> Response {
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::gpu::{GpuCapability, GpuCollector};
    use crate::collectors::network::{InterfaceCounters, RateWindowSampler, ScriptedCounters};
    use crate::collectors::system::testing::FakeHost;
    use crate::collectors::system::StaticCollector;
    use crate::collectors::testing::{FixedClock, RecordingSleeper};
    use crate::collectors::Sleeper;
    use axum::body::to_bytes;
    use axum::http::{Method, Request};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<Metrics>) {
        let sleeper: Arc<dyn Sleeper> = Arc::new(RecordingSleeper::default());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(1_700_000_500.0));
        let mut reading = BTreeMap::new();
        reading.insert("eth0".to_string(), InterfaceCounters::default());
        let assembler = SnapshotAssembler::new(
            StaticCollector::new(
                Arc::new(FakeHost::healthy()),
                clock.clone(),
                sleeper.clone(),
                Duration::from_secs(1),
                "/".to_string(),
            ),
            RateWindowSampler::new(
                Arc::new(ScriptedCounters::new(vec![reading])),
                sleeper,
                Duration::from_secs(1),
            ),
            GpuCollector::new(GpuCapability::Unavailable("backend not installed".to_string())),
            clock,
        );
        let metrics = Metrics::new().expect("инициализация метрик");
        let state = HttpAppState {
            assembler: Arc::new(assembler),
            metrics: metrics.clone(),
        };
        (build_router(state, HeaderValue::from_static("*")), metrics)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _) = app();
        let response = app.oneshot(get_request("/healthz")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn metrics_returns_snapshot_json() {
        let (app, metrics) = app();
        let response = app.oneshot(get_request("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        for key in ["timestamp", "system", "cpu", "memory", "disk", "network", "gpu"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["timestamp"], serde_json::json!(1_700_000_500.0));
        assert_eq!(value["network"]["eth0"]["sent_mbps"], serde_json::json!(0.0));
        assert_eq!(value["gpu"]["available"], serde_json::json!(false));
        assert_eq!(metrics.agent_snapshots_total.get(), 1.0);
    }

    #[tokio::test]
    async fn preflight_carries_cors_headers() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            "GET, OPTIONS"
        );
    }

    #[tokio::test]
    async fn crashed_assembly_still_serves_snapshot_shape() {
        let outcome = tokio::task::spawn_blocking(|| -> Snapshot { panic!("collector thread died") })
            .await;
        assert!(outcome.is_err());

        let snapshot = snapshot_or_unavailable(outcome, &FixedClock(1_700_000_900.0));
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["timestamp"], serde_json::json!(1_700_000_900.0));
        for key in ["system", "cpu", "memory", "disk", "network"] {
            let error = value[key]["error"].as_str().unwrap_or_default();
            assert!(error.starts_with("snapshot task failed"), "{key}: {error}");
        }
        assert_eq!(value["gpu"]["available"], serde_json::json!(false));

        let metrics = Metrics::new().expect("инициализация метрик");
        metrics.observe_snapshot(&snapshot, Duration::ZERO);
        assert_eq!(metrics.agent_snapshots_total.get(), 1.0);
        assert_eq!(metrics.agent_gpu_available.get(), 0.0);
    }

    #[tokio::test]
    async fn agent_metrics_exposes_prometheus_text() {
        let (app, _) = app();
        let response = app.oneshot(get_request("/agent/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("agent_uptime_seconds"));
    }
}
