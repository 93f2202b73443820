use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::pipeline::{PipelineError, StatsSnapshot};
use crate::app::AppState;

const EMPTY_BATCH_MESSAGE: &str = "Empty batch detected.  Odd but harmless.";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("expected a JSON array of events")]
    NotAnArray,
    #[error("batch processing failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("batch processing task failed: {0}")]
    Task(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidJson(_) | Self::NotAnArray => StatusCode::BAD_REQUEST,
            Self::Pipeline(_) | Self::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("webhook batch rejected: status={}, error={}", status.as_u16(), self);
        }

        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

/// Webhook routes plus health and counters.
pub fn router(
    state: AppState,
    max_payload_bytes: usize
) -> Router {
    Router::new()
        .route("/api/v1/events", post(ingest_events))
        .route("/inbound", post(ingest_events))
        .route("/healthz", get(healthz))
        .route("/api/v1/stats", get(stats))
        .layer(DefaultBodyLimit::max(max_payload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves HTTP until the shared shutdown token is cancelled, then drains
/// in-flight requests.
pub async fn run_http_server(
    listen: &str,
    max_payload_bytes: usize,
    state: AppState
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind http listener on {listen}"))?;
    info!(
        "http server listening: addr={}, max_payload_bytes={}",
        listener.local_addr().context("failed to read listener address")?,
        max_payload_bytes
    );

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state, max_payload_bytes))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server failed")?;

    info!("http server stopped");
    Ok(())
}

async fn ingest_events(
    State(state): State<AppState>,
    body: Bytes
) -> Result<Json<Value>, ApiError> {
    let Value::Array(events) = serde_json::from_slice::<Value>(&body)? else {
        return Err(ApiError::NotAnArray);
    };

    if events.is_empty() {
        info!("empty webhook batch accepted");
        return Ok(Json(json!({ "message": EMPTY_BATCH_MESSAGE })));
    }

    // Runs detached so a dropped connection cannot cut a batch in half.
    let pipeline = state.pipeline.clone();
    let handle = tokio::spawn(async move { pipeline.process_batch(&events).await });

    match handle.await {
        Ok(Ok(_)) => Ok(Json(json!({}))),
        Ok(Err(err)) => Err(ApiError::Pipeline(err)),
        Err(err) => Err(ApiError::Task(err.to_string())),
    }
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.pipeline.stats())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::{EMPTY_BATCH_MESSAGE, router};
    use crate::app::AppState;
    use crate::config::EventsConfig;
    use crate::core::cache::MemoryCache;
    use crate::core::pipeline::Pipeline;
    use crate::core::sink::testing::RecordingSink;

    struct TestApp {
        state: AppState,
        cache: Arc<MemoryCache>,
        sink: Arc<RecordingSink>,
    }

    fn test_app(sink: RecordingSink) -> TestApp {
        let cache = Arc::new(MemoryCache::new(Duration::from_secs(3600)));
        let sink = Arc::new(sink);
        let pipeline =
            Arc::new(Pipeline::new(&EventsConfig::default(), cache.clone(), sink.clone()));
        let state = AppState { pipeline, shutdown: CancellationToken::new() };
        TestApp { state, cache, sink }
    }

    async fn post(
        app: &TestApp,
        uri: &str,
        body: impl Into<Body>
    ) -> (StatusCode, Value) {
        let response = router(app.state.clone(), 1024)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(body.into())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn reception() -> Value {
        json!([{ "msys": { "message_event": {
            "type": "reception",
            "message_id": "M1",
            "rcpt_to": "a@x.com"
        }}}])
    }

    #[tokio::test]
    async fn accepts_batch_and_forwards_calls() {
        let app = test_app(RecordingSink::default());

        let (status, body) = post(&app, "/api/v1/events", reception().to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));
        assert_eq!(app.sink.identifies().len(), 1);
        assert_eq!(app.cache.len().await, 1);
    }

    #[tokio::test]
    async fn inbound_alias_behaves_the_same() {
        let app = test_app(RecordingSink::default());

        let (status, _) = post(&app, "/inbound", reception().to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.sink.identifies().len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_harmless() {
        let app = test_app(RecordingSink::default());

        let (status, body) = post(&app, "/api/v1/events", "[]").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], EMPTY_BATCH_MESSAGE);
        assert_eq!(app.cache.len().await, 0);
        assert_eq!(app.state.pipeline.stats().batches, 0);
    }

    #[tokio::test]
    async fn non_array_body_is_rejected_untouched() {
        let app = test_app(RecordingSink::default());

        let (status, body) =
            post(&app, "/api/v1/events", json!({"invalid": "object"}).to_string()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("array"));
        assert_eq!(app.cache.len().await, 0);
        assert!(app.sink.identifies().is_empty());
        assert_eq!(app.state.pipeline.stats().batches, 0);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let app = test_app(RecordingSink::default());

        let (status, body) = post(&app, "/api/v1/events", "[{").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().starts_with("invalid JSON body"));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let app = test_app(RecordingSink::default());

        let (status, _) = post(&app, "/api/v1/events", vec![b' '; 4096]).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn sink_failure_returns_server_error() {
        let app = test_app(RecordingSink::failing_identify());

        let (status, body) = post(&app, "/api/v1/events", reception().to_string()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["message"].as_str().unwrap().contains("identify phase failed"));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app = test_app(RecordingSink::default());

        let (status, _) = post(&app, "/api/v2/events", "[]").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_and_stats_endpoints() {
        let app = test_app(RecordingSink::default());
        post(&app, "/api/v1/events", reception().to_string()).await;

        let health = router(app.state.clone(), 1024)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let response = router(app.state.clone(), 1024)
            .oneshot(Request::builder().uri("/api/v1/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let stats: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(stats["batches"], 1);
        assert_eq!(stats["events_received"], 1);
        assert_eq!(stats["identify_calls"], 1);
    }
}
