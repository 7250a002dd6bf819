//! HTTP job API.
//!
//! Local stand-in for the serverless dispatcher: `POST /runsync` runs one job
//! and answers with its output, `GET /health` reports readiness. Jobs are
//! handled one at a time. A fatal error answers the failing request and
//! then stops the server.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use voxpod_core::types::{Job, JobOutput};

use crate::error::ServiceError;
use crate::handler::Handler;

#[derive(Clone)]
struct ApiState {
    handler: Arc<Handler>,
    jobs: Arc<Semaphore>,
    fatal: mpsc::Sender<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// Envelope returned by `/runsync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JobOutput>,
    /// Set when the process failed to initialize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub ready: bool,
    pub version: String,
    /// Present once the model is loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSummary>,
}

/// How the resident model was loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    pub id: String,
    pub device_map: String,
    pub attn_implementation: String,
}

/// Build the router. Fatal error messages are sent on `fatal`.
pub fn router(handler: Arc<Handler>, fatal: mpsc::Sender<String>) -> Router {
    let state = ApiState {
        handler,
        jobs: Arc::new(Semaphore::new(1)),
        fatal,
    };
    Router::new()
        .route("/runsync", post(run_sync))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until ctrl-c or a fatal job error. The latter is returned as `Err`.
pub async fn serve(listener: TcpListener, handler: Arc<Handler>) -> Result<(), ServiceError> {
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(1);
    let failure: Arc<std::sync::Mutex<Option<String>>> = Arc::default();
    let slot = failure.clone();

    if let Ok(addr) = listener.local_addr() {
        info!("job API listening on http://{addr}");
    }

    axum::serve(listener, router(handler, fatal_tx))
        .with_graceful_shutdown(async move {
            tokio::select! {
                Some(message) = fatal_rx.recv() => {
                    error!("shutting down after fatal error: {message}");
                    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
                }
                _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
            }
        })
        .await
        .map_err(|e| ServiceError::Startup(format!("job API failed: {e}")))?;

    let failure = failure.lock().unwrap_or_else(|e| e.into_inner()).take();
    match failure {
        Some(message) => Err(ServiceError::Startup(message)),
        None => Ok(()),
    }
}

async fn run_sync(State(state): State<ApiState>, Json(mut job): Json<Job>) -> Response {
    let id = job
        .id
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
        .clone();

    let Ok(_permit) = state.jobs.acquire().await else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    match state.handler.handle(job).await {
        Ok(output) => {
            let status = if output.is_error() {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            Json(JobResponse {
                id,
                status,
                output: Some(output),
                error: None,
            })
            .into_response()
        }
        Err(e) => {
            let message = e.to_string();
            let _ = state.fatal.try_send(message.clone());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(JobResponse {
                    id,
                    status: JobStatus::Failed,
                    output: None,
                    error: Some(message),
                }),
            )
                .into_response()
        }
    }
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let model = state.handler.service().ok().map(|service| {
        let options = service.load_options();
        ModelSummary {
            id: service.model_id().to_string(),
            device_map: options.device_map.clone(),
            attn_implementation: options.attn_implementation.as_str().to_string(),
        }
    });
    let ready = model.is_some();
    Json(HealthResponse {
        status: if ready { "ready" } else { "initializing" }.into(),
        ready,
        version: env!("CARGO_PKG_VERSION").into(),
        model,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::ServiceConfig;
    use crate::publish::ResultPublisher;
    use crate::testing::FakeBackend;
    use crate::transcode::Transcoder;

    fn handler(voices_dir: &std::path::Path) -> Arc<Handler> {
        let config = ServiceConfig {
            voices_dir: voices_dir.to_path_buf(),
            ..Default::default()
        };
        Arc::new(
            Handler::new(
                config,
                Arc::new(FakeBackend::default()),
                Transcoder::default(),
                ResultPublisher::inline(),
            )
            .with_ready_timeout(Duration::from_secs(1)),
        )
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn runsync_completes_and_reports_ready() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("en-Emma_woman.pt"), b"x").unwrap();
        let (listener, url) = bind().await;
        let (tx, _rx) = mpsc::channel(1);
        let app = router(handler(dir.path()), tx);
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = reqwest::Client::new();
        let health: HealthResponse = client
            .get(format!("{url}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!health.ready);
        assert!(health.model.is_none());

        let resp: JobResponse = client
            .post(format!("{url}/runsync"))
            .json(&json!({"id": "abc", "input": {"text": "Hello", "output_format": "wav"}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp.id, "abc");
        assert_eq!(resp.status, JobStatus::Completed);
        assert!(resp.output.unwrap().audio_base64().is_some());

        let health: HealthResponse = client
            .get(format!("{url}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(health.ready);
        assert_eq!(health.status, "ready");
        let model = health.model.unwrap();
        assert_eq!(model.id, "VibeVoice-Realtime-0.5B");
        assert_eq!(model.device_map, "cuda");
        assert_eq!(model.attn_implementation, "flash_attention_2");
    }

    #[tokio::test]
    async fn job_errors_are_failed_but_served() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("en-Emma_woman.pt"), b"x").unwrap();
        let (listener, url) = bind().await;
        let (tx, mut rx) = mpsc::channel(1);
        let app = router(handler(dir.path()), tx);
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let resp = reqwest::Client::new()
            .post(format!("{url}/runsync"))
            .json(&json!({"input": {"text": "  "}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: JobResponse = resp.json().await.unwrap();
        assert_eq!(body.status, JobStatus::Failed);
        assert!(!body.id.is_empty());
        assert_eq!(
            body.output.unwrap().error_message(),
            Some("No text provided for TTS.")
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fatal_error_stops_server() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, url) = bind().await;
        let server = tokio::spawn(serve(listener, handler(dir.path())));

        let resp = reqwest::Client::new()
            .post(format!("{url}/runsync"))
            .json(&json!({"input": {"text": "Hello"}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: JobResponse = resp.json().await.unwrap();
        assert_eq!(body.status, JobStatus::Failed);
        assert!(body.error.unwrap().contains("No voice preset"));

        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_fatal());
    }
}
