//! HTTP surface over [`StreamManager`].
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | `POST` | `/streams` | start a stream, `201 {"id", "port"}` |
//! | `DELETE` | `/streams` | stop every stream |
//! | `DELETE` | `/streams/{source_id}/{quality}` | stop one stream |
//! | `POST` | `/streams/{source_id}/{quality}/audio` | toggle audio, `{"active"}` |
//! | `GET` | `/streams/{source_id}/{quality}/live` | relay byte stream |
//! | `GET` | `/proxy/{port}` | relay byte stream by assigned port |
//! | `GET` | `/status` | status snapshot |
//! | `GET` | `/health` | liveness |

use std::future::Future;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::error::{MuxError, Result};
use crate::manager::StreamManager;
use crate::relay::RelayClient;
use crate::source::{Quality, Source};
use crate::stream::StreamId;

/// Body of `POST /streams`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StartRequest {
    pub source: Source,
    pub quality: Quality,
    #[serde(default)]
    pub audio: bool,
}

#[derive(Debug, Serialize)]
struct Started {
    id: String,
    port: u16,
}

#[derive(Debug, Serialize)]
struct AudioState {
    active: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for MuxError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            MuxError::CapacityExceeded { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "CAPACITY_EXCEEDED")
            }
            MuxError::StreamNotFound(_) => (StatusCode::NOT_FOUND, "STREAM_NOT_FOUND"),
            MuxError::NotAvailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "NOT_AVAILABLE"),
            MuxError::InvalidSource(_) => (StatusCode::BAD_REQUEST, "INVALID_SOURCE"),
            other => {
                tracing::error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };
        let body = ErrorResponse {
            error: ErrorDetail {
                code,
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Build the router. The manager is shared by every handler.
pub fn router(manager: StreamManager) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/streams", post(start_stream).delete(stop_all_streams))
        .route("/streams/{source_id}/{quality}", delete(stop_stream))
        .route("/streams/{source_id}/{quality}/audio", post(toggle_audio))
        .route("/streams/{source_id}/{quality}/live", get(live))
        .route("/proxy/{port}", get(proxy))
        .with_state(manager)
}

/// Serve the router on `listener` until `shutdown` resolves.
///
/// Every stream is stopped once `shutdown` resolves. That ends the relay
/// bodies still held by viewers, so the graceful drain can finish.
pub async fn serve<F>(
    listener: TcpListener,
    manager: StreamManager,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let stopping = manager.clone();
    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("shutdown requested, stopping all streams");
            stopping.stop_all_streams().await;
        })
        .await
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(manager): State<StreamManager>) -> impl IntoResponse {
    Json(manager.status())
}

async fn start_stream(
    State(manager): State<StreamManager>,
    Json(request): Json<StartRequest>,
) -> Result<impl IntoResponse> {
    let id = manager
        .start_stream(request.source, request.quality, request.audio)
        .await?;
    let port = manager
        .record(&id)
        .map(|record| record.port)
        .ok_or_else(|| MuxError::StreamNotFound(id.to_string()))?;
    Ok((
        StatusCode::CREATED,
        Json(Started {
            id: id.to_string(),
            port,
        }),
    ))
}

async fn stop_stream(
    State(manager): State<StreamManager>,
    Path((source_id, quality)): Path<(String, String)>,
) -> Result<StatusCode> {
    let id = StreamId::new(&source_id, quality.parse()?);
    manager.stop_stream(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_all_streams(State(manager): State<StreamManager>) -> StatusCode {
    manager.stop_all_streams().await;
    StatusCode::NO_CONTENT
}

async fn toggle_audio(
    State(manager): State<StreamManager>,
    Path((source_id, quality)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let active = manager.toggle_audio(&source_id, quality.parse()?)?;
    Ok(Json(AudioState { active }))
}

async fn live(
    State(manager): State<StreamManager>,
    Path((source_id, quality)): Path<(String, String)>,
) -> Result<Response> {
    let id = StreamId::new(&source_id, quality.parse()?);
    let client = manager.connect_client(&id).await?;
    Ok(relay_response(client))
}

async fn proxy(State(manager): State<StreamManager>, Path(port): Path<u16>) -> Result<Response> {
    let client = manager.connect_client_by_port(port).await?;
    Ok(relay_response(client))
}

fn relay_response(client: RelayClient) -> Response {
    let content_type = client.content_type().to_string();
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(client.into_stream()),
    )
        .into_response()
}
