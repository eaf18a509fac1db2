use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::media::{ContentDir, is_plain_file_name};
use crate::pipeline::SyncPipeline;
use crate::store::ConfigStore;

#[derive(Clone)]
struct ApiState {
    store: ConfigStore,
    content: ContentDir,
    pipeline: SyncPipeline,
}

/// Routes the display client uses to read what the sync wrote to disk.
pub fn router(store: ConfigStore, content: ContentDir, pipeline: SyncPipeline) -> Router {
    let downloads = ServeDir::new(content.root());
    let state = ApiState {
        store,
        content,
        pipeline,
    };
    Router::new()
        .route("/media", get(list_media).delete(delete_media))
        .route("/api/setup", get(setup))
        .route("/api/device", get(device))
        .route("/api/messages", get(list_messages))
        .route(
            "/api/messages/{filename}",
            get(read_message).delete(delete_message),
        )
        .nest_service("/downloads", downloads)
        .with_state(state)
}

pub async fn serve(listener: TcpListener, router: Router, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().ok();
    info!(?addr, "http api listening");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("http server exited")?;
    Ok(())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn list_media(State(state): State<ApiState>) -> Response {
    let content = state.content.clone();
    match tokio::task::spawn_blocking(move || content.list_items()).await {
        Ok(items) => Json(items).into_response(),
        Err(err) => {
            warn!(error = %err, "media listing task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read media")
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeleteMedia {
    url: Option<String>,
}

async fn delete_media(State(state): State<ApiState>, Json(body): Json<DeleteMedia>) -> Response {
    let Some(url) = body.url.filter(|u| !u.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "no url given");
    };
    let Some(path) = state.content.resolve_url(&url) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid file path");
    };

    if let Err(err) = tokio::fs::remove_file(&path).await {
        warn!(path = %path.display(), error = %err, "failed to delete media");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "file could not be deleted");
    }
    info!(path = %path.display(), "media deleted");

    if let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) {
        let pipeline = state.pipeline.clone();
        tokio::spawn(async move {
            let _ = pipeline.mark_deleted(&name).await;
        });
    }
    Json(json!({ "message": "file deleted" })).into_response()
}

async fn setup(State(state): State<ApiState>) -> Response {
    match state.store.load_setup_raw() {
        Ok(value) => Json(value).into_response(),
        Err(err) => {
            warn!(error = %err, "setup document unavailable");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "setup could not be loaded")
        }
    }
}

async fn device(State(state): State<ApiState>) -> Response {
    match state.store.load_device() {
        Ok(identity) => Json(identity).into_response(),
        Err(err) => {
            warn!(error = %err, "device identity unavailable");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "device info not available")
        }
    }
}

async fn list_messages(State(state): State<ApiState>) -> Response {
    Json(state.content.list_messages()).into_response()
}

async fn read_message(State(state): State<ApiState>, Path(filename): Path<String>) -> Response {
    if !is_plain_file_name(&filename) {
        return error_response(StatusCode::BAD_REQUEST, "invalid file name");
    }
    match state.content.read_message(&filename) {
        Ok(text) => Json(json!({ "filename": filename, "text": text })).into_response(),
        Err(_) => error_response(StatusCode::NOT_FOUND, "message not found"),
    }
}

async fn delete_message(State(state): State<ApiState>, Path(filename): Path<String>) -> Response {
    if !is_plain_file_name(&filename) {
        return error_response(StatusCode::BAD_REQUEST, "invalid file name");
    }
    match state.content.delete_message(&filename) {
        Ok(()) => {
            info!(filename = %filename, "message deleted");
            Json(json!({ "success": true })).into_response()
        }
        Err(_) => error_response(StatusCode::NOT_FOUND, "message could not be deleted"),
    }
}
