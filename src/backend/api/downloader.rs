//! Downloader API module

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::downloader::{
    DownloadEvent, DownloadService, DownloadSnapshot, Notification, SessionStats, StartDownload,
};
use crate::router::AppRes;

/// Body of a start request
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(flatten)]
    pub request: StartDownload,
    /// Hold the response until the download ended
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub item_id: String,
    pub instance: u64,
}

/// Aggregate state of the queue
#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub total_progress: f32,
    pub summary: Option<String>,
    pub paused: bool,
    pub session: SessionStats,
    pub notification: Option<Notification>,
}

/// Get all queued downloads and their current status
pub async fn get_downloads_handler(State(service): State<DownloadService>) -> Json<Vec<DownloadSnapshot>> {
    Json(service.list_all())
}

/// Handler for getting a specific download by item ID
pub async fn get_download_handler(
    State(service): State<DownloadService>,
    Path(item_id): Path<String>,
) -> Result<Json<DownloadSnapshot>, StatusCode> {
    service.find(&item_id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

pub async fn start_download_handler(
    State(service): State<DownloadService>,
    Json(body): Json<StartRequest>,
) -> AppRes<Response> {
    let handle = service.start_download(body.request).await?;

    if body.wait {
        let result = handle.wait_until_done().await?;
        return Ok(Json(result).into_response());
    }

    let accepted = Accepted {
        item_id: handle.item_id,
        instance: handle.instance,
    };
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

/// Handler for cancelling a download
pub async fn cancel_download_handler(
    State(service): State<DownloadService>,
    Path(item_id): Path<String>,
) -> StatusCode {
    if service.cancel_download(&item_id) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn cancel_all_handler(State(service): State<DownloadService>) -> Json<serde_json::Value> {
    let cancelled = service.cancel_all();
    Json(serde_json::json!({ "cancelled": cancelled }))
}

pub async fn pause_handler(State(service): State<DownloadService>) -> Json<serde_json::Value> {
    let paused = service.pause_resume();
    Json(serde_json::json!({ "paused": paused }))
}

pub async fn stop_handler(State(service): State<DownloadService>) -> StatusCode {
    service.stop();
    StatusCode::ACCEPTED
}

pub async fn progress_handler(State(service): State<DownloadService>) -> Json<ProgressResponse> {
    Json(ProgressResponse {
        total_progress: service.total_progress(),
        summary: service.summary_text(),
        paused: service.is_paused(),
        session: service.session(),
        notification: service.notification(),
    })
}

/// Stream status changes and results as server-sent events
pub async fn events_handler(
    State(service): State<DownloadService>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stopped = {
        let service = service.clone();
        async move { service.stopped().await }
    };
    let stream = futures::stream::unfold(service.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((Ok::<_, Infallible>(sse_event(&event)), rx)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream subscriber lagged behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .take_until(stopped);

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: &DownloadEvent) -> Event {
    let name = match event {
        DownloadEvent::StatusChanged { .. } => "status_changed",
        DownloadEvent::Result(_) => "result",
    };
    match serde_json::to_string(event) {
        Ok(data) => Event::default().event(name).data(data),
        Err(e) => {
            tracing::error!("Failed to serialize download event: {}", e);
            Event::default().event(name).comment("serialization failed")
        }
    }
}

pub fn downloader_api() -> Router<DownloadService> {
    Router::new()
        .route("/", get(get_downloads_handler).post(start_download_handler))
        .route("/progress", get(progress_handler))
        .route("/events", get(events_handler))
        .route("/cancel", post(cancel_all_handler))
        .route("/pause", post(pause_handler))
        .route("/stop", post(stop_handler))
        .route("/{id}", get(get_download_handler))
        .route("/{id}/cancel", post(cancel_download_handler))
}
