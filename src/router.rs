use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::backend::api::api_router;
use crate::downloader::{DownloadError, DownloadService};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub failure: String,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Download(#[from] DownloadError),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::Download(DownloadError::ServiceStopped) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Download(DownloadError::OutputOnlyAction | DownloadError::InvalidItemId(_)) => {
                StatusCode::BAD_REQUEST
            }
            Error::Download(
                DownloadError::FormatResolution { .. }
                | DownloadError::Connection { .. }
                | DownloadError::BadStatus { .. },
            ) => StatusCode::BAD_GATEWAY,
            Error::Download(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = Json(ErrorResponse {
            failure: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub type AppRes<T> = Result<T, Error>;

/// Create the main router
pub fn create_router(service: DownloadService) -> Router {
    Router::new()
        .nest("/api", api_router())
        .fallback(|| async {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    failure: "Not Found".to_string(),
                }),
            )
        })
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}
