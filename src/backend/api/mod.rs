use axum::Router;

use crate::downloader::DownloadService;

pub mod downloader;

pub fn api_router() -> Router<DownloadService> {
    Router::new().nest("/downloads", downloader::downloader_api())
}
