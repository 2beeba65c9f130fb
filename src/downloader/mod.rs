//! Background song downloads
//!
//! This module queues song downloads, fetches them over resumable HTTP
//! transfers with retries, and aggregates their progress into a single
//! notification for the host.

mod error;
mod events;
mod http;
mod models;
pub mod progress;
mod queue;
mod service;
mod unit;

// Re-export the public API
pub use error::{DownloadError, Result};
pub use events::EventBus;
pub use models::{
    DownloadAction, DownloadEvent, DownloadOutcome, DownloadResult, DownloadSnapshot,
    DownloadStatus, DownloaderConfig, SongAudioQuality, StartDownload,
};
pub use progress::{Notification, NotificationAction, NotificationKind};
pub use queue::SessionStats;
pub use service::{DownloadHandle, DownloadService, QueueControl};
pub use unit::Download;

// Re-export utility functions
pub use models::extension_for_content_type;
