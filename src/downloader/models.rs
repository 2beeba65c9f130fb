//! Data structures for the download system
//!
//! This file contains the core data types shared by the queue, the fetch
//! loop and the outside world: qualities, statuses, snapshots, outcomes and
//! the events broadcast to observers.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, time::Duration};

/// Audio quality a download is requested at
#[derive(ValueEnum, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[clap(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SongAudioQuality {
    Low,
    Medium,
    #[default]
    High,
}

impl fmt::Display for SongAudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Status of a download
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// Queued, waiting for a worker or for the next attempt
    #[default]
    Idle,
    /// Bytes are being streamed to the partial file
    Downloading,
    /// Stopped at a checkpoint because the queue is paused
    Paused,
    /// Stopped at a checkpoint because of cancellation, stop or a stream error
    Cancelled,
    /// The song was already on disk when the download was requested
    AlreadyFinished,
    /// The song was downloaded and renamed to its final name
    Finished,
}

impl DownloadStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::AlreadyFinished | Self::Finished)
    }

    pub fn is_downloading(self) -> bool {
        matches!(self, Self::Downloading | Self::Paused)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Finished states are terminal. `Paused` and `Cancelled` may go back to
    /// `Downloading` because the retry loop starts a fresh attempt after a
    /// pause or a stream error.
    pub fn can_transition_to(self, next: Self) -> bool {
        use DownloadStatus::*;

        match (self, next) {
            (a, b) if a == b => true,
            (AlreadyFinished | Finished, _) => false,
            (_, AlreadyFinished) => false,
            (Idle | Paused | Cancelled, Downloading) => true,
            (Downloading, Finished | Cancelled | Paused) => true,
            (Idle | Paused, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Downloading => write!(f, "Downloading"),
            Self::Paused => write!(f, "Paused"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::AlreadyFinished => write!(f, "Already finished"),
            Self::Finished => write!(f, "Finished"),
        }
    }
}

/// Immutable view of a download handed to observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadSnapshot {
    pub item_id: String,
    pub status: DownloadStatus,
    pub quality: SongAudioQuality,
    /// Fraction in `0.0..=1.0`, zero while the total size is unknown
    pub progress: f32,
    pub instance: u64,
    pub file_path: Option<PathBuf>,
    pub downloaded: u64,
    pub total_size: Option<u64>,
    pub silent: bool,
}

impl DownloadSnapshot {
    pub fn percent(&self) -> u32 {
        (self.progress * 100.0) as u32
    }
}

/// How a download request ended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DownloadOutcome {
    /// The song is on disk at the given path
    Success(PathBuf),
    /// Every attempt failed, carries the last error
    Failure(String),
    /// Neither success nor failure: cancelled or stopped
    Cancelled,
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Success(path) => Some(path),
            _ => None,
        }
    }
}

/// Terminal result for a single requester of a download
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadResult {
    /// Instance id of the request this result answers
    pub instance: u64,
    pub status: DownloadSnapshot,
    pub outcome: DownloadOutcome,
}

/// Events published to observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    StatusChanged {
        status: DownloadSnapshot,
        started: bool,
    },
    Result(DownloadResult),
}

impl DownloadEvent {
    pub fn item_id(&self) -> &str {
        match self {
            Self::StatusChanged { status, .. } => &status.item_id,
            Self::Result(result) => &result.status.item_id,
        }
    }
}

/// A download request coming from the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDownload {
    pub item_id: String,
    #[serde(default)]
    pub quality: Option<SongAudioQuality>,
    #[serde(default)]
    pub silent: bool,
    /// Correlation token echoed back in the result, allocated if missing
    #[serde(default)]
    pub instance: Option<u64>,
}

impl StartDownload {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            quality: None,
            silent: false,
            instance: None,
        }
    }

    pub fn quality(mut self, quality: SongAudioQuality) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn instance(mut self, instance: u64) -> Self {
        self.instance = Some(instance);
        self
    }
}

/// Control requests accepted by the download service
#[derive(Debug, Clone)]
pub enum DownloadAction {
    Stop,
    StartDownload(StartDownload),
    CancelDownload(String),
    CancelAll,
    PauseResume,
    /// Output only, rejected when received
    StatusChanged,
}

/// Engine configuration, usually derived from [`crate::config::Config`]
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub download_dir: PathBuf,
    pub default_quality: SongAudioQuality,
    pub max_retries: u32,
    pub workers: usize,
    pub pause_backoff: Duration,
    pub notification_debounce: Duration,
    pub connect_timeout: Duration,
}

impl DownloaderConfig {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            default_quality: SongAudioQuality::default(),
            max_retries: 3,
            workers: 3,
            pause_backoff: Duration::from_millis(500),
            notification_debounce: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Map a response content type to the extension the song is stored with
///
/// Parameters such as `; codecs="opus"` are ignored.
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "audio/webm" => Some("webm"),
        "audio/mp4" => Some("mp4"),
        _ => None,
    }
}
