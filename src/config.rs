//! Config module for songdl

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::downloader::{DownloaderConfig, SongAudioQuality};

#[derive(Parser, Debug, Clone)]
pub struct StorageConfig {
    /// Directory finished and partial songs are written to
    #[clap(long, env = "SONGDL_DOWNLOAD_DIR", default_value_t = get_default_download_dir())]
    pub download_dir: String,

    /// Directory lyrics files are saved to, defaults to `<download dir>/lyrics`
    #[clap(long, env = "SONGDL_LYRICS_DIR")]
    pub lyrics_dir: Option<String>,

    /// Re-enqueue every partial download found at startup
    #[clap(long, env = "SONGDL_RESUME_PARTIAL", default_value = "false")]
    pub resume_partial: bool,
}

/// Safely determine the default song directory
fn get_default_download_dir() -> String {
    dirs::audio_dir()
        .or_else(dirs::data_dir)
        .map(|dir| dir.join("songdl"))
        .and_then(|path| path.to_str().map(String::from))
        .unwrap_or_else(|| "songs/".to_string())
}

impl StorageConfig {
    pub fn download_path(&self) -> PathBuf {
        self.download_dir.clone().into()
    }

    pub fn lyrics_path(&self) -> PathBuf {
        match &self.lyrics_dir {
            Some(dir) => dir.into(),
            None => self.download_path().join("lyrics"),
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct TransferConfig {
    /// Audio quality used when a request does not name one
    #[clap(long, env = "SONGDL_AUDIO_QUALITY", value_enum, default_value = "high")]
    pub audio_quality: SongAudioQuality,

    /// Failed fetch attempts allowed per download
    #[clap(long, env = "SONGDL_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Number of downloads transferring at the same time
    #[clap(long, env = "SONGDL_WORKERS", default_value_t = 3)]
    pub workers: usize,

    #[clap(long, env = "SONGDL_PAUSE_BACKOFF_MS", default_value_t = 500)]
    pub pause_backoff_ms: u64,

    #[clap(long, env = "SONGDL_NOTIFICATION_DEBOUNCE_MS", default_value_t = 1000)]
    pub notification_debounce_ms: u64,

    #[clap(long, env = "SONGDL_CONNECT_TIMEOUT_MS", default_value_t = 3000)]
    pub connect_timeout_ms: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct Config {
    #[clap(long, env = "SONGDL_HOST", default_value = "0.0.0.0:3000")]
    pub host: String,

    /// Base URL of the media API used to resolve formats, titles and lyrics
    #[clap(long, env = "SONGDL_API_URL", default_value = "http://127.0.0.1:8080")]
    pub api_url: url::Url,

    #[clap(flatten)]
    pub storage: StorageConfig,

    #[clap(flatten)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Build the engine configuration consumed by the download service
    pub fn downloader_config(&self) -> DownloaderConfig {
        DownloaderConfig {
            download_dir: self.storage.download_path(),
            default_quality: self.transfer.audio_quality,
            max_retries: self.transfer.max_retries,
            workers: self.transfer.workers,
            pause_backoff: Duration::from_millis(self.transfer.pause_backoff_ms),
            notification_debounce: Duration::from_millis(self.transfer.notification_debounce_ms),
            connect_timeout: Duration::from_millis(self.transfer.connect_timeout_ms),
        }
    }
}

pub fn config() -> Config {
    Config::parse()
}
