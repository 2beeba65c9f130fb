//! Media source used to resolve what to download
//!
//! The download engine only needs three things from the outside world: a URL
//! for a song at a given quality, the song's display title, and its lyrics.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::downloader::{DownloadError, SongAudioQuality};

/// A resolved stream for a song
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Format {
    pub url: String,
}

#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    /// Resolve the transport URL for `item_id` at `quality`
    async fn resolve_format(
        &self,
        item_id: &str,
        quality: SongAudioQuality,
    ) -> Result<Format, DownloadError>;

    /// Display title used for the finished file name
    async fn resolve_title(&self, item_id: &str) -> Option<String>;

    /// Lyrics text, `None` when the song has none
    async fn fetch_lyrics(&self, item_id: &str) -> Result<Option<String>, DownloadError>;
}

#[derive(Debug, Deserialize)]
struct SongInfo {
    title: Option<String>,
}

/// [`MediaSource`] backed by a JSON HTTP API
#[derive(Debug, Clone)]
pub struct ApiMediaSource {
    client: Client,
    base_url: Url,
}

impl ApiMediaSource {
    pub fn new(base_url: Url) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn song_url(&self, item_id: &str, suffix: &str) -> Result<Url, DownloadError> {
        let path = format!(
            "songs/{}{}",
            urlencoding::encode(item_id),
            suffix
        );
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(&path)
            .map_err(|e| DownloadError::FormatResolution {
                item_id: item_id.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl MediaSource for ApiMediaSource {
    #[instrument(level = "debug", skip(self))]
    async fn resolve_format(
        &self,
        item_id: &str,
        quality: SongAudioQuality,
    ) -> Result<Format, DownloadError> {
        let resolution_error = |reason: String| DownloadError::FormatResolution {
            item_id: item_id.to_string(),
            reason,
        };

        let url = self.song_url(item_id, "/format")?;
        let response = self
            .client
            .get(url)
            .query(&[("quality", quality.to_string())])
            .send()
            .await
            .map_err(|e| resolution_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(resolution_error(format!(
                "format endpoint returned {}",
                response.status()
            )));
        }

        let format: Format = response
            .json()
            .await
            .map_err(|e| resolution_error(e.to_string()))?;
        debug!(url = %format.url, "Resolved format");
        Ok(format)
    }

    async fn resolve_title(&self, item_id: &str) -> Option<String> {
        let url = self.song_url(item_id, "").ok()?;
        let response = match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(item_id, status = %response.status(), "No title available");
                return None;
            }
            Err(e) => {
                warn!(item_id, error = %e, "Failed to fetch song info");
                return None;
            }
        };

        response
            .json::<SongInfo>()
            .await
            .ok()
            .and_then(|info| info.title)
            .filter(|title| !title.trim().is_empty())
    }

    async fn fetch_lyrics(&self, item_id: &str) -> Result<Option<String>, DownloadError> {
        let url = self.song_url(item_id, "/lyrics")?;
        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.text().await?)),
            status => Err(DownloadError::BadStatus {
                item_id: item_id.to_string(),
                status,
            }),
        }
    }
}
