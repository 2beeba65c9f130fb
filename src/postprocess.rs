//! Best-effort work done after a song finished streaming
//!
//! Processors run concurrently once the body has been written and before the
//! partial file is renamed. A failing processor is logged and otherwise
//! ignored.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::downloader::{DownloadError, SongAudioQuality};
use crate::library::sanitize_file_stem;
use crate::source::MediaSource;

/// What a processor gets to look at
#[derive(Debug, Clone)]
pub struct FinishedSong {
    pub item_id: String,
    pub quality: SongAudioQuality,
    /// Where the bytes currently are (the `.part` file)
    pub data_path: PathBuf,
    /// File name the song is about to be renamed to
    pub target_file_name: String,
    pub title: Option<String>,
    pub size: u64,
}

impl FinishedSong {
    fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.item_id)
    }
}

#[async_trait]
pub trait PostProcessor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn process(&self, song: &FinishedSong) -> Result<(), DownloadError>;
}

/// Run every processor, logging failures
pub async fn run_all(processors: &[Arc<dyn PostProcessor>], song: &FinishedSong) {
    let results = futures::future::join_all(
        processors
            .iter()
            .map(|processor| async move { (processor.name(), processor.process(song).await) }),
    )
    .await;

    for (name, result) in results {
        match result {
            Ok(()) => debug!(processor = name, item_id = %song.item_id, "Post-processing done"),
            Err(e) => warn!(
                processor = name,
                item_id = %song.item_id,
                error = %e,
                "Post-processing failed, keeping download"
            ),
        }
    }
}

/// Saves lyrics next to the song library as `<title>.lrc`
pub struct LyricsProcessor {
    source: Arc<dyn MediaSource>,
    lyrics_dir: PathBuf,
}

impl LyricsProcessor {
    pub fn new(source: Arc<dyn MediaSource>, lyrics_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            lyrics_dir: lyrics_dir.into(),
        }
    }
}

#[async_trait]
impl PostProcessor for LyricsProcessor {
    fn name(&self) -> &'static str {
        "lyrics"
    }

    async fn process(&self, song: &FinishedSong) -> Result<(), DownloadError> {
        let path = self
            .lyrics_dir
            .join(format!("{}.lrc", sanitize_file_stem(song.display_title())));

        if tokio::fs::try_exists(&path).await? {
            debug!(?path, "Lyrics already saved");
            return Ok(());
        }

        let Some(lyrics) = self.source.fetch_lyrics(&song.item_id).await? else {
            debug!(item_id = %song.item_id, "No lyrics available");
            return Ok(());
        };

        tokio::fs::create_dir_all(&self.lyrics_dir).await?;
        tokio::fs::write(&path, lyrics).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SongMetadata<'a> {
    item_id: &'a str,
    title: &'a str,
    quality: SongAudioQuality,
    size: u64,
    file_name: &'a str,
    downloaded_at: DateTime<Utc>,
}

/// Writes a `<song file>.json` sidecar describing the download
pub struct MetadataProcessor {
    dir: PathBuf,
}

impl MetadataProcessor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PostProcessor for MetadataProcessor {
    fn name(&self) -> &'static str {
        "metadata"
    }

    async fn process(&self, song: &FinishedSong) -> Result<(), DownloadError> {
        let metadata = SongMetadata {
            item_id: &song.item_id,
            title: song.display_title(),
            quality: song.quality,
            size: song.size,
            file_name: &song.target_file_name,
            downloaded_at: Utc::now(),
        };

        let path = self.dir.join(format!("{}.json", song.target_file_name));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&metadata)?).await?;
        Ok(())
    }
}
