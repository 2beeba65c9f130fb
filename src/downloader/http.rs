//! HTTP transfer of a single download attempt
//!
//! One call to [`Fetcher::perform_download`] resolves a URL, opens a ranged
//! request at the current byte offset and streams the body into the `.part`
//! file, checking for stop, cancellation and pause after every chunk.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytesize::ByteSize;
use futures_util::StreamExt;
use reqwest::{
    Client, Response, StatusCode,
    header::{self, HeaderMap, HeaderValue},
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, info, instrument, trace, warn};

use super::error::{DownloadError, Result};
use super::models::{DownloadStatus, DownloaderConfig, extension_for_content_type};
use super::queue::DownloadQueue;
use super::service::QueueControl;
use super::unit::Download;
use crate::library::{LocalLibrary, part_extension, part_file_name};
use crate::postprocess::{self, FinishedSong, PostProcessor};
use crate::source::MediaSource;

pub struct Fetcher {
    client: Client,
    library: Arc<LocalLibrary>,
    source: Arc<dyn MediaSource>,
    processors: Vec<Arc<dyn PostProcessor>>,
    queue: Arc<DownloadQueue>,
    control: Arc<QueueControl>,
}

/// How the body stream ended when it did not fail
enum StreamEnd {
    Complete,
    Interrupted(DownloadStatus),
}

impl Fetcher {
    pub fn new(
        config: &DownloaderConfig,
        source: Arc<dyn MediaSource>,
        processors: Vec<Arc<dyn PostProcessor>>,
        queue: Arc<DownloadQueue>,
        control: Arc<QueueControl>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            library: queue.library().clone(),
            source,
            processors,
            queue,
            control,
        })
    }

    fn on_progress(&self) {
        self.queue.refresh_notification(self.control.is_paused());
    }

    /// Run one attempt.
    ///
    /// `Ok(Some(path))` means the song is finished at `path`, `Ok(None)` that
    /// the attempt stopped at a checkpoint (pause, cancel or stop).
    #[instrument(
        name = "fetch_attempt",
        level = "debug",
        skip(self, download),
        fields(item_id = %download.item_id(), offset = download.downloaded())
    )]
    pub async fn perform_download(&self, download: &Download) -> Result<Option<PathBuf>> {
        let item_id = download.item_id();
        let format = self
            .source
            .resolve_format(item_id, download.quality())
            .await?;

        if download.title().is_none() {
            download.set_title(self.source.resolve_title(item_id).await);
        }

        let mut resume_from = download.downloaded();
        let response = self
            .client
            .get(&format.url)
            .header(header::RANGE, format!("bytes={resume_from}-"))
            .send()
            .await
            .map_err(|source| DownloadError::Connection {
                url: format.url.clone(),
                source,
            })?;

        let status = response.status();
        trace!(%status, "Got response");
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::BadStatus {
                item_id: item_id.to_string(),
                status,
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let extension = extension_for_content_type(&content_type)
            .ok_or(DownloadError::UnsupportedContentType(content_type))?;

        self.library.ensure_dir().await?;
        let part_path = self.part_path(download, extension).await?;

        if status == StatusCode::OK && resume_from > 0 {
            warn!(
                resume_from,
                "Server ignored the range request, restarting from the beginning"
            );
            download.reset_progress();
            resume_from = 0;
        }

        let total_size = total_size(&response, resume_from);
        match total_size {
            Some(size) => info!(size = %ByteSize(size), path = ?part_path, "Starting download"),
            None => info!(path = ?part_path, "Starting download of unknown size"),
        }

        let mut file = open_part_file(&part_path, resume_from).await?;
        download.set_file_path(Some(part_path.clone()));
        download.set_total_size(total_size);
        download.set_status(DownloadStatus::Downloading);
        self.on_progress();

        let streamed = self.stream_body(download, response, &mut file).await;
        let flushed = file.flush().await;
        drop(file);

        match streamed {
            Ok(StreamEnd::Interrupted(status)) => {
                info!(downloaded = download.downloaded(), %status, "Download interrupted");
                download.set_status(status);
                return Ok(None);
            }
            Err(e) => {
                warn!(downloaded = download.downloaded(), error = %e, "Download stream failed");
                download.set_status(DownloadStatus::Cancelled);
                return Err(e);
            }
            Ok(StreamEnd::Complete) => flushed?,
        }

        info!(size = %ByteSize(download.downloaded()), "Download completed");
        let final_path = self.finish(download, &part_path, extension).await?;
        Ok(Some(final_path))
    }

    /// Reuse the partial file already on disk or name a new one
    async fn part_path(&self, download: &Download, extension: &str) -> Result<PathBuf> {
        let Some(existing) = download.file_path() else {
            return Ok(self
                .library
                .dir()
                .join(part_file_name(download.item_id(), extension)));
        };

        let found = existing
            .file_name()
            .and_then(|name| part_extension(&name.to_string_lossy()).map(String::from));

        match found {
            Some(found) if found == extension => Ok(existing),
            found => {
                warn!(?existing, ?found, extension, "Discarding partial file of another format");
                if let Err(e) = tokio::fs::remove_file(&existing).await {
                    debug!(error = %e, "Failed to remove stale partial file");
                }
                download.reset_progress();
                download.set_file_path(None);
                Err(DownloadError::PartialMismatch {
                    found: found.unwrap_or_default(),
                    expected: extension.to_string(),
                })
            }
        }
    }

    #[instrument(name = "download_chunks", level = "trace", skip_all, fields(item_id = %download.item_id()))]
    async fn stream_body(
        &self,
        download: &Download,
        response: Response,
        file: &mut File,
    ) -> Result<StreamEnd> {
        let mut stream = response.bytes_stream();
        let mut milestone = milestone_of(download.progress());

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| DownloadError::Stream {
                bytes_downloaded: download.downloaded(),
                source,
            })?;

            if let Some(status) = self.control.checkpoint(download) {
                return Ok(StreamEnd::Interrupted(status));
            }

            file.write_all(&chunk).await?;
            let downloaded = download.add_downloaded(chunk.len() as u64);
            trace!(bytes = downloaded, chunk_size = chunk.len(), "Received chunk");

            let reached = milestone_of(download.progress());
            if reached > milestone {
                milestone = reached;
                info!(
                    percentage = reached * 25,
                    bytes = downloaded,
                    "Download milestone"
                );
            }

            self.on_progress();
        }

        Ok(StreamEnd::Complete)
    }

    /// Post-process the finished partial file and move it to its final name
    async fn finish(&self, download: &Download, part_path: &Path, extension: &str) -> Result<PathBuf> {
        let item_id = download.item_id();
        let title = download.title();
        let final_path = self
            .library
            .claim_final_path(item_id, title.as_deref().unwrap_or(item_id), extension)
            .await?;
        let target_file_name = final_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let song = FinishedSong {
            item_id: item_id.to_string(),
            quality: download.quality(),
            data_path: part_path.to_path_buf(),
            target_file_name,
            title,
            size: download.downloaded(),
        };
        postprocess::run_all(&self.processors, &song).await;

        if let Err(e) = tokio::fs::rename(part_path, &final_path).await {
            let _ = tokio::fs::remove_file(&final_path).await;
            return Err(e.into());
        }
        if let Err(e) = self.library.record_finished(item_id, &final_path).await {
            warn!(error = %e, "Failed to record finished song in the library index");
        }

        download.set_file_path(Some(final_path.clone()));
        download.set_status(DownloadStatus::Finished);
        debug!(path = ?final_path, "Song moved to its final name");
        Ok(final_path)
    }
}

fn milestone_of(progress: f32) -> u32 {
    (progress * 4.0) as u32
}

/// Full size of the song, counting bytes received by earlier attempts
fn total_size(response: &Response, resume_from: u64) -> Option<u64> {
    if let Some(length) = response.content_length() {
        return Some(length + resume_from);
    }

    // Content-Range: bytes 100-999/1000
    response
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|range| range.to_str().ok())
        .and_then(|range| range.rsplit_once('/'))
        .and_then(|(_, total)| total.parse::<u64>().ok())
}

/// Open the partial file positioned at `resume_from`, dropping any bytes past it
async fn open_part_file(path: &Path, resume_from: u64) -> std::io::Result<File> {
    if resume_from == 0 {
        return File::create(path).await;
    }

    let mut file = OpenOptions::new().write(true).create(true).open(path).await?;
    file.set_len(resume_from).await?;
    file.seek(SeekFrom::End(0)).await?;
    Ok(file)
}
