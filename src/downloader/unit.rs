//! A single song's download: the unit of work tracked by the queue

use std::{
    fmt,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::events::EventBus;
use super::models::{
    DownloadEvent, DownloadOutcome, DownloadResult, DownloadSnapshot, DownloadStatus,
    SongAudioQuality,
};
use crate::library::LocalSongFile;

/// A requester waiting for a download to reach a terminal state
#[derive(Debug)]
pub(crate) struct Waiter {
    pub instance: u64,
    pub reply: Option<oneshot::Sender<DownloadResult>>,
}

#[derive(Debug, Default)]
struct DownloadState {
    silent: bool,
    status: DownloadStatus,
    downloaded: u64,
    total_size: Option<u64>,
    file_path: Option<PathBuf>,
    title: Option<String>,
    waiters: Vec<Waiter>,
    closed: bool,
}

pub struct Download {
    item_id: String,
    quality: SongAudioQuality,
    instance: u64,
    cancel_token: CancellationToken,
    events: EventBus,
    state: Mutex<DownloadState>,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Download")
            .field("item_id", &self.item_id)
            .field("quality", &self.quality)
            .field("silent", &state.silent)
            .field("instance", &self.instance)
            .field("status", &state.status)
            .field("file", &state.file_path)
            .finish()
    }
}

impl Download {
    /// Create a download seeded from whatever is already on disk
    pub fn new(
        item_id: impl Into<String>,
        quality: SongAudioQuality,
        silent: bool,
        instance: u64,
        local_file: Option<LocalSongFile>,
        events: EventBus,
    ) -> Self {
        let mut state = DownloadState {
            silent,
            ..Default::default()
        };

        match local_file {
            Some(LocalSongFile::Complete(path)) => {
                state.status = DownloadStatus::AlreadyFinished;
                state.file_path = Some(path);
            }
            Some(LocalSongFile::Partial { path, size }) => {
                state.downloaded = size;
                state.file_path = Some(path);
            }
            None => {}
        }

        Self {
            item_id: item_id.into(),
            quality,
            instance,
            cancel_token: CancellationToken::new(),
            events,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, DownloadState> {
        // State stays consistent field by field, a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn quality(&self) -> SongAudioQuality {
        self.quality
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn is_silent(&self) -> bool {
        self.state().silent
    }

    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    pub fn status(&self) -> DownloadStatus {
        self.state().status
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    pub fn is_downloading(&self) -> bool {
        self.status().is_downloading()
    }

    /// Move to `status` and broadcast the change.
    ///
    /// Returns `false` when nothing changed or the transition is not allowed.
    pub fn set_status(&self, status: DownloadStatus) -> bool {
        {
            let mut state = self.state();
            if state.status == status {
                return false;
            }
            if !state.status.can_transition_to(status) {
                warn!(
                    item_id = %self.item_id,
                    from = %state.status,
                    to = %status,
                    "Ignoring invalid status transition"
                );
                return false;
            }
            trace!(item_id = %self.item_id, from = %state.status, to = %status, "Status changed");
            state.status = status;
        }
        self.broadcast_status(false);
        true
    }

    pub fn downloaded(&self) -> u64 {
        self.state().downloaded
    }

    pub fn total_size(&self) -> Option<u64> {
        self.state().total_size
    }

    pub fn set_total_size(&self, total_size: Option<u64>) {
        self.state().total_size = total_size;
    }

    /// Count `bytes` more as written and broadcast the new progress
    pub fn add_downloaded(&self, bytes: u64) -> u64 {
        let downloaded = {
            let mut state = self.state();
            state.downloaded += bytes;
            state.downloaded
        };
        self.broadcast_status(false);
        downloaded
    }

    /// Forget every byte received so far
    pub fn reset_progress(&self) {
        let mut state = self.state();
        state.downloaded = 0;
        state.total_size = None;
    }

    /// Fraction downloaded, zero while the total size is unknown
    pub fn progress(&self) -> f32 {
        let state = self.state();
        progress_of(state.downloaded, state.total_size)
    }

    pub fn percent_progress(&self) -> u32 {
        (self.progress() * 100.0) as u32
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.state().file_path.clone()
    }

    pub fn set_file_path(&self, path: Option<PathBuf>) {
        self.state().file_path = path;
    }

    pub fn title(&self) -> Option<String> {
        self.state().title.clone()
    }

    pub fn set_title(&self, title: Option<String>) {
        self.state().title = title;
    }

    /// Request cancellation, honoured at the next checkpoint
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        let state = self.state();
        DownloadSnapshot {
            item_id: self.item_id.clone(),
            status: state.status,
            quality: self.quality,
            progress: progress_of(state.downloaded, state.total_size),
            instance: self.instance,
            file_path: state.file_path.clone(),
            downloaded: state.downloaded,
            total_size: state.total_size,
            silent: state.silent,
        }
    }

    pub fn broadcast_status(&self, started: bool) {
        self.events.publish(DownloadEvent::StatusChanged {
            status: self.snapshot(),
            started,
        });
    }

    /// Broadcast a terminal result for one requester and answer it directly
    pub(crate) fn broadcast_result(&self, outcome: DownloadOutcome, waiter: Waiter) {
        let result = DownloadResult {
            instance: waiter.instance,
            status: self.snapshot(),
            outcome,
        };
        self.events.publish(DownloadEvent::Result(result.clone()));
        if let Some(reply) = waiter.reply {
            // The requester may have stopped listening
            let _ = reply.send(result);
        }
    }

    /// Register a requester for the result.
    ///
    /// Fails with the waiter handed back once the results were sent out.
    pub(crate) fn add_waiter(&self, waiter: Waiter) -> Result<(), Waiter> {
        let mut state = self.state();
        if state.closed {
            return Err(waiter);
        }
        state.waiters.push(waiter);
        Ok(())
    }

    /// Take every requester and refuse new ones
    pub(crate) fn take_waiters(&self) -> Vec<Waiter> {
        let mut state = self.state();
        state.closed = true;
        std::mem::take(&mut state.waiters)
    }
}

fn progress_of(downloaded: u64, total_size: Option<u64>) -> f32 {
    match total_size {
        Some(total) if total > 0 => (downloaded as f32 / total as f32).min(1.0),
        _ => 0.0,
    }
}
