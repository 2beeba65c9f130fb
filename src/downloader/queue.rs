//! Download queue management
//!
//! The queue owns every download that is waiting for or running a fetch
//! loop, at most one per item id, together with the counters of the current
//! session. All mutation goes through one lock.

use std::{
    io,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, trace};

use super::events::EventBus;
use super::models::{DownloadOutcome, DownloadSnapshot, SongAudioQuality};
use super::progress::{self, Notification, NotificationUpdate, QueueView, UnitProgress};
use super::unit::Download;
use crate::library::LocalLibrary;

/// Counters of the current session, reset when the queue goes from empty to
/// non-empty
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SessionStats {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    downloads: Vec<Arc<Download>>,
    completed: usize,
    failed: usize,
    cancelled: bool,
    started_at: Option<DateTime<Utc>>,
    notification_visible: bool,
    notification_updated: Option<Instant>,
}

impl QueueState {
    fn find(&self, item_id: &str) -> Option<&Arc<Download>> {
        self.downloads.iter().find(|d| d.item_id() == item_id)
    }

    fn view(&self, paused: bool) -> QueueView {
        QueueView {
            units: self
                .downloads
                .iter()
                .map(|download| {
                    let snapshot = download.snapshot();
                    UnitProgress {
                        item_id: snapshot.item_id,
                        title: download.title(),
                        status: snapshot.status,
                        progress: snapshot.progress,
                        silent: snapshot.silent,
                    }
                })
                .collect(),
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            paused,
            started_at: self.started_at,
        }
    }
}

/// Result of [`DownloadQueue::get_or_create`]
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub download: Arc<Download>,
    /// A new download was inserted and needs a fetch loop
    pub created: bool,
}

#[derive(Debug)]
pub struct DownloadQueue {
    library: Arc<LocalLibrary>,
    events: EventBus,
    next_instance: AtomicU64,
    notification_tx: watch::Sender<Option<Notification>>,
    state: Mutex<QueueState>,
}

impl DownloadQueue {
    pub fn new(library: Arc<LocalLibrary>, events: EventBus) -> Self {
        let (notification_tx, _) = watch::channel(None);
        Self {
            library,
            events,
            next_instance: AtomicU64::new(0),
            notification_tx,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn library(&self) -> &Arc<LocalLibrary> {
        &self.library
    }

    /// Return the queued download for `item_id` or create one.
    ///
    /// A new download is seeded from the files on disk. One whose song is
    /// already complete comes back as `AlreadyFinished` and is not queued.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_or_create(
        &self,
        item_id: &str,
        quality: SongAudioQuality,
        silent: bool,
    ) -> io::Result<QueueEntry> {
        if let Some(download) = self.get(item_id) {
            return Ok(QueueEntry {
                download,
                created: false,
            });
        }

        // Disk lookup happens outside the lock, the queue is checked again below
        let local_file = self.library.find_local_file(item_id).await?;

        let mut state = self.state();
        if let Some(download) = state.find(item_id) {
            return Ok(QueueEntry {
                download: download.clone(),
                created: false,
            });
        }

        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
        let download = Arc::new(Download::new(
            item_id,
            quality,
            silent,
            instance,
            local_file,
            self.events.clone(),
        ));

        if download.is_finished() {
            debug!(item_id, "Song already downloaded");
            return Ok(QueueEntry {
                download,
                created: false,
            });
        }

        if state.downloads.is_empty() {
            trace!("Starting a new download session");
            state.completed = 0;
            state.failed = 0;
            state.cancelled = false;
            state.started_at = Some(Utc::now());
            state.notification_visible = false;
        }
        if !silent {
            state.notification_visible = true;
        }

        info!(item_id, instance, downloaded = download.downloaded(), "Adding download to queue");
        state.downloads.push(download.clone());

        Ok(QueueEntry {
            download,
            created: true,
        })
    }

    /// Make a queued download count towards the visible notification
    pub fn make_visible(&self, download: &Download) {
        let mut state = self.state();
        download.set_silent(false);
        state.notification_visible = true;
    }

    pub fn get(&self, item_id: &str) -> Option<Arc<Download>> {
        self.state().find(item_id).cloned()
    }

    pub fn find(&self, item_id: &str) -> Option<DownloadSnapshot> {
        self.state().find(item_id).map(|d| d.snapshot())
    }

    pub fn list_all(&self) -> Vec<DownloadSnapshot> {
        self.state().downloads.iter().map(|d| d.snapshot()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state().downloads.is_empty()
    }

    /// Flag a download as cancelled, the fetch loop removes it
    pub fn cancel(&self, item_id: &str) -> bool {
        match self.state().find(item_id) {
            Some(download) => {
                info!(item_id, "Cancelling download");
                download.cancel();
                true
            }
            None => {
                debug!(item_id, "Attempted to cancel a download that is not queued");
                false
            }
        }
    }

    pub fn cancel_all(&self) -> usize {
        let state = self.state();
        info!(count = state.downloads.len(), "Cancelling all downloads");
        for download in &state.downloads {
            download.cancel();
        }
        state.downloads.len()
    }

    /// Remove a download whose fetch loop ended and count its outcome
    pub fn finish(&self, download: &Arc<Download>, outcome: &DownloadOutcome) -> SessionStats {
        let mut state = self.state();
        state.downloads.retain(|d| !Arc::ptr_eq(d, download));

        if outcome.is_success() {
            state.completed += 1;
        } else {
            state.failed += 1;
        }
        if state.downloads.is_empty() {
            state.cancelled = download.is_cancelled();
        }

        debug!(
            item_id = download.item_id(),
            completed = state.completed,
            failed = state.failed,
            remaining = state.downloads.len(),
            "Download removed from queue"
        );

        SessionStats {
            active: state.downloads.len(),
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
        }
    }

    pub fn session(&self) -> SessionStats {
        let state = self.state();
        SessionStats {
            active: state.downloads.len(),
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
        }
    }

    pub fn view(&self, paused: bool) -> QueueView {
        self.state().view(paused)
    }

    pub fn total_progress(&self) -> f32 {
        progress::total_progress(&self.view(false))
    }

    /// Recompute the host notification and publish it if it changed
    pub fn refresh_notification(&self, paused: bool) {
        let mut state = self.state();
        let view = state.view(paused);

        match progress::render_notification(&view, state.notification_visible, Utc::now()) {
            NotificationUpdate::Unchanged => return,
            NotificationUpdate::Show(notification) => {
                self.notification_tx.send_if_modified(|current| {
                    if current.as_ref() == Some(&notification) {
                        false
                    } else {
                        *current = Some(notification);
                        true
                    }
                });
            }
            NotificationUpdate::Dismiss => {
                self.notification_tx.send_if_modified(|current| current.take().is_some());
            }
        }
        state.notification_updated = Some(Instant::now());
    }

    pub fn notification_updated(&self) -> Option<Instant> {
        self.state().notification_updated
    }

    pub fn notification(&self) -> Option<Notification> {
        self.notification_tx.borrow().clone()
    }

    pub fn watch_notification(&self) -> watch::Receiver<Option<Notification>> {
        self.notification_tx.subscribe()
    }
}
