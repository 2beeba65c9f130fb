//! Download service: control requests, the worker pool and the retry loop
//!
//! [`DownloadService`] is a cheap cloneable handle. Every accepted request
//! either answers immediately (the song is already on disk), joins the
//! download already queued for the same item, or queues a new download and
//! spawns its retry loop. At most `workers` loops transfer at the same time.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Notify, Semaphore, broadcast, oneshot, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::error::{DownloadError, Result};
use super::events::EventBus;
use super::http::Fetcher;
use super::models::{
    DownloadAction, DownloadEvent, DownloadOutcome, DownloadResult, DownloadSnapshot,
    DownloadStatus, DownloaderConfig, StartDownload,
};
use super::progress::{self, Notification};
use super::queue::{DownloadQueue, SessionStats};
use super::unit::{Download, Waiter};
use crate::library::{self, LocalLibrary};
use crate::postprocess::PostProcessor;
use crate::source::MediaSource;

/// Global pause and stop flags, checked cooperatively by every download
#[derive(Debug, Default)]
pub struct QueueControl {
    stop: CancellationToken,
    paused: AtomicBool,
    resumed: Notify,
}

impl QueueControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        let was = self.paused.swap(paused, Ordering::SeqCst);
        if was && !paused {
            self.resumed.notify_waiters();
        }
    }

    /// Flip the pause flag, returns the new value
    pub fn toggle_pause(&self) -> bool {
        let paused = !self.paused.fetch_xor(true, Ordering::SeqCst);
        if !paused {
            self.resumed.notify_waiters();
        }
        paused
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Status a running transfer has to stop with, if any.
    ///
    /// Stop and cancellation win over pause.
    pub fn checkpoint(&self, download: &Download) -> Option<DownloadStatus> {
        if self.is_stopping() || download.is_cancelled() {
            Some(DownloadStatus::Cancelled)
        } else if self.is_paused() {
            Some(DownloadStatus::Paused)
        } else {
            None
        }
    }

    /// Sleep for at most `backoff` while paused, waking early on resume,
    /// cancellation or stop
    pub async fn wait_while_paused(&self, backoff: Duration, cancel: &CancellationToken) {
        let resumed = self.resumed.notified();
        if !self.is_paused() {
            return;
        }

        tokio::select! {
            _ = resumed => {}
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => {}
            _ = self.stop.cancelled() => {}
        }
    }
}

/// Handle returned to a requester, resolves once its download ends
#[derive(Debug)]
pub struct DownloadHandle {
    pub instance: u64,
    pub item_id: String,
    result_rx: oneshot::Receiver<DownloadResult>,
}

impl DownloadHandle {
    /// Wait for the download to end and return the result for this request
    pub async fn wait_until_done(self) -> Result<DownloadResult> {
        self.result_rx
            .await
            .map_err(|_| DownloadError::ServiceStopped)
    }

    /// Result if the download already ended
    pub fn try_result(&mut self) -> Option<DownloadResult> {
        self.result_rx.try_recv().ok()
    }
}

struct ServiceInner {
    config: DownloaderConfig,
    queue: Arc<DownloadQueue>,
    control: Arc<QueueControl>,
    fetcher: Fetcher,
    events: EventBus,
    workers: Arc<Semaphore>,
    tasks: TaskTracker,
    next_request: AtomicU64,
}

#[derive(Clone)]
pub struct DownloadService {
    inner: Arc<ServiceInner>,
}

impl DownloadService {
    pub fn new(
        mut config: DownloaderConfig,
        source: Arc<dyn MediaSource>,
        processors: Vec<Arc<dyn PostProcessor>>,
    ) -> Result<Self> {
        // Every download gets at least one attempt
        config.max_retries = config.max_retries.max(1);

        let events = EventBus::new();
        let library = Arc::new(LocalLibrary::new(config.download_dir.clone()));
        let queue = Arc::new(DownloadQueue::new(library, events.clone()));
        let control = Arc::new(QueueControl::new());
        let fetcher = Fetcher::new(&config, source, processors, queue.clone(), control.clone())?;

        info!(
            dir = ?config.download_dir,
            workers = config.workers,
            max_retries = config.max_retries,
            "Download service ready"
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                config,
                queue,
                control,
                fetcher,
                events,
                tasks: TaskTracker::new(),
                next_request: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.inner.config
    }

    /// Dispatch a control request
    pub async fn handle_action(&self, action: DownloadAction) -> Result<Option<DownloadHandle>> {
        match action {
            DownloadAction::Stop => self.stop(),
            DownloadAction::StartDownload(request) => return self.start_download(request).await.map(Some),
            DownloadAction::CancelDownload(item_id) => {
                self.cancel_download(&item_id);
            }
            DownloadAction::CancelAll => {
                self.cancel_all();
            }
            DownloadAction::PauseResume => {
                self.pause_resume();
            }
            DownloadAction::StatusChanged => return Err(DownloadError::OutputOnlyAction),
        }
        Ok(None)
    }

    /// Request a song.
    ///
    /// The returned handle resolves with a result tagged with the request's
    /// instance id, even when several requests share one transfer.
    #[tracing::instrument(level = "debug", skip_all, fields(item_id = %request.item_id))]
    pub async fn start_download(&self, request: StartDownload) -> Result<DownloadHandle> {
        let inner = &self.inner;
        if inner.control.is_stopping() {
            return Err(DownloadError::ServiceStopped);
        }
        if !library::is_valid_item_id(&request.item_id) {
            return Err(DownloadError::InvalidItemId(request.item_id));
        }

        let instance = request
            .instance
            .unwrap_or_else(|| inner.next_request.fetch_add(1, Ordering::SeqCst));
        let quality = request.quality.unwrap_or(inner.config.default_quality);
        let (reply, result_rx) = oneshot::channel();
        let mut waiter = Waiter {
            instance,
            reply: Some(reply),
        };

        loop {
            let entry = inner
                .queue
                .get_or_create(&request.item_id, quality, request.silent)
                .await?;
            let download = entry.download;

            if !request.silent && download.is_silent() {
                inner.queue.make_visible(&download);
            }

            if download.is_finished() {
                let path = download.file_path().unwrap_or_default();
                download.broadcast_result(DownloadOutcome::Success(path), waiter);
                break;
            }

            if entry.created {
                // A fresh download cannot have sent its results yet
                let _ = download.add_waiter(waiter);
                download.broadcast_status(true);
                self.spawn_download(download);
                break;
            }

            if inner.control.is_paused() && download.is_downloading() {
                debug!("Resuming queue for a repeated request");
                inner.control.set_paused(false);
            }
            match download.add_waiter(waiter) {
                Ok(()) => {
                    debug!(instance, "Joined download already in progress");
                    break;
                }
                // The download ended while we looked it up, ask the queue again
                Err(returned) => waiter = returned,
            }
        }

        inner.queue.refresh_notification(inner.control.is_paused());

        Ok(DownloadHandle {
            instance,
            item_id: request.item_id,
            result_rx,
        })
    }

    fn spawn_download(&self, download: Arc<Download>) {
        let inner = self.inner.clone();
        let span = info_span!(
            "download_task",
            item_id = %download.item_id(),
            instance = download.instance()
        );
        self.inner
            .tasks
            .spawn(async move { inner.run_download(download).await }.instrument(span));
    }

    pub fn cancel_download(&self, item_id: &str) -> bool {
        self.inner.queue.cancel(item_id)
    }

    pub fn cancel_all(&self) -> usize {
        self.inner.queue.cancel_all()
    }

    /// Toggle the global pause flag, returns whether the queue is now paused
    pub fn pause_resume(&self) -> bool {
        let paused = self.inner.control.toggle_pause();
        info!(paused, "Download queue pause toggled");
        self.inner.queue.refresh_notification(paused);
        paused
    }

    pub fn is_paused(&self) -> bool {
        self.inner.control.is_paused()
    }

    /// Stop accepting requests and wind down every download at its next
    /// checkpoint
    pub fn stop(&self) {
        info!("Download service stopping...");
        self.inner.control.stop();
        self.inner.tasks.close();
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.control.is_stopping()
    }

    /// Resolves once the service was asked to stop
    pub async fn stopped(&self) {
        self.inner.control.stop.cancelled().await
    }

    /// Stop and wait until every download task returned
    pub async fn shutdown(&self) {
        self.stop();
        self.inner.tasks.wait().await;
        info!("Download service stopped");
    }

    pub fn list_all(&self) -> Vec<DownloadSnapshot> {
        self.inner.queue.list_all()
    }

    pub fn find(&self, item_id: &str) -> Option<DownloadSnapshot> {
        self.inner.queue.find(item_id)
    }

    pub fn session(&self) -> SessionStats {
        self.inner.queue.session()
    }

    pub fn total_progress(&self) -> f32 {
        self.inner.queue.total_progress()
    }

    pub fn summary_text(&self) -> Option<String> {
        progress::summary_text(&self.inner.queue.view(self.is_paused()))
    }

    pub fn notification(&self) -> Option<Notification> {
        self.inner.queue.notification()
    }

    pub fn watch_notification(&self) -> watch::Receiver<Option<Notification>> {
        self.inner.queue.watch_notification()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Queue every partial download left on disk as a silent download
    pub async fn resume_partial_downloads(&self) -> Result<Vec<DownloadHandle>> {
        let ids = self.inner.queue.library().in_progress_ids().await?;
        let mut handles = Vec::with_capacity(ids.len());
        for item_id in ids {
            info!(item_id, "Resuming partial download");
            handles.push(
                self.start_download(StartDownload::new(item_id).silent(true))
                    .await?,
            );
        }
        Ok(handles)
    }
}

impl ServiceInner {
    async fn run_download(&self, download: Arc<Download>) {
        let permit = tokio::select! {
            permit = self.workers.clone().acquire_owned() => permit.ok(),
            _ = self.control.stop.cancelled() => None,
            _ = download.cancel_token().cancelled() => None,
        };

        let outcome = match permit {
            Some(_permit) => self.retry_loop(&download).await,
            None => DownloadOutcome::Cancelled,
        };

        if !outcome.is_success() && (download.is_cancelled() || self.control.is_stopping()) {
            download.set_status(DownloadStatus::Cancelled);
        }

        let stats = self.queue.finish(&download, &outcome);
        match &outcome {
            DownloadOutcome::Success(path) => info!(?path, "Download finished"),
            DownloadOutcome::Failure(e) => error!(error = %e, "Download failed"),
            DownloadOutcome::Cancelled => info!("Download cancelled"),
        }
        debug!(?stats, "Session counters updated");

        for waiter in download.take_waiters() {
            download.broadcast_result(outcome.clone(), waiter);
        }

        // Keep the last refresh from flickering right after the previous one
        if let Some(updated) = self.queue.notification_updated() {
            let elapsed = updated.elapsed();
            if elapsed < self.config.notification_debounce {
                tokio::time::sleep(self.config.notification_debounce - elapsed).await;
            }
        }
        self.queue.refresh_notification(self.control.is_paused());
    }

    /// Drive one download until it finishes, fails `max_retries` times, or is
    /// cancelled
    async fn retry_loop(&self, download: &Download) -> DownloadOutcome {
        let mut result: Option<Result<Option<PathBuf>>> = None;
        let mut failures = 0;

        loop {
            let keep_going = match &result {
                None | Some(Err(_)) => true,
                Some(Ok(Some(_))) => false,
                Some(Ok(None)) => matches!(
                    download.status(),
                    DownloadStatus::Idle | DownloadStatus::Paused
                ),
            };
            if !keep_going
                || failures >= self.config.max_retries
                || self.control.is_stopping()
                || download.is_cancelled()
            {
                break;
            }

            if self.control.is_paused() {
                self.queue.refresh_notification(true);
                self.control
                    .wait_while_paused(self.config.pause_backoff, download.cancel_token())
                    .await;
                continue;
            }

            let attempt = self.fetcher.perform_download(download).await;
            if let Err(e) = &attempt {
                failures += 1;
                warn!(
                    attempt = failures,
                    max_retries = self.config.max_retries,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Download attempt failed"
                );
            }
            result = Some(attempt);
        }

        match result {
            Some(Ok(Some(path))) => DownloadOutcome::Success(path),
            _ if download.is_cancelled() || self.control.is_stopping() => DownloadOutcome::Cancelled,
            Some(Err(e)) => {
                error!(failures, error = %e, "Giving up on download");
                DownloadOutcome::Failure(e.to_string())
            }
            _ => DownloadOutcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::NotificationKind;
    use crate::source::Format;
    use async_trait::async_trait;
    use mockito::{Matcher, Server};
    use std::path::Path;

    /// Resolves every song to `<base>/audio/<id>`, optionally held back by a gate
    struct TestSource {
        base: String,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl MediaSource for TestSource {
        async fn resolve_format(
            &self,
            item_id: &str,
            _quality: crate::downloader::SongAudioQuality,
        ) -> Result<Format> {
            let _ = self.gate.acquire().await;
            Ok(Format {
                url: format!("{}/audio/{item_id}", self.base),
            })
        }

        async fn resolve_title(&self, item_id: &str) -> Option<String> {
            Some(format!("Song {item_id}"))
        }

        async fn fetch_lyrics(&self, _item_id: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn open_source(server: &Server) -> Arc<TestSource> {
        source_at(server.url())
    }

    fn source_at(base: String) -> Arc<TestSource> {
        Arc::new(TestSource {
            base,
            gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        })
    }

    fn gated_source(server: &Server) -> Arc<TestSource> {
        Arc::new(TestSource {
            base: server.url(),
            gate: Arc::new(Semaphore::new(0)),
        })
    }

    fn service(dir: &Path, source: Arc<TestSource>, workers: usize) -> DownloadService {
        let mut config = DownloaderConfig::new(dir);
        config.workers = workers;
        config.pause_backoff = Duration::from_millis(20);
        config.notification_debounce = Duration::ZERO;
        DownloadService::new(config, source, Vec::new()).unwrap()
    }

    async fn done(handle: DownloadHandle) -> DownloadResult {
        tokio::time::timeout(Duration::from_secs(10), handle.wait_until_done())
            .await
            .expect("download did not finish in time")
            .unwrap()
    }

    async fn wait_for_snapshot(
        service: &DownloadService,
        item_id: &str,
        ready: impl Fn(&DownloadSnapshot) -> bool,
    ) -> DownloadSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(snapshot) = service.find(item_id).filter(|s| ready(s)) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("download never reached the expected state")
    }

    enum Step {
        Send(&'static [u8]),
        WaitFor(Arc<Notify>),
    }

    /// Bare HTTP server playing one script per connection, so a body can be
    /// held or cut off halfway. Returns its url and the request heads it saw.
    async fn scripted_server(scripts: Vec<Vec<Step>>) -> (String, Arc<std::sync::Mutex<Vec<String>>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = requests.clone();

        tokio::spawn(async move {
            for script in scripts {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                seen.lock().unwrap().push(String::from_utf8_lossy(&head).to_lowercase());

                for step in script {
                    match step {
                        Step::Send(bytes) => {
                            let _ = socket.write_all(bytes).await;
                            let _ = socket.flush().await;
                        }
                        Step::WaitFor(signal) => signal.notified().await,
                    }
                }
                // Dropping the socket ends the response
            }
        });

        (url, requests)
    }

    const FIRST_HALF: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-type: audio/webm\r\ncontent-length: 8\r\nconnection: close\r\n\r\naaaa";
    const SECOND_HALF: &[u8] = b"HTTP/1.1 206 Partial Content\r\ncontent-type: audio/webm\r\ncontent-length: 4\r\ncontent-range: bytes 4-7/8\r\nconnection: close\r\n\r\nbbbb";

    #[tokio::test]
    async fn test_download_success() {
        let mut server = Server::new_async().await;
        let body = vec![7u8; 1000];
        let mock = server
            .mock("GET", "/audio/abc")
            .with_header("content-type", "audio/webm")
            .with_body(&body)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), open_source(&server), 3);
        let mut events = service.subscribe();

        let handle = service
            .start_download(StartDownload::new("abc").instance(7))
            .await
            .unwrap();
        assert_eq!(handle.instance, 7);
        let result = done(handle).await;

        assert_eq!(result.instance, 7);
        let path = result.outcome.path().cloned().unwrap();
        assert_eq!(path, dir.path().join("Song abc.webm"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), body);
        assert_eq!(result.status.status, DownloadStatus::Finished);
        assert!(!dir.path().join("abc.webm.part").exists());
        mock.assert_async().await;

        match events.try_recv().unwrap() {
            DownloadEvent::StatusChanged { status, started } => {
                assert!(started);
                assert_eq!(status.item_id, "abc");
            }
            other => panic!("unexpected first event {other:?}"),
        }
        let mut last_progress = 0.0;
        let mut saw_result = false;
        while let Ok(event) = events.try_recv() {
            match event {
                DownloadEvent::StatusChanged { status, started } => {
                    assert!(!started);
                    assert!(status.progress >= last_progress);
                    last_progress = status.progress;
                }
                DownloadEvent::Result(r) => {
                    assert_eq!(r.instance, 7);
                    saw_result = true;
                }
            }
        }
        assert_eq!(last_progress, 1.0);
        assert!(saw_result);

        assert!(service.list_all().is_empty());
        assert_eq!(service.session().completed, 1);
        assert_eq!(service.total_progress(), 1.0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_transfer() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/audio/B")
            .with_header("content-type", "audio/mp4")
            .with_body("song bytes")
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = gated_source(&server);
        let service = service(dir.path(), source.clone(), 3);

        let first = service
            .start_download(StartDownload::new("B").instance(1))
            .await
            .unwrap();
        let second = service
            .start_download(StartDownload::new("B").instance(2))
            .await
            .unwrap();
        assert_eq!(service.list_all().len(), 1);

        source.gate.add_permits(Semaphore::MAX_PERMITS);
        let (first, second) = tokio::join!(done(first), done(second));

        assert_eq!(first.instance, 1);
        assert_eq!(second.instance, 2);
        assert_eq!(first.outcome, second.outcome);
        assert!(first.outcome.is_success());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_resume_from_partial_file() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/audio/abc")
            .match_header("range", "bytes=4-")
            .with_status(206)
            .with_header("content-type", "audio/webm")
            .with_body("456789")
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("abc.webm.part"), "0123")
            .await
            .unwrap();
        let service = service(dir.path(), open_source(&server), 3);

        let result = done(service.start_download(StartDownload::new("abc")).await.unwrap()).await;

        let path = result.outcome.path().cloned().unwrap();
        assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "0123456789");
        assert_eq!(result.status.downloaded, 10);
        assert_eq!(result.status.total_size, Some(10));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/audio/abc")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), open_source(&server), 3);
        let mut notifications = service.watch_notification();

        let result = done(service.start_download(StartDownload::new("abc")).await.unwrap()).await;

        assert!(matches!(result.outcome, DownloadOutcome::Failure(ref e) if e.contains("500")));
        assert_eq!(service.session().failed, 1);
        assert_eq!(service.session().completed, 0);
        mock.assert_async().await;

        tokio::time::timeout(
            Duration::from_secs(5),
            notifications.wait_for(|n| {
                matches!(n, Some(n) if n.kind == NotificationKind::Failed && !n.ongoing)
            }),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_content_type_fails() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/audio/abc")
            .with_header("content-type", "text/html")
            .with_body("<html></html>")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), open_source(&server), 3);

        let result = done(service.start_download(StartDownload::new("abc")).await.unwrap()).await;

        assert!(
            matches!(result.outcome, DownloadOutcome::Failure(ref e) if e.contains("Unsupported content type"))
        );
        assert!(!dir.path().join("abc.webm.part").exists());
    }

    #[tokio::test]
    async fn test_cancel_queued_download() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Regex("^/audio/".into()))
            .with_header("content-type", "audio/webm")
            .with_body("data")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = gated_source(&server);
        // One worker: A holds it while blocked on the gate, B waits for it
        let service = service(dir.path(), source.clone(), 1);

        let a = service.start_download(StartDownload::new("A")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b = service.start_download(StartDownload::new("B")).await.unwrap();
        let first_b = service.find("B").unwrap();

        assert!(service.cancel_download("B"));
        let result = done(b).await;
        assert_eq!(result.outcome, DownloadOutcome::Cancelled);
        assert_eq!(result.status.status, DownloadStatus::Cancelled);
        assert!(service.find("B").is_none());
        assert!(!service.cancel_download("B"));

        // A new request creates a fresh download
        let again = service.start_download(StartDownload::new("B")).await.unwrap();
        let second_b = service.find("B").unwrap();
        assert_ne!(first_b.instance, second_b.instance);
        assert_eq!(second_b.status, DownloadStatus::Idle);

        source.gate.add_permits(Semaphore::MAX_PERMITS);
        assert!(done(a).await.outcome.is_success());
        assert!(done(again).await.outcome.is_success());
        assert_eq!(service.session().completed, 2);
        assert_eq!(service.session().failed, 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/audio/abc")
            .with_header("content-type", "audio/webm")
            .with_body("data")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = gated_source(&server);
        let service = service(dir.path(), source.clone(), 3);

        let mut handle = service.start_download(StartDownload::new("abc")).await.unwrap();
        assert!(service.pause_resume());
        source.gate.add_permits(Semaphore::MAX_PERMITS);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(handle.try_result().is_none());
        let status = service.find("abc").unwrap().status;
        assert!(matches!(status, DownloadStatus::Idle | DownloadStatus::Paused));
        let notification = service.notification().unwrap();
        assert!(notification.title.ends_with("(paused)"));
        assert!(notification.actions.contains(&crate::downloader::NotificationAction::Resume));

        assert!(!service.pause_resume());
        let result = done(handle).await;
        assert!(result.outcome.is_success());
        let path = result.outcome.path().cloned().unwrap();
        assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "data");
    }

    #[tokio::test]
    async fn test_finished_song_is_not_queued_again() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/audio/abc")
            .with_header("content-type", "audio/webm")
            .with_body("data")
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), open_source(&server), 3);

        let first = done(service.start_download(StartDownload::new("abc")).await.unwrap()).await;
        let mut events = service.subscribe();
        let second = done(
            service
                .start_download(StartDownload::new("abc").instance(99))
                .await
                .unwrap(),
        )
        .await;

        assert_eq!(second.instance, 99);
        assert_eq!(second.status.status, DownloadStatus::AlreadyFinished);
        assert_eq!(second.outcome, first.outcome);
        assert!(service.list_all().is_empty());
        assert!(matches!(events.try_recv().unwrap(), DownloadEvent::Result(r) if r.instance == 99));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_resume_partial_downloads() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Regex("^/audio/".into()))
            .with_status(206)
            .with_header("content-type", "audio/webm")
            .with_body("tail")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("x1.webm.part"), "head")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("x2.webm.part"), "head")
            .await
            .unwrap();
        let service = service(dir.path(), open_source(&server), 3);

        let handles = service.resume_partial_downloads().await.unwrap();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            let result = done(handle).await;
            assert!(result.status.silent);
            let path = result.outcome.path().cloned().unwrap();
            assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "headtail");
        }
        // Silent downloads never show a notification
        assert!(service.notification().is_none());
    }

    #[tokio::test]
    async fn test_actions() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), open_source(&server), 3);

        assert!(matches!(
            service.handle_action(DownloadAction::StatusChanged).await,
            Err(DownloadError::OutputOnlyAction)
        ));
        assert!(service.handle_action(DownloadAction::CancelAll).await.unwrap().is_none());
        assert!(service.handle_action(DownloadAction::PauseResume).await.unwrap().is_none());
        assert!(service.is_paused());

        service.handle_action(DownloadAction::Stop).await.unwrap();
        assert!(service.is_stopping());
        assert!(matches!(
            service
                .handle_action(DownloadAction::StartDownload(StartDownload::new("abc")))
                .await,
            Err(DownloadError::ServiceStopped)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_downloads() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let source = gated_source(&server);
        let service = service(dir.path(), source.clone(), 1);

        let a = service.start_download(StartDownload::new("A")).await.unwrap();
        let b = service.start_download(StartDownload::new("B")).await.unwrap();

        service.stop();
        // A is stuck resolving until the gate opens, B never gets a worker
        source.gate.add_permits(Semaphore::MAX_PERMITS);
        tokio::time::timeout(Duration::from_secs(5), service.shutdown())
            .await
            .unwrap();

        assert_eq!(done(a).await.outcome, DownloadOutcome::Cancelled);
        assert_eq!(done(b).await.outcome, DownloadOutcome::Cancelled);
        assert!(service.list_all().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_item_ids() {
        let server = Server::new_async().await;
        let root = tempfile::tempdir().unwrap();
        let service = service(&root.path().join("songs"), open_source(&server), 3);

        for item_id in ["../escaped", "a.b", "", "a/b", "a\\b", "a\u{0}b"] {
            let err = service
                .start_download(StartDownload::new(item_id))
                .await
                .err()
                .unwrap();
            assert!(
                matches!(err, DownloadError::InvalidItemId(ref id) if id == item_id),
                "{item_id:?} gave {err:?}"
            );
        }

        assert!(service.list_all().is_empty());
        let mut entries = tokio::fs::read_dir(root.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert_eq!(entry.file_name(), "songs");
        }
    }

    #[tokio::test]
    async fn test_zero_max_retries_still_attempts_once() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/audio/abc")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = DownloaderConfig::new(dir.path());
        config.max_retries = 0;
        config.notification_debounce = Duration::ZERO;
        let service = DownloadService::new(config, open_source(&server), Vec::new()).unwrap();
        assert_eq!(service.config().max_retries, 1);

        let result = done(service.start_download(StartDownload::new("abc")).await.unwrap()).await;

        assert!(matches!(result.outcome, DownloadOutcome::Failure(ref e) if e.contains("500")));
        assert_eq!(service.session().failed, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_pause_mid_stream_then_resume() {
        let release = Arc::new(Notify::new());
        let (url, requests) = scripted_server(vec![
            vec![
                Step::Send(FIRST_HALF),
                Step::WaitFor(release.clone()),
                Step::Send(b"bbbb"),
            ],
            vec![Step::Send(SECOND_HALF)],
        ])
        .await;

        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), source_at(url), 3);
        let mut handle = service.start_download(StartDownload::new("abc")).await.unwrap();

        wait_for_snapshot(&service, "abc", |s| s.downloaded == 4).await;
        assert!(service.pause_resume());
        release.notify_one();

        let paused = wait_for_snapshot(&service, "abc", |s| s.status == DownloadStatus::Paused).await;
        assert_eq!(paused.downloaded, 4);
        assert!(handle.try_result().is_none());
        let part = tokio::fs::read(dir.path().join("abc.webm.part")).await.unwrap();
        assert_eq!(part, b"aaaa");

        assert!(!service.pause_resume());
        let result = done(handle).await;

        let path = result.outcome.path().cloned().unwrap();
        assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "aaaabbbb");
        assert_eq!(result.status.downloaded, 8);
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].contains("range: bytes=4-"));
    }

    #[tokio::test]
    async fn test_resume_after_stream_error() {
        // The first response is cut off after half of the promised body
        let (url, requests) =
            scripted_server(vec![vec![Step::Send(FIRST_HALF)], vec![Step::Send(SECOND_HALF)]]).await;

        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), source_at(url), 3);

        let result = done(service.start_download(StartDownload::new("abc")).await.unwrap()).await;

        assert!(result.outcome.is_success());
        let path = result.outcome.path().cloned().unwrap();
        assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "aaaabbbb");
        assert!(!dir.path().join("abc.webm.part").exists());
        assert_eq!(service.session().completed, 1);
        assert_eq!(service.session().failed, 0);

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("range: bytes=0-"));
        assert!(requests[1].contains("range: bytes=4-"));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let release = Arc::new(Notify::new());
        let (url, requests) = scripted_server(vec![vec![
            Step::Send(FIRST_HALF),
            Step::WaitFor(release.clone()),
            Step::Send(b"bbbb"),
        ]])
        .await;

        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), source_at(url), 3);
        let handle = service.start_download(StartDownload::new("abc")).await.unwrap();

        wait_for_snapshot(&service, "abc", |s| s.downloaded == 4).await;
        assert!(service.cancel_download("abc"));
        release.notify_one();

        let result = done(handle).await;
        assert_eq!(result.outcome, DownloadOutcome::Cancelled);
        assert_eq!(result.status.status, DownloadStatus::Cancelled);
        assert_eq!(result.status.downloaded, 4);
        assert!(service.find("abc").is_none());
        assert_eq!(service.session().failed, 1);
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_reply_to_range_request_restarts() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/audio/abc")
            .match_header("range", "bytes=4-")
            .with_status(200)
            .with_header("content-type", "audio/webm")
            .with_body("abcdef")
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("abc.webm.part"), "0123")
            .await
            .unwrap();
        let service = service(dir.path(), open_source(&server), 3);

        let result = done(service.start_download(StartDownload::new("abc")).await.unwrap()).await;

        let path = result.outcome.path().cloned().unwrap();
        assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "abcdef");
        assert_eq!(result.status.downloaded, 6);
        assert_eq!(result.status.total_size, Some(6));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_partial_of_another_format_is_discarded() {
        let mut server = Server::new_async().await;
        let resumed = server
            .mock("GET", "/audio/abc")
            .match_header("range", "bytes=4-")
            .with_status(206)
            .with_header("content-type", "audio/webm")
            .with_body("tail")
            .expect(1)
            .create_async()
            .await;
        let restarted = server
            .mock("GET", "/audio/abc")
            .match_header("range", "bytes=0-")
            .with_header("content-type", "audio/webm")
            .with_body("whole song")
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("abc.mp4.part"), "0123")
            .await
            .unwrap();
        let service = service(dir.path(), open_source(&server), 3);

        let result = done(service.start_download(StartDownload::new("abc")).await.unwrap()).await;

        let path = result.outcome.path().cloned().unwrap();
        assert_eq!(path, dir.path().join("Song abc.webm"));
        assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "whole song");
        assert!(!dir.path().join("abc.mp4.part").exists());
        assert_eq!(service.session().completed, 1);
        resumed.assert_async().await;
        restarted.assert_async().await;
    }

    #[tokio::test]
    async fn test_final_notification_is_debounced() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/audio/abc")
            .with_header("content-type", "audio/webm")
            .with_body("data")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = DownloaderConfig::new(dir.path());
        config.notification_debounce = Duration::from_millis(400);
        let service = DownloadService::new(config, open_source(&server), Vec::new()).unwrap();
        let mut notifications = service.watch_notification();

        let result = done(service.start_download(StartDownload::new("abc")).await.unwrap()).await;
        let finished_at = std::time::Instant::now();
        assert!(result.outcome.is_success());

        // The progress notification lingers until the window has passed
        let lingering = service.notification().unwrap();
        assert_eq!(lingering.kind, NotificationKind::Progress);

        tokio::time::timeout(Duration::from_secs(5), notifications.wait_for(Option::is_none))
            .await
            .unwrap()
            .unwrap();
        assert!(finished_at.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_checkpoint_priority() {
        let control = QueueControl::new();
        let download = Download::new(
            "abc",
            crate::downloader::SongAudioQuality::High,
            false,
            0,
            None,
            EventBus::new(),
        );

        assert_eq!(control.checkpoint(&download), None);
        assert!(control.toggle_pause());
        assert_eq!(control.checkpoint(&download), Some(DownloadStatus::Paused));
        download.cancel();
        assert_eq!(control.checkpoint(&download), Some(DownloadStatus::Cancelled));
        assert!(!control.toggle_pause());
        control.stop();
        assert!(control.is_stopping());
        assert_eq!(control.checkpoint(&download), Some(DownloadStatus::Cancelled));
    }
}
