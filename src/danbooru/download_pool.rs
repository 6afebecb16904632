//! Download stage
//!
//! This module provides functionality for:
//! 1. Planning one download per collected post into `<output>/<rating>/<id>.<ext>`
//! 2. Skipping posts whose file already exists, or that carry no file url
//! 3. Creating rating directories on demand, tolerating concurrent creation
//! 4. Running the downloads over a fixed-size worker pool and collecting failures

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::fs;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::danbooru::client::calculate_backoff;
use crate::danbooru::downloader::{DownloadResult, PayloadDownloader};
use crate::danbooru::post::{Post, PostId, Rating, RatingSet};
use crate::danbooru::progress::{DownloadOutcome, ProgressEvent, ProgressHook};
use crate::danbooru::worker_pool::{PoolReport, TaskOutcome, WorkerPool};

/// One payload to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub post_id: PostId,
    pub source_url: String,
    pub destination: PathBuf,
}

/// A download that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFailure {
    pub post_id: PostId,
    pub source_url: Option<String>,
    pub message: String,
}

/// Tasks to run plus everything that was skipped while planning.
#[derive(Debug, Default)]
pub struct DownloadPlan {
    pub tasks: Vec<DownloadTask>,
    pub skipped_existing: usize,
    pub skipped_missing_url: usize,
    pub skipped_rating: usize,
    /// Posts whose rating directory could not be created.
    pub failures: Vec<DownloadFailure>,
}

/// Summary of the download stage.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub planned: usize,
    pub downloaded: usize,
    pub bytes: u64,
    pub skipped_existing: usize,
    pub skipped_missing_url: usize,
    pub failures: Vec<DownloadFailure>,
    pub pool: PoolReport,
}

/// Settings for the download stage.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// 0 means one worker per CPU.
    pub workers: usize,
    /// Extra attempts after a failed download. 0 disables retry.
    pub retries: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            retries: 0,
            retry_base_delay_ms: 1000,
        }
    }
}

/// Creates `dir` if needed. Losing a creation race to another worker is success.
pub async fn ensure_directory(dir: &Path) -> io::Result<()> {
    match fs::create_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Builds the download plan for `posts`.
///
/// Only posts rated in `accepted` are considered. Rating directories are
/// created for posts that will actually be downloaded, so a rating with
/// nothing to fetch never gets a directory.
pub async fn plan_downloads(posts: &[Post], output_dir: &Path, accepted: RatingSet) -> DownloadPlan {
    let mut plan = DownloadPlan::default();
    let mut ready_dirs: HashSet<Rating> = HashSet::new();

    for post in posts {
        if !accepted.contains(post.rating) {
            plan.skipped_rating += 1;
            continue;
        }

        let (Some(source_url), Some(destination)) = (post.file_url.as_ref(), post.destination(output_dir)) else {
            debug!("Post {} has no downloadable file, skipping", post.id);
            plan.skipped_missing_url += 1;
            continue;
        };

        if fs::try_exists(&destination).await.unwrap_or(false) {
            debug!("File already exists: {}", destination.display());
            plan.skipped_existing += 1;
            continue;
        }

        if !ready_dirs.contains(&post.rating) {
            let dir = output_dir.join(post.rating.directory_name());
            if let Err(e) = ensure_directory(&dir).await {
                warn!("Failed to create directory {}: {}", dir.display(), e);
                plan.failures.push(DownloadFailure {
                    post_id: post.id,
                    source_url: Some(source_url.clone()),
                    message: format!("Failed to create directory {}: {}", dir.display(), e),
                });
                continue;
            }
            ready_dirs.insert(post.rating);
        }

        plan.tasks.push(DownloadTask {
            post_id: post.id,
            source_url: source_url.clone(),
            destination,
        });
    }

    if plan.skipped_missing_url > 0 {
        info!("{} posts have no file url and were skipped", plan.skipped_missing_url);
    }
    if plan.skipped_rating > 0 {
        debug!("{} posts are outside the requested ratings", plan.skipped_rating);
    }
    plan
}

/// Runs a `PayloadDownloader` over every planned task.
pub struct DownloadPool {
    downloader: Arc<dyn PayloadDownloader>,
    settings: DownloadSettings,
    progress: ProgressHook,
    cancel: CancellationToken,
}

impl DownloadPool {
    pub fn new(downloader: Arc<dyn PayloadDownloader>, settings: DownloadSettings, progress: ProgressHook) -> Self {
        Self {
            downloader,
            settings,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Plans and downloads every accepted post, returning after all tasks are processed.
    ///
    /// A failed download is recorded in the report and never aborts the pool.
    pub async fn run(&self, posts: &[Post], output_dir: &Path, accepted: RatingSet) -> DownloadReport {
        let plan = plan_downloads(posts, output_dir, accepted).await;
        let planned = plan.tasks.len();
        let pool = WorkerPool::new("downloads", self.settings.workers).with_cancellation(self.cancel.clone());

        info!(
            "Downloading {} posts ({} already present, {} workers)",
            planned,
            plan.skipped_existing,
            pool.workers()
        );
        (self.progress)(ProgressEvent::DownloadsPlanned { total: planned });

        let failures = Arc::new(Mutex::new(plan.failures));
        let bytes = Arc::new(AtomicU64::new(0));

        let downloader = self.downloader.clone();
        let settings = self.settings.clone();
        let progress = self.progress.clone();
        let (failure_sink, byte_counter) = (failures.clone(), bytes.clone());

        let report = pool
            .run(plan.tasks, move |task: DownloadTask| {
                let downloader = downloader.clone();
                let settings = settings.clone();
                let progress = progress.clone();
                let failures = failure_sink.clone();
                let bytes = byte_counter.clone();
                async move {
                    match download_with_retry(downloader.as_ref(), &task, &settings).await {
                        Ok(written) => {
                            bytes.fetch_add(written, Ordering::Relaxed);
                            progress(ProgressEvent::DownloadFinished {
                                post_id: task.post_id,
                                outcome: DownloadOutcome::Downloaded { bytes: written },
                            });
                            TaskOutcome::Succeeded
                        }
                        Err(e) => {
                            warn!("Failed to download post {}: {}", task.post_id, e);
                            let message = e.to_string();
                            failures.lock().push(DownloadFailure {
                                post_id: task.post_id,
                                source_url: Some(task.source_url.clone()),
                                message: message.clone(),
                            });
                            progress(ProgressEvent::DownloadFinished {
                                post_id: task.post_id,
                                outcome: DownloadOutcome::Failed { message },
                            });
                            TaskOutcome::Failed
                        }
                    }
                }
            })
            .await;

        let failures = std::mem::take(&mut *failures.lock());
        DownloadReport {
            planned,
            downloaded: report.succeeded,
            bytes: bytes.load(Ordering::Relaxed),
            skipped_existing: plan.skipped_existing,
            skipped_missing_url: plan.skipped_missing_url,
            failures,
            pool: report,
        }
    }
}

async fn download_with_retry(
    downloader: &dyn PayloadDownloader,
    task: &DownloadTask,
    settings: &DownloadSettings,
) -> DownloadResult<u64> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match downloader.fetch_and_store(&task.source_url, &task.destination).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if attempt <= settings.retries => {
                let backoff = calculate_backoff(attempt, settings.retry_base_delay_ms);
                info!(
                    "Retry attempt {}/{} for post {} in {:?}: {}",
                    attempt, settings.retries, task.post_id, backoff, e
                );
                sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::danbooru::downloader::DownloadError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn post(id: u64, rating: Rating, url: Option<&str>) -> Post {
        Post {
            id: PostId(id),
            rating,
            file_url: url.map(str::to_string),
            file_ext: Some("jpg".to_string()),
        }
    }

    /// Writes the url into the destination, failing for urls containing "bad".
    #[derive(Default)]
    struct FakeDownloader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PayloadDownloader for FakeDownloader {
        async fn fetch_and_store(&self, source_url: &str, destination: &Path) -> DownloadResult<u64> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if source_url.contains("bad") {
                return Err(DownloadError::Stream("connection reset".to_string()));
            }
            fs::write(destination, source_url.as_bytes()).await?;
            Ok(source_url.len() as u64)
        }
    }

    #[tokio::test]
    async fn test_plan_skips_existing_and_missing_urls() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(out.join("safe")).unwrap();
        std::fs::write(out.join("safe").join("1.jpg"), b"old").unwrap();

        let posts = vec![
            post(1, Rating::Safe, Some("u1")),
            post(2, Rating::Safe, None),
            post(3, Rating::Explicit, Some("u3")),
            post(4, Rating::Risky, Some("u4")),
        ];
        let plan = plan_downloads(&posts, &out, RatingSet::from_flags(true, false, true)).await;

        assert_eq!(plan.skipped_existing, 1);
        assert_eq!(plan.skipped_missing_url, 1);
        assert_eq!(plan.skipped_rating, 1);
        assert_eq!(
            plan.tasks,
            vec![DownloadTask {
                post_id: PostId(3),
                source_url: "u3".to_string(),
                destination: out.join("explicit").join("3.jpg"),
            }]
        );
        assert!(out.join("explicit").is_dir());
        assert!(!out.join("risky").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_directory_creation_is_not_an_error() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out").join("safe");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let target = target.clone();
            handles.push(tokio::spawn(async move { ensure_directory(&target).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn test_failures_are_collected_not_fatal() {
        let dir = tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::default());
        let pool = DownloadPool::new(
            downloader.clone(),
            DownloadSettings { workers: 2, ..DownloadSettings::default() },
            crate::danbooru::progress::no_progress(),
        );

        let posts = vec![
            post(1, Rating::Safe, Some("good-1")),
            post(2, Rating::Safe, Some("bad-2")),
            post(3, Rating::Safe, Some("good-3")),
        ];
        let report = pool.run(&posts, dir.path(), RatingSet::all()).await;

        assert_eq!(report.planned, 3);
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.pool.processed, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].post_id, PostId(2));
        assert_eq!(report.bytes, ("good-1".len() + "good-3".len()) as u64);
        assert!(dir.path().join("safe").join("1.jpg").exists());
        assert!(!dir.path().join("safe").join("2.jpg").exists());
    }

    #[tokio::test]
    async fn test_second_run_downloads_nothing() {
        let dir = tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::default());
        let pool = DownloadPool::new(
            downloader.clone(),
            DownloadSettings::default(),
            crate::danbooru::progress::no_progress(),
        );
        let posts = vec![post(1, Rating::Safe, Some("u1")), post(2, Rating::Explicit, Some("u2"))];

        let first = pool.run(&posts, dir.path(), RatingSet::all()).await;
        assert_eq!(first.downloaded, 2);

        let second = pool.run(&posts, dir.path(), RatingSet::all()).await;
        assert_eq!(second.planned, 0);
        assert_eq!(second.skipped_existing, 2);
        assert_eq!(downloader.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_download_retry_is_bounded() {
        let dir = tempdir().unwrap();
        let downloader = Arc::new(FakeDownloader::default());
        let pool = DownloadPool::new(
            downloader.clone(),
            DownloadSettings {
                workers: 1,
                retries: 2,
                retry_base_delay_ms: 1,
            },
            crate::danbooru::progress::no_progress(),
        );

        let report = pool
            .run(&[post(5, Rating::Safe, Some("bad-5"))], dir.path(), RatingSet::all())
            .await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.pool.processed, 1);
        assert_eq!(downloader.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
