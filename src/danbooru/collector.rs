//! Metadata collection across all listing pages
//!
//! This module provides functionality for:
//! 1. Fanning listing page fetches out over a fixed-size worker pool
//! 2. Filtering each post by the requested ratings
//! 3. Deduplicating posts by id in a concurrent map
//! 4. Returning only once every page has been processed

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::danbooru::client::calculate_backoff;
use crate::danbooru::fetcher::{FetchResult, ItemFetcher};
use crate::danbooru::post::{Post, PostId, RatingSet};
use crate::danbooru::progress::{ProgressEvent, ProgressHook};
use crate::danbooru::worker_pool::{PoolReport, TaskOutcome, WorkerPool};

/// Posts accepted by the rating filter, unique by id.
///
/// Safe to share between workers: `offer` is an atomic insert-if-absent.
#[derive(Debug)]
pub struct PostCollection {
    accepted: RatingSet,
    posts: DashMap<PostId, Post>,
}

impl PostCollection {
    pub fn new(accepted: RatingSet) -> Self {
        Self {
            accepted,
            posts: DashMap::new(),
        }
    }

    /// Inserts `post` if its rating is accepted and its id is new.
    ///
    /// Returns whether the post was inserted.
    pub fn offer(&self, post: Post) -> bool {
        if !self.accepted.contains(post.rating) {
            return false;
        }
        match self.posts.entry(post.id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(post);
                true
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.posts.len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: PostId) -> bool {
        self.posts.contains_key(&id)
    }

    /// Consumes the collection, returning posts ordered by id.
    pub fn into_posts(self) -> Vec<Post> {
        let mut posts: Vec<Post> = self.posts.into_iter().map(|(_, post)| post).collect();
        posts.sort_by_key(|post| post.id);
        posts
    }
}

/// Settings for the metadata collection stage.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// 0 means one worker per CPU.
    pub workers: usize,
    /// Extra attempts after a failed page request. 0 disables retry.
    pub page_retries: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            page_retries: 0,
            retry_base_delay_ms: 1000,
        }
    }
}

/// Result of the collection stage.
#[derive(Debug)]
pub struct CollectionResult {
    pub posts: Vec<Post>,
    pub pages: PoolReport,
}

/// Drives an `ItemFetcher` across every page of a tag.
pub struct MetadataCollector {
    fetcher: Arc<dyn ItemFetcher>,
    settings: CollectorSettings,
    progress: ProgressHook,
    cancel: CancellationToken,
}

impl MetadataCollector {
    pub fn new(fetcher: Arc<dyn ItemFetcher>, settings: CollectorSettings, progress: ProgressHook) -> Self {
        Self {
            fetcher,
            settings,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Collects every accepted post of `tag` from pages `0..page_count`.
    ///
    /// A page that fails contributes nothing; the run continues.
    pub async fn collect(&self, page_count: u64, tag: &str, accepted: RatingSet) -> CollectionResult {
        let collection = Arc::new(PostCollection::new(accepted));
        let pool = WorkerPool::new("pages", self.settings.workers).with_cancellation(self.cancel.clone());

        info!(
            "Adding {} pages worth of posts to queue ({} workers, ratings {})",
            page_count,
            pool.workers(),
            accepted
        );
        (self.progress)(ProgressEvent::PagesPlanned { total: page_count });

        let fetcher = self.fetcher.clone();
        let progress = self.progress.clone();
        let settings = self.settings.clone();
        let tag: Arc<str> = Arc::from(tag);
        let shared = collection.clone();

        let pages = pool
            .run(0..page_count, move |page_index| {
                let fetcher = fetcher.clone();
                let progress = progress.clone();
                let settings = settings.clone();
                let tag = tag.clone();
                let collection = shared.clone();
                async move {
                    let result = fetch_with_retry(fetcher.as_ref(), page_index, &tag, &settings).await;
                    let (items, outcome) = match result {
                        Ok(posts) => {
                            let inserted = posts
                                .into_iter()
                                .map(|post| collection.offer(post))
                                .filter(|inserted| *inserted)
                                .count();
                            (inserted, TaskOutcome::Succeeded)
                        }
                        Err(e) => {
                            warn!("Failed to fetch page {} of {}: {}", page_index + 1, page_count, e);
                            (0, TaskOutcome::Failed)
                        }
                    };

                    progress(ProgressEvent::PageProcessed {
                        page_index,
                        page_count,
                        items,
                        failed: outcome == TaskOutcome::Failed,
                    });
                    outcome
                }
            })
            .await;

        // Workers have all exited, so this is the last reference.
        let posts = match Arc::try_unwrap(collection) {
            Ok(collection) => collection.into_posts(),
            Err(shared) => {
                let mut posts: Vec<Post> = shared.posts.iter().map(|entry| entry.value().clone()).collect();
                posts.sort_by_key(|post| post.id);
                posts
            }
        };

        info!(
            "Collected {} posts from {} of {} pages ({} failed)",
            posts.len(),
            pages.processed,
            pages.enqueued,
            pages.failed
        );
        CollectionResult { posts, pages }
    }
}

async fn fetch_with_retry(
    fetcher: &dyn ItemFetcher,
    page_index: u64,
    tag: &str,
    settings: &CollectorSettings,
) -> FetchResult<Vec<Post>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fetcher.fetch(page_index, tag).await {
            Ok(posts) => return Ok(posts),
            Err(e) if attempt <= settings.page_retries => {
                let backoff = calculate_backoff(attempt, settings.retry_base_delay_ms);
                debug!("Page {} attempt {} failed ({}), retrying in {:?}", page_index + 1, attempt, e, backoff);
                sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
