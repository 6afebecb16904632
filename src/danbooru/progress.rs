use std::sync::Arc;

use crate::danbooru::post::PostId;

/// What happened to a single download task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { bytes: u64 },
    Failed { message: String },
}

/// Events emitted by the two pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    PagesPlanned { total: u64 },
    PageProcessed {
        page_index: u64,
        page_count: u64,
        items: usize,
        failed: bool,
    },
    DownloadsPlanned { total: usize },
    DownloadFinished { post_id: PostId, outcome: DownloadOutcome },
}

/// Callback invoked from worker tasks. Must return quickly and never block.
pub type ProgressHook = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A hook that discards every event.
#[cfg(test)]
pub fn no_progress() -> ProgressHook {
    Arc::new(|_| {})
}
