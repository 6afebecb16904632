//! Page count discovery for a search tag
//!
//! The pipeline only needs one number from here: how many listing pages a tag
//! spans. `CountsPageCountResolver` derives it from the board's post count
//! endpoint; anything else that can answer the question can implement
//! `PageCountResolver`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error types for page count discovery
#[derive(Error, Debug)]
pub enum PageCountError {
    #[error("No posts found for tag \"{tag}\"")]
    NotFound { tag: String },

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
}

/// Result type for page count discovery
pub type PageCountResult<T> = Result<T, PageCountError>;

/// Resolves the total number of listing pages for a tag.
#[async_trait]
pub trait PageCountResolver: Send + Sync {
    /// Returns a positive page count, or `PageCountError::NotFound` when the
    /// tag has no posts or the count cannot be read.
    async fn page_count(&self, tag: &str) -> PageCountResult<u64>;
}

/// API response for post counts
#[derive(Debug, Deserialize)]
struct PostCountResponse {
    counts: PostCounts,
}

#[derive(Debug, Deserialize)]
struct PostCounts {
    posts: u64,
}

/// Page count resolver backed by `GET /counts/posts.json?tags=<tag>`.
pub struct CountsPageCountResolver {
    client: Client,
    base_url: String,
    posts_per_page: u64,
    max_pages: u64,
}

impl CountsPageCountResolver {
    pub fn new(client: Client, base_url: &str, posts_per_page: u64, max_pages: u64) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            posts_per_page: posts_per_page.max(1),
            max_pages,
        }
    }

    /// Pages needed to list `posts`, capped by the configured maximum (0 = no cap).
    fn pages_for(&self, posts: u64) -> u64 {
        let pages = posts.div_ceil(self.posts_per_page);
        if self.max_pages > 0 && pages > self.max_pages {
            warn!(
                "Tag spans {} pages, only the first {} can be listed",
                pages, self.max_pages
            );
            self.max_pages
        } else {
            pages
        }
    }
}

#[async_trait]
impl PageCountResolver for CountsPageCountResolver {
    async fn page_count(&self, tag: &str) -> PageCountResult<u64> {
        let url = format!("{}/counts/posts.json", self.base_url);
        debug!("Requesting post count for tag \"{}\"", tag);

        let response = self.client.get(&url).query(&[("tags", tag)]).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Counts endpoint returned {} for tag \"{}\"", status, tag);
            return Err(PageCountError::NotFound { tag: tag.to_string() });
        }

        let body: PostCountResponse = response.json().await?;
        let pages = self.pages_for(body.counts.posts);
        if pages == 0 {
            return Err(PageCountError::NotFound { tag: tag.to_string() });
        }

        info!("Tag \"{}\" has {} posts over {} pages", tag, body.counts.posts, pages);
        Ok(pages)
    }
}
