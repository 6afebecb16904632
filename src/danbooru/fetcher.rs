use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::danbooru::post::{Post, posts_from_values};

/// Error types for listing page fetches
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Malformed listing page: {0}")]
    Malformed(String),
}

/// Result type for listing page fetches
pub type FetchResult<T> = Result<T, FetchError>;

/// Fetches one page of the post listing for a tag.
#[async_trait]
pub trait ItemFetcher: Send + Sync {
    /// Fetches listing page `page_index + 1`.
    ///
    /// A non-success status yields an empty page rather than an error.
    async fn fetch(&self, page_index: u64, tag: &str) -> FetchResult<Vec<Post>>;
}

/// Fetcher backed by `GET /posts.json?page=<n>&tags=<tag>`.
pub struct HttpPostFetcher {
    client: Client,
    base_url: String,
}

impl HttpPostFetcher {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ItemFetcher for HttpPostFetcher {
    #[instrument(skip(self), fields(page = page_index + 1))]
    async fn fetch(&self, page_index: u64, tag: &str) -> FetchResult<Vec<Post>> {
        let url = format!("{}/posts.json", self.base_url);
        let page = (page_index + 1).to_string();

        let response = self
            .client
            .get(&url)
            .query(&[("page", page.as_str()), ("tags", tag)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!("Listing page {} returned {}, skipping it", page, status);
            return Ok(Vec::new());
        }

        let body = response.bytes().await?;
        let values: Vec<Value> = serde_json::from_slice(&body)
            .map_err(|e| FetchError::Malformed(e.to_string()))?;

        let posts = posts_from_values(&values);
        debug!("Listing page {} yielded {} of {} records", page, posts.len(), values.len());
        Ok(posts)
    }
}
