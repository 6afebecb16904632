//! Payload downloads
//!
//! Streams a file to disk chunk by chunk so a large payload never has to fit
//! in memory. With atomic writes enabled the body goes to `<name>.part` first
//! and is renamed into place only after a complete transfer.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

/// Error types for the payload downloader
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP error {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("Download error: {0}")]
    Stream(String),
}

/// Result type for download operations
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Transfers one payload to one destination file.
#[async_trait]
pub trait PayloadDownloader: Send + Sync {
    /// Downloads `source_url` into a newly created file at `destination`,
    /// returning the number of bytes written.
    async fn fetch_and_store(&self, source_url: &str, destination: &Path) -> DownloadResult<u64>;
}

/// Downloader over the shared HTTP client.
pub struct HttpPayloadDownloader {
    client: Client,
    atomic_writes: bool,
}

impl HttpPayloadDownloader {
    pub fn new(client: Client, atomic_writes: bool) -> Self {
        Self { client, atomic_writes }
    }

    /// Path the body is streamed into before it is renamed onto `destination`.
    pub fn partial_path(destination: &Path) -> PathBuf {
        let mut name = destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".part");
        destination.with_file_name(name)
    }

    async fn stream_to_file(response: reqwest::Response, file_path: &Path) -> DownloadResult<u64> {
        let mut file = File::create(file_path).await?;
        let mut stream = response.bytes_stream();
        let mut bytes_downloaded = 0u64;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| DownloadError::Stream(format!("Failed to get chunk: {}", e)))?;
            file.write_all(&chunk).await?;
            bytes_downloaded += chunk.len() as u64;
        }

        file.flush().await?;
        Ok(bytes_downloaded)
    }
}

#[async_trait]
impl PayloadDownloader for HttpPayloadDownloader {
    #[instrument(skip(self, destination), fields(destination = %destination.display()))]
    async fn fetch_and_store(&self, source_url: &str, destination: &Path) -> DownloadResult<u64> {
        let response = self.client.get(source_url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status,
                url: source_url.to_string(),
            });
        }

        if !self.atomic_writes {
            return Self::stream_to_file(response, destination).await;
        }

        let temp_path = Self::partial_path(destination);
        match Self::stream_to_file(response, &temp_path).await {
            Ok(bytes) => {
                fs::rename(&temp_path, destination).await?;
                debug!("Stored {} bytes", bytes);
                Ok(bytes)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp_path).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove partial file {}: {}", temp_path.display(), cleanup);
                    }
                }
                Err(e)
            }
        }
    }
}
