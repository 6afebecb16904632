//! Danbooru tag downloader
//! Collects every post of a tag across all listing pages, then downloads the
//! files of the accepted ratings into one directory per rating.

pub mod client;
pub mod collector;
pub mod config;
pub mod download_pool;
pub mod downloader;
pub mod fetcher;
pub mod logger;
pub mod page_count;
pub mod post;
pub mod progress;
pub mod tag_validator;
pub mod tui;
pub mod worker_pool;

// Re-export the types the program wires together
pub use collector::{CollectorSettings, MetadataCollector};
pub use config::AppConfig;
pub use download_pool::{DownloadPool, DownloadReport, DownloadSettings};
pub use downloader::HttpPayloadDownloader;
pub use fetcher::HttpPostFetcher;
pub use page_count::{CountsPageCountResolver, PageCountError, PageCountResolver};
pub use post::RatingSet;
pub use progress::ProgressHook;
pub use worker_pool::PoolReport;
