use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Error, bail};
use clap::Parser;
use console::style;
use dialoguer::{Confirm, Input, theme::ColorfulTheme};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, trace, warn};
use uuid::Uuid;

use crate::danbooru::client::build_client;
use crate::danbooru::config::CONFIG_FILE;
use crate::danbooru::download_pool::ensure_directory;
use crate::danbooru::tag_validator::normalize_tag;
use crate::danbooru::tui::ProgressRenderer;
use crate::danbooru::{
    AppConfig, CollectorSettings, CountsPageCountResolver, DownloadPool, DownloadReport,
    DownloadSettings, HttpPayloadDownloader, HttpPostFetcher, MetadataCollector, PageCountError,
    PageCountResolver, PoolReport, ProgressHook, RatingSet,
};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Search Danbooru for images with a given tag and download them to the output directory.
#[derive(Parser, Debug, Clone)]
#[command(name = "danbooru_downloader", version)]
pub(crate) struct Args {
    /// Tag to search for
    #[arg(short, long)]
    pub(crate) tag: Option<String>,

    /// Output directory, defaults to the config's output directory ("output")
    #[arg(short, long)]
    pub(crate) output: Option<String>,

    /// Download safe posts (default: true)
    #[arg(long)]
    pub(crate) safe: Option<bool>,

    /// Download questionable posts (default: false)
    #[arg(long)]
    pub(crate) risky: Option<bool>,

    /// Download explicit posts (default: false)
    #[arg(long)]
    pub(crate) explicit: Option<bool>,

    /// Worker count for both stages, overriding the config
    #[arg(short, long)]
    pub(crate) workers: Option<usize>,

    /// Path of the config file
    #[arg(short, long, default_value = CONFIG_FILE)]
    pub(crate) config: PathBuf,

    /// Never prompt; options not given on the command line use their defaults
    #[arg(short = 'y', long)]
    pub(crate) yes: bool,

    /// Hide the progress bars
    #[arg(short, long)]
    pub(crate) quiet: bool,
}

/// Everything a run needs once the user has been asked.
#[derive(Debug, Clone)]
pub(crate) struct RunOptions {
    pub(crate) tag: String,
    pub(crate) output_dir: PathBuf,
    pub(crate) ratings: RatingSet,
}

/// What a completed run did.
#[derive(Debug)]
pub(crate) struct RunSummary {
    pub(crate) page_count: u64,
    pub(crate) pages: PoolReport,
    pub(crate) collected: usize,
    pub(crate) downloads: DownloadReport,
}

/// The two concurrent stages wired to their collaborators.
pub(crate) struct Pipeline {
    resolver: Arc<dyn PageCountResolver>,
    collector: MetadataCollector,
    downloads: DownloadPool,
}

impl Pipeline {
    /// Builds the HTTP backed pipeline described by `config`.
    pub(crate) fn from_config(
        config: &AppConfig,
        workers: Option<usize>,
        progress: ProgressHook,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let client = build_client(&config.http).context("Failed to build HTTP client")?;

        let resolver = Arc::new(CountsPageCountResolver::new(
            client.clone(),
            &config.api.base_url,
            config.api.posts_per_page,
            config.api.max_pages,
        ));
        let fetcher = Arc::new(HttpPostFetcher::new(client.clone(), &config.api.base_url));
        let downloader = Arc::new(HttpPayloadDownloader::new(client, config.download.atomic_writes));

        let collector = MetadataCollector::new(
            fetcher,
            CollectorSettings {
                workers: workers.unwrap_or(config.collector.workers),
                page_retries: config.collector.page_retries,
                retry_base_delay_ms: config.collector.retry_base_delay_ms,
            },
            progress.clone(),
        )
        .with_cancellation(cancel.clone());

        let downloads = DownloadPool::new(
            downloader,
            DownloadSettings {
                workers: workers.unwrap_or(config.download.workers),
                retries: config.download.retries,
                retry_base_delay_ms: config.download.retry_base_delay_ms,
            },
            progress,
        )
        .with_cancellation(cancel);

        Ok(Self {
            resolver,
            collector,
            downloads,
        })
    }

    /// Resolves the page count, collects every accepted post, then downloads them.
    ///
    /// Nothing is written to disk when the tag is not found.
    pub(crate) async fn run(&self, options: &RunOptions) -> Result<RunSummary, Error> {
        let page_count = self.resolver.page_count(&options.tag).await?;

        ensure_directory(&options.output_dir)
            .await
            .with_context(|| format!("Failed to create {}", options.output_dir.display()))?;

        let collection = self
            .collector
            .collect(page_count, &options.tag, options.ratings)
            .await;
        let collected = collection.posts.len();

        let downloads = self
            .downloads
            .run(&collection.posts, &options.output_dir, options.ratings)
            .await;

        Ok(RunSummary {
            page_count,
            pages: collection.pages,
            collected,
            downloads,
        })
    }
}

/// A program class that handles the flow of the downloader user experience and steps of execution.
pub(crate) struct Program {
    args: Args,
    config: AppConfig,
}

impl Program {
    /// Creates a new instance of the program.
    pub(crate) fn new(args: Args, config: AppConfig) -> Self {
        Self { args, config }
    }

    /// Runs the downloader program.
    pub(crate) async fn run(&self) -> Result<(), Error> {
        trace!("Starting danbooru downloader...");
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);

        let options = self.resolve_options()?;
        if options.ratings.is_empty() {
            bail!("No rating selected, nothing to download");
        }

        let renderer = ProgressRenderer::new(!self.args.quiet && std::io::stderr().is_terminal());
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::from_config(&self.config, self.args.workers, renderer.hook(), cancel.clone())?;

        let ctrl_c_token = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing in-flight requests...");
                ctrl_c_token.cancel();
            }
        });

        let span = info_span!("run", run_id = %Uuid::new_v4(), tag = %options.tag);
        let start_time = Instant::now();
        let result = pipeline.run(&options).instrument(span).await;
        renderer.finish();

        let Some(summary) = report_unknown_tag(result)? else {
            return Ok(());
        };

        self.print_summary(&summary, start_time);
        if cancel.is_cancelled() {
            println!("{}", style("Run was interrupted; rerun to fetch the remaining posts.").yellow());
        }
        Ok(())
    }

    /// Fills in every option not given on the command line, prompting when allowed.
    fn resolve_options(&self) -> Result<RunOptions, Error> {
        let interactive = !self.args.yes && std::io::stdin().is_terminal();
        let theme = ColorfulTheme::default();

        let raw_tag = match &self.args.tag {
            Some(tag) => tag.clone(),
            None if interactive => Input::<String>::with_theme(&theme)
                .with_prompt("Tag")
                .interact_text()?,
            None => bail!("A tag is required, pass it with --tag"),
        };
        let tag = normalize_tag(&raw_tag)?;

        let output = match &self.args.output {
            Some(output) => output.clone(),
            None if interactive => Input::<String>::with_theme(&theme)
                .with_prompt("Output Directory")
                .default(self.config.download.output_directory.clone())
                .interact_text()?,
            None => self.config.download.output_directory.clone(),
        };

        let ask = |given: Option<bool>, prompt: &str, default: bool| -> Result<bool, Error> {
            Ok(match given {
                Some(value) => value,
                None if interactive => Confirm::with_theme(&theme)
                    .with_prompt(prompt)
                    .default(default)
                    .interact()?,
                None => default,
            })
        };
        let safe = ask(self.args.safe, "Safe", true)?;
        let risky = ask(self.args.risky, "Risky", false)?;
        let explicit = ask(self.args.explicit, "Explicit", false)?;

        let options = RunOptions {
            tag,
            output_dir: PathBuf::from(output),
            ratings: RatingSet::from_flags(safe, risky, explicit),
        };
        info!(
            "Searching \"{}\" for {} posts into {}",
            options.tag,
            options.ratings,
            options.output_dir.display()
        );
        Ok(options)
    }

    fn print_summary(&self, summary: &RunSummary, start_time: Instant) {
        let downloads = &summary.downloads;
        println!(
            "Scanned {} pages ({} failed) and found {} posts",
            summary.page_count, summary.pages.failed, summary.collected
        );
        println!(
            "Downloaded {} of {} files ({}), {} already present, {} without a file",
            style(downloads.downloaded).green(),
            downloads.planned,
            format_bytes(downloads.bytes),
            downloads.skipped_existing,
            downloads.skipped_missing_url
        );
        let cancelled = summary.pages.cancelled + downloads.pool.cancelled;
        if cancelled > 0 {
            println!("{} queued tasks were cancelled", style(cancelled).yellow());
        }
        if !downloads.failures.is_empty() {
            println!("{} downloads failed:", style(downloads.failures.len()).red());
            for failure in &downloads.failures {
                match &failure.source_url {
                    Some(url) => println!("  post {} ({}): {}", failure.post_id, url, failure.message),
                    None => println!("  post {}: {}", failure.post_id, failure.message),
                }
            }
        }
        println!(
            "Finished downloading after {:.2} seconds",
            start_time.elapsed().as_secs_f64()
        );
        info!(pages = ?summary.pages, downloaded = downloads.downloaded, failed = downloads.failures.len(), "Run finished");
    }
}

/// Tells the user when the tag has no posts, passing every other error on.
///
/// Returns `None` once the message has been shown.
fn report_unknown_tag(result: Result<RunSummary, Error>) -> Result<Option<RunSummary>, Error> {
    match result {
        Ok(summary) => Ok(Some(summary)),
        Err(e) => match e.downcast_ref::<PageCountError>() {
            Some(PageCountError::NotFound { tag }) => {
                error!("No posts found for tag \"{}\"", tag);
                println!("{}", style("This is not a valid tag!").red());
                Ok(None)
            }
            _ => Err(e),
        },
    }
}

/// Formats a byte count for display.
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::danbooru::post::PostId;
    use crate::danbooru::progress::no_progress;
    use std::time::Duration;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer) -> AppConfig {
        let mut config = AppConfig::default();
        config.api.base_url = server.uri();
        config.collector.workers = 2;
        config.download.workers = 2;
        config
    }

    async fn mount_count(server: &MockServer, tag: &str, posts: u64) {
        Mock::given(method("GET"))
            .and(path("/counts/posts.json"))
            .and(query_param("tags", tag))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"counts": {"posts": posts}})))
            .mount(server)
            .await;
    }

    async fn mount_page(server: &MockServer, page: u64, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .and(query_param("page", page.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_file(server: &MockServer, file: &str, expected_hits: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/data/{}", file)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(file.as_bytes().to_vec()))
            .expect(expected_hits)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_end_to_end_cat_scenario() {
        let server = MockServer::start().await;
        let base = server.uri();
        mount_count(&server, "cat", 40).await;
        mount_page(&server, 1, json!([
            {"id": 1, "rating": "s", "file_url": format!("{}/data/1.jpg", base), "file_ext": "jpg"},
            {"id": 2, "rating": "q", "file_url": format!("{}/data/2.png", base), "file_ext": "png"}
        ]))
        .await;
        mount_page(&server, 2, json!([
            {"id": 1, "rating": "s", "file_url": format!("{}/data/1.jpg", base), "file_ext": "jpg"},
            {"id": 3, "rating": "e", "file_url": format!("{}/data/3.jpg", base), "file_ext": "jpg"}
        ]))
        .await;
        // Both runs together fetch each accepted file exactly once.
        mount_file(&server, "1.jpg", 1).await;
        mount_file(&server, "2.png", 0).await;
        mount_file(&server, "3.jpg", 1).await;

        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        let options = RunOptions {
            tag: "cat".to_string(),
            output_dir: out.clone(),
            ratings: RatingSet::from_flags(true, false, true),
        };
        let pipeline =
            Pipeline::from_config(&test_config(&server), None, no_progress(), CancellationToken::new()).unwrap();

        let summary = pipeline.run(&options).await.unwrap();
        assert_eq!(summary.page_count, 2);
        assert_eq!(summary.pages.processed, 2);
        assert_eq!(summary.collected, 2);
        assert_eq!(summary.downloads.downloaded, 2);
        assert_eq!(std::fs::read(out.join("safe").join("1.jpg")).unwrap(), b"1.jpg");
        assert_eq!(std::fs::read(out.join("explicit").join("3.jpg")).unwrap(), b"3.jpg");
        assert!(!out.join("risky").exists());

        let second = pipeline.run(&options).await.unwrap();
        assert_eq!(second.downloads.planned, 0);
        assert_eq!(second.downloads.skipped_existing, 2);
    }

    #[tokio::test]
    async fn test_missing_page_contributes_no_posts() {
        let server = MockServer::start().await;
        mount_count(&server, "dog", 100).await;
        for page in [1u64, 2, 4, 5] {
            mount_page(&server, page, json!([
                {"id": page * 10, "rating": "s"},
                {"id": page * 10 + 1, "rating": "s"}
            ]))
            .await;
        }
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let options = RunOptions {
            tag: "dog".to_string(),
            output_dir: dir.path().join("out"),
            ratings: RatingSet::all(),
        };
        let pipeline =
            Pipeline::from_config(&test_config(&server), Some(3), no_progress(), CancellationToken::new()).unwrap();

        let summary = pipeline.run(&options).await.unwrap();
        assert_eq!(summary.page_count, 5);
        assert_eq!(summary.pages.processed, 5);
        assert_eq!(summary.collected, 8);
        // None of the posts carry a file url.
        assert_eq!(summary.downloads.skipped_missing_url, 8);
        assert_eq!(summary.downloads.planned, 0);
    }

    #[tokio::test]
    async fn test_unknown_tag_does_no_work() {
        let server = MockServer::start().await;
        mount_count(&server, "nothing_here", 0).await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        let options = RunOptions {
            tag: "nothing_here".to_string(),
            output_dir: out.clone(),
            ratings: RatingSet::all(),
        };
        let pipeline =
            Pipeline::from_config(&test_config(&server), None, no_progress(), CancellationToken::new()).unwrap();

        let err = pipeline.run(&options).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PageCountError>(),
            Some(PageCountError::NotFound { .. })
        ));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_counts_server_error_reports_invalid_tag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/counts/posts.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        let options = RunOptions {
            tag: "cat".to_string(),
            output_dir: out.clone(),
            ratings: RatingSet::all(),
        };
        let pipeline =
            Pipeline::from_config(&test_config(&server), None, no_progress(), CancellationToken::new()).unwrap();

        let outcome = report_unknown_tag(pipeline.run(&options).await).unwrap();
        assert!(outcome.is_none());
        assert!(!out.exists());
    }

    #[test]
    fn test_other_errors_are_not_reported_as_invalid_tag() {
        let result = report_unknown_tag(Err(anyhow::anyhow!("disk full")));
        assert_eq!(result.unwrap_err().to_string(), "disk full");
    }

    #[tokio::test]
    async fn test_stalled_requests_fail_without_blocking_the_run() {
        let server = MockServer::start().await;
        let base = server.uri();
        mount_count(&server, "cat", 40).await;
        mount_page(&server, 1, json!([
            {"id": 1, "rating": "s", "file_url": format!("{}/data/1.jpg", base), "file_ext": "jpg"},
            {"id": 2, "rating": "s", "file_url": format!("{}/data/stalled.jpg", base), "file_ext": "jpg"}
        ]))
        .await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"id": 3, "rating": "s"}]))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        mount_file(&server, "1.jpg", 1).await;
        Mock::given(method("GET"))
            .and(path("/data/stalled.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.http.timeout_secs = 1;
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        let options = RunOptions {
            tag: "cat".to_string(),
            output_dir: out.clone(),
            ratings: RatingSet::all(),
        };
        let pipeline = Pipeline::from_config(&config, None, no_progress(), CancellationToken::new()).unwrap();

        let summary = pipeline.run(&options).await.unwrap();
        assert_eq!(summary.pages.enqueued, 2);
        assert_eq!(summary.pages.processed, summary.pages.enqueued);
        assert_eq!(summary.pages.failed, 1);
        assert_eq!(summary.collected, 2);

        let downloads = &summary.downloads;
        assert_eq!(downloads.pool.enqueued, 2);
        assert_eq!(downloads.pool.processed, downloads.pool.enqueued);
        assert_eq!(downloads.downloaded, 1);
        assert_eq!(downloads.failures.len(), 1);
        assert_eq!(downloads.failures[0].post_id, PostId(2));
        assert!(out.join("safe").join("1.jpg").exists());
        assert!(!out.join("safe").join("2.jpg").exists());
    }

    #[test]
    fn test_args_parse_flags() {
        let args = Args::parse_from([
            "danbooru_downloader",
            "-t",
            "cat",
            "-o",
            "pics",
            "--risky",
            "true",
            "--explicit",
            "false",
            "-w",
            "4",
            "-y",
        ]);
        assert_eq!(args.tag.as_deref(), Some("cat"));
        assert_eq!(args.output.as_deref(), Some("pics"));
        assert_eq!(args.safe, None);
        assert_eq!(args.risky, Some(true));
        assert_eq!(args.explicit, Some(false));
        assert_eq!(args.workers, Some(4));
        assert!(args.yes);
        assert_eq!(args.config, PathBuf::from(CONFIG_FILE));
    }

    #[test]
    fn test_non_interactive_defaults() {
        let args = Args::parse_from(["danbooru_downloader", "--tag", "Cat Ears", "--yes"]);
        let program = Program::new(args, AppConfig::default());
        let options = program.resolve_options().unwrap();

        assert_eq!(options.tag, "cat ears");
        assert_eq!(options.output_dir, PathBuf::from("output"));
        assert_eq!(options.ratings, RatingSet::from_flags(true, false, false));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
