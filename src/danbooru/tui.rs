/*
 * Copyright (c) 2022 McSib
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::danbooru::progress::{DownloadOutcome, ProgressEvent, ProgressHook};

const PAGES_TEMPLATE: &str = "{msg} {bar:40.cyan/blue} {pos}/{len}";
const DOWNLOADS_TEMPLATE: &str = "{msg} {bar:40.green/white} {pos}/{len} ({percent}%) [{elapsed_precise}]";
const FALLBACK_TEMPLATE: &str = "{spinner} [{elapsed_precise}] {bar} {pos}/{len}";

/// A builder that helps in making a new [ProgressStyle] for use.
pub(crate) struct ProgressStyleBuilder {
    /// The [ProgressStyle] being built.
    progress_style: ProgressStyle,
}

impl ProgressStyleBuilder {
    /// Sets the template of the progress style, falling back to a plain bar
    /// if the template does not parse.
    ///
    /// # Arguments
    ///
    /// * `msg_template`: The template to use.
    pub(crate) fn template(mut self, msg_template: &str) -> Self {
        match self.progress_style.clone().template(msg_template) {
            Ok(style) => self.progress_style = style,
            Err(err) => {
                warn!("Template error with '{}': {}. Using fallback template.", msg_template, err);
                self.progress_style = match self.progress_style.clone().template(FALLBACK_TEMPLATE) {
                    Ok(style) => style,
                    Err(e) => {
                        error!("Fallback template also failed: {}. Using default bar.", e);
                        ProgressStyle::default_bar()
                    }
                };
            }
        }
        self
    }

    /// Sets the progress style chars.
    pub(crate) fn progress_chars(mut self, chars: &str) -> Self {
        self.progress_style = self.progress_style.progress_chars(chars);
        self
    }

    pub(crate) fn build(self) -> ProgressStyle {
        self.progress_style
    }
}

impl Default for ProgressStyleBuilder {
    fn default() -> Self {
        Self {
            progress_style: ProgressStyle::default_bar(),
        }
    }
}

#[derive(Default)]
struct Bars {
    pages: Option<ProgressBar>,
    downloads: Option<ProgressBar>,
    posts_found: usize,
}

/// Renders pipeline progress events as terminal progress bars.
#[derive(Clone)]
pub struct ProgressRenderer {
    bars: Arc<Mutex<Bars>>,
    visible: bool,
}

impl ProgressRenderer {
    /// Creates a renderer; a hidden renderer tracks state but draws nothing.
    pub fn new(visible: bool) -> Self {
        Self {
            bars: Arc::new(Mutex::new(Bars::default())),
            visible,
        }
    }

    fn new_bar(&self, len: u64, template: &str, message: String) -> ProgressBar {
        let bar = ProgressBar::new(len);
        bar.set_style(
            ProgressStyleBuilder::default()
                .template(template)
                .progress_chars("=>-")
                .build(),
        );
        if self.visible {
            bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
            bar.enable_steady_tick(Duration::from_millis(200));
        } else {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_message(message);
        if len == 0 {
            bar.finish();
        }
        bar
    }

    /// Handles one event from either stage.
    pub fn handle(&self, event: ProgressEvent) {
        let mut bars = self.bars.lock();
        match event {
            ProgressEvent::PagesPlanned { total } => {
                let message = format!("Adding {} pages worth of posts to queue", total);
                bars.pages = Some(self.new_bar(total, PAGES_TEMPLATE, message));
            }
            ProgressEvent::PageProcessed {
                page_index,
                page_count,
                items,
                failed,
            } => {
                bars.posts_found += items;
                let found = bars.posts_found;
                if let Some(bar) = &bars.pages {
                    if failed {
                        bar.println(format!("Page {} of {} could not be fetched", page_index + 1, page_count));
                    }
                    bar.set_message(format!(
                        "Adding {} pages worth of posts to queue ({} posts)",
                        page_count, found
                    ));
                    bar.inc(1);
                    if bar.position() >= bar.length().unwrap_or(0) {
                        bar.finish();
                    }
                }
            }
            ProgressEvent::DownloadsPlanned { total } => {
                let message = format!("Downloading {} posts", total);
                bars.downloads = Some(self.new_bar(total as u64, DOWNLOADS_TEMPLATE, message));
            }
            ProgressEvent::DownloadFinished { post_id, outcome } => {
                if let Some(bar) = &bars.downloads {
                    match &outcome {
                        DownloadOutcome::Downloaded { bytes } => trace!("Post {} stored ({} bytes)", post_id, bytes),
                        DownloadOutcome::Failed { message } => {
                            bar.println(format!("Post {} failed: {}", post_id, message));
                        }
                    }
                    bar.inc(1);
                    if bar.position() >= bar.length().unwrap_or(0) {
                        bar.finish();
                    }
                }
            }
        }
    }

    /// Stops any bar left unfinished, e.g. after an interrupted run.
    pub fn finish(&self) {
        let bars = self.bars.lock();
        for bar in [&bars.pages, &bars.downloads].into_iter().flatten() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }

    /// Position of the (pages, downloads) bars.
    #[cfg(test)]
    pub fn positions(&self) -> (u64, u64) {
        let bars = self.bars.lock();
        (
            bars.pages.as_ref().map_or(0, |b| b.position()),
            bars.downloads.as_ref().map_or(0, |b| b.position()),
        )
    }

    /// Wraps the renderer as a pipeline progress hook.
    pub fn hook(&self) -> ProgressHook {
        let renderer = self.clone();
        Arc::new(move |event| renderer.handle(event))
    }
}
