//! Crawl loop
//!
//! Feeds every candidate of every window through the [`Remediator`] until
//! the crawl runs out of range, hits its window limit, or is cancelled.

use crate::context::CallContext;
use crate::crawl::{CrawlController, SearchCursor};
use crate::error::CallError;
use crate::git_ops::Vcs;
use crate::hosting::Hosting;
use crate::pipeline::{AttemptReport, Remediator};
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub windows: u32,
    pub pages: u32,
    pub search_errors: u32,
    /// Distinct candidates handed to the pipeline.
    pub attempted: usize,
    /// Candidates seen earlier in this run.
    pub repeats: usize,
    pub proposed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub proposals: Vec<String>,
    pub cancelled: bool,
}

impl RunSummary {
    fn record(&mut self, report: &AttemptReport) {
        self.attempted += 1;
        if report.is_done() {
            self.proposed += 1;
            if let Some(url) = &report.proposal_url {
                self.proposals.push(url.clone());
            }
        } else if report.skip_reason().is_some() {
            self.skipped += 1;
        } else {
            self.failed += 1;
        }
    }
}

pub struct Runner<H: Hosting, V: Vcs + 'static> {
    crawl: CrawlController<H>,
    remediator: Remediator<H, V>,
    seen: HashSet<String>,
    max_windows: Option<u32>,
}

impl<H: Hosting, V: Vcs + 'static> Runner<H, V> {
    pub fn new(
        crawl: CrawlController<H>,
        remediator: Remediator<H, V>,
        max_windows: Option<u32>,
    ) -> Self {
        Self {
            crawl,
            remediator,
            seen: HashSet::new(),
            max_windows,
        }
    }

    pub async fn run(&mut self, ctx: &CallContext, start: SearchCursor) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut cursor = start;

        'windows: loop {
            if ctx.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if self.max_windows.is_some_and(|max| summary.windows >= max) {
                break;
            }

            let batch = match self.crawl.next_window(ctx, cursor).await {
                Ok(batch) => batch,
                Err(_) => {
                    summary.cancelled = true;
                    break;
                }
            };
            if batch.pages > 0 || batch.error.is_some() {
                summary.windows += 1;
            }
            summary.pages += batch.pages;
            if batch.error.is_some() {
                summary.search_errors += 1;
            }

            for candidate in batch.candidates {
                if ctx.is_cancelled() {
                    summary.cancelled = true;
                    break 'windows;
                }
                if !self.seen.insert(candidate.full_name.to_lowercase()) {
                    summary.repeats += 1;
                    continue;
                }
                let report = self.remediator.remediate(ctx, candidate).await;
                if matches!(report.error, Some(CallError::Cancelled)) {
                    summary.cancelled = true;
                    break 'windows;
                }
                summary.record(&report);
            }

            cursor = batch.cursor;
            if batch.done {
                break;
            }
        }

        info!(
            windows = summary.windows,
            attempted = summary.attempted,
            proposed = summary.proposed,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "crawl finished"
        );
        summary
    }
}
