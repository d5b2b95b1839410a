//! Rate-adaptive crawl over GitHub repository search
//!
//! Search results are unstable and capped, so discovery walks a moving
//! `created:` window backward through time, one hour or one day at a time.
//! Each window is paged to exhaustion before the window moves. A page that
//! keeps failing costs at most its own window.

use crate::context::CallContext;
use crate::error::CallError;
use crate::hosting::{Hosting, RepositoryCandidate, SearchQuery};
use crate::quota::ApiResource;
use crate::retry::{with_retry, Call, RetryPolicy};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_KEYWORD: &str = "slave";
pub const DEFAULT_PER_PAGE: u32 = 10;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Hour,
    Day,
}

impl Granularity {
    pub fn unit(&self) -> Duration {
        match self {
            Granularity::Hour => Duration::hours(1),
            Granularity::Day => Duration::days(1),
        }
    }

    /// Start of the window containing `ts`.
    pub fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let hour = match self {
            Granularity::Hour => ts.hour(),
            Granularity::Day => 0,
        };
        ts.date_naive()
            .and_hms_opt(hour, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(ts)
    }
}

/// Position of the crawl: one time window and a page within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchCursor {
    pub window_start: DateTime<Utc>,
    pub granularity: Granularity,
    /// 1-based.
    pub page: u32,
    pub per_page: u32,
}

impl SearchCursor {
    pub fn starting_at(ts: DateTime<Utc>, granularity: Granularity, per_page: u32) -> Self {
        Self {
            window_start: granularity.align(ts),
            granularity,
            page: 1,
            per_page: per_page.max(1),
        }
    }

    /// Exclusive end of the window.
    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start + self.granularity.unit()
    }

    pub fn created_filter(&self) -> String {
        match self.granularity {
            Granularity::Day => format!("created:{}", self.window_start.format("%Y-%m-%d")),
            Granularity::Hour => {
                let last = self.window_end() - Duration::seconds(1);
                format!(
                    "created:{}..{}",
                    self.window_start.format("%Y-%m-%dT%H:%M:%SZ"),
                    last.format("%Y-%m-%dT%H:%M:%SZ")
                )
            }
        }
    }

    /// The window one unit earlier, first page.
    pub fn previous_window(&self) -> Self {
        Self {
            window_start: self.window_start - self.granularity.unit(),
            page: 1,
            ..*self
        }
    }
}

/// Fixed parts of the search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFilters {
    pub keyword: String,
    pub language: Option<String>,
    pub max_size_kb: Option<u64>,
}

impl Default for QueryFilters {
    fn default() -> Self {
        Self {
            keyword: DEFAULT_KEYWORD.to_string(),
            language: None,
            max_size_kb: None,
        }
    }
}

impl QueryFilters {
    pub fn query_for(&self, cursor: &SearchCursor) -> String {
        let mut parts = vec![self.keyword.clone(), cursor.created_filter()];
        if let Some(language) = &self.language {
            parts.push(format!("language:{}", language));
        }
        if let Some(size) = self.max_size_kb {
            parts.push(format!("size:<={}", size));
        }
        parts.join(" ")
    }
}

/// Result of crawling one window.
#[derive(Debug, Clone)]
pub struct WindowBatch {
    pub candidates: Vec<RepositoryCandidate>,
    /// Where the next call should start.
    pub cursor: SearchCursor,
    /// No further windows fall inside the configured range.
    pub done: bool,
    pub pages: u32,
    /// Set when the window was abandoned after a failing page.
    pub error: Option<CallError>,
}

pub struct CrawlController<H: Hosting> {
    hosting: Arc<H>,
    filters: QueryFilters,
    until: Option<DateTime<Utc>>,
    retry: RetryPolicy,
}

impl<H: Hosting> CrawlController<H> {
    pub fn new(
        hosting: Arc<H>,
        filters: QueryFilters,
        until: Option<DateTime<Utc>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            hosting,
            filters,
            until,
            retry,
        }
    }

    fn is_past_range(&self, cursor: &SearchCursor) -> bool {
        self.until
            .map(|until| cursor.window_start < cursor.granularity.align(until))
            .unwrap_or(false)
    }

    /// Page through the cursor's window, then move the cursor one window back.
    ///
    /// Only cancellation is returned as an error. A page that fails for any
    /// other reason ends the window early and is reported in the batch.
    pub async fn next_window(
        &self,
        ctx: &CallContext,
        cursor: SearchCursor,
    ) -> Result<WindowBatch, CallError> {
        if self.is_past_range(&cursor) {
            return Ok(WindowBatch {
                candidates: Vec::new(),
                cursor,
                done: true,
                pages: 0,
                error: None,
            });
        }

        let text = self.filters.query_for(&cursor);
        let mut page = cursor.page.max(1);
        let mut pages = 0;
        let mut candidates = Vec::new();
        let mut error = None;

        loop {
            let query = SearchQuery {
                text: text.clone(),
                page,
                per_page: cursor.per_page,
            };
            let hosting = self.hosting.as_ref();
            let query_ref = &query;
            let result = with_retry(
                ctx,
                Call::api("search", ApiResource::Search),
                &self.retry,
                move || hosting.search_repositories(query_ref),
            )
            .await;

            match result {
                Ok(found) => {
                    pages += 1;
                    debug!(
                        query = %text,
                        page,
                        results = found.candidates.len(),
                        total = found.total_count,
                        "search page"
                    );
                    candidates.extend(found.candidates);
                    match found.next_page {
                        Some(next) if next > page => page = next,
                        _ => break,
                    }
                }
                Err(CallError::Cancelled) => return Err(CallError::Cancelled),
                Err(err) => {
                    warn!(query = %text, page, error = %err, "search failed, moving to next window");
                    error = Some(err);
                    break;
                }
            }
        }

        let next = cursor.previous_window();
        let done = self.is_past_range(&next);
        info!(
            window = %cursor.window_start.to_rfc3339(),
            pages,
            candidates = candidates.len(),
            "window crawled"
        );
        Ok(WindowBatch {
            candidates,
            cursor: next,
            done,
            pages,
            error,
        })
    }
}
