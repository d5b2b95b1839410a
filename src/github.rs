//! Native GitHub API integration
//!
//! Implements [`Hosting`] over the REST API: repository search, issue search
//! for the dedup check, forks and pull requests. Every response feeds its
//! rate-limit headers into the shared [`QuotaGate`].

use crate::error::CallError;
use crate::hosting::{
    ForkHandle, Hosting, Operator, PullRequestDraft, RepositoryCandidate, SearchPage, SearchQuery,
};
use crate::quota::{ApiResource, Quota, QuotaGate};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const API_TIMEOUT_SECS: u64 = 60;
const USER_AGENT: &str = "unslave-bot";
const API_VERSION: &str = "2022-11-28";
const ISSUE_SEARCH_PER_PAGE: &str = "100";

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

/// Sanitize an API error body to prevent credential leakage.
/// Truncates long responses and redacts potential secrets.
pub fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];

    let truncated = crate::util::truncate(body, MAX_ERROR_BODY_LEN);

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(error details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

#[derive(Deserialize)]
struct OwnerPayload {
    login: String,
}

#[derive(Deserialize)]
struct RepositoryPayload {
    full_name: String,
    name: String,
    owner: OwnerPayload,
    clone_url: String,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    size: u64,
}

impl RepositoryPayload {
    fn into_candidate(self) -> RepositoryCandidate {
        RepositoryCandidate {
            full_name: self.full_name,
            owner: self.owner.login,
            name: self.name,
            clone_url: self.clone_url,
            default_branch: self.default_branch,
            size_kb: self.size,
            fork: None,
        }
    }

    fn into_fork(self) -> ForkHandle {
        ForkHandle {
            full_name: self.full_name,
            owner: self.owner.login,
            clone_url: self.clone_url,
            default_branch: self.default_branch,
            size_kb: self.size,
        }
    }
}

#[derive(Deserialize)]
struct RepositorySearchResponse {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    items: Vec<RepositoryPayload>,
}

#[derive(Deserialize)]
struct IssueSearchResponse {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    items: Vec<IssuePayload>,
}

#[derive(Deserialize)]
struct IssuePayload {
    html_url: String,
}

#[derive(Deserialize)]
struct UserPayload {
    login: String,
    id: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct CreatePrResponse {
    html_url: String,
}

// ============================================================================
// Client
// ============================================================================

pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    quota: QuotaGate,
}

impl GitHubClient {
    pub fn new(token: &str, quota: QuotaGate) -> anyhow::Result<Self> {
        Self::with_base_url(DEFAULT_API_BASE, token, quota)
    }

    /// Point the client at a different API root (GitHub Enterprise, tests).
    pub fn with_base_url(api_base: &str, token: &str, quota: QuotaGate) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            quota,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", self.token))
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    /// Send a request, record its quota headers and map failures.
    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        resource: ApiResource,
    ) -> Result<reqwest::Response, CallError> {
        let resp = self.authed(builder).send().await?;
        self.record_quota(resp.headers(), resource);

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after = header_u64(resp.headers(), "retry-after").map(Duration::from_secs);
        let body = resp.text().await.unwrap_or_default();
        let message = api_error_message(&body);
        debug!(status = status.as_u16(), %message, "GitHub API error");

        let mut err = CallError::from_status(status.as_u16(), message);
        if let CallError::RateLimited {
            retry_after: hint, ..
        } = &mut err
        {
            *hint = retry_after;
        }
        Err(err)
    }

    fn record_quota(&self, headers: &HeaderMap, fallback: ApiResource) {
        let Some(remaining) = header_u64(headers, "x-ratelimit-remaining") else {
            return;
        };
        let Some(reset) = header_u64(headers, "x-ratelimit-reset") else {
            return;
        };
        let Some(reset_at) = Utc.timestamp_opt(reset as i64, 0).single() else {
            return;
        };
        let resource = headers
            .get("x-ratelimit-resource")
            .and_then(|v| v.to_str().ok())
            .and_then(ApiResource::from_header)
            .unwrap_or(fallback);

        self.quota.record(
            resource,
            Quota {
                remaining: remaining.min(u32::MAX as u64) as u32,
                reset_at,
            },
        );
    }

    async fn search_issues(&self, query: &str) -> Result<IssueSearchResponse, CallError> {
        let resp = self
            .send(
                self.http
                    .get(self.url("/search/issues"))
                    .query(&[("q", query), ("per_page", ISSUE_SEARCH_PER_PAGE)]),
                ApiResource::Search,
            )
            .await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl Hosting for GitHubClient {
    async fn current_operator(&self) -> Result<Operator, CallError> {
        let resp = self
            .send(self.http.get(self.url("/user")), ApiResource::Core)
            .await?;
        let user: UserPayload = resp.json().await?;
        Ok(operator_from_user(user))
    }

    async fn search_repositories(&self, query: &SearchQuery) -> Result<SearchPage, CallError> {
        let page = query.page.to_string();
        let per_page = query.per_page.to_string();
        let resp = self
            .send(
                self.http.get(self.url("/search/repositories")).query(&[
                    ("q", query.text.as_str()),
                    ("page", page.as_str()),
                    ("per_page", per_page.as_str()),
                ]),
                ApiResource::Search,
            )
            .await?;

        let next_page = resp
            .headers()
            .get("link")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_next_page);
        let body: RepositorySearchResponse = resp.json().await?;

        Ok(SearchPage {
            candidates: body
                .items
                .into_iter()
                .map(RepositoryPayload::into_candidate)
                .collect(),
            next_page,
            total_count: body.total_count,
        })
    }

    async fn find_existing_proposal(
        &self,
        repo: &RepositoryCandidate,
        author: &str,
        marker: &str,
    ) -> Result<Option<String>, CallError> {
        let by_author = self
            .search_issues(&format!("repo:{} author:{}", repo.full_name, author))
            .await?;
        if by_author.total_count > 0 {
            return Ok(by_author.items.into_iter().next().map(|i| i.html_url));
        }

        let by_marker = self
            .search_issues(&format!("repo:{} \"{}\" in:body", repo.full_name, marker))
            .await?;
        if by_marker.total_count > 0 {
            return Ok(by_marker.items.into_iter().next().map(|i| i.html_url));
        }

        Ok(None)
    }

    async fn fork(&self, repo: &RepositoryCandidate) -> Result<ForkHandle, CallError> {
        let url = self.url(&format!("/repos/{}/{}/forks", repo.owner, repo.name));
        // 202 Accepted means the fork is scheduled; the body already describes it.
        let resp = self
            .send(
                self.http.post(url).json(&serde_json::json!({})),
                ApiResource::Core,
            )
            .await?;
        let payload: RepositoryPayload = resp.json().await?;
        Ok(payload.into_fork())
    }

    async fn create_pull_request(
        &self,
        repo: &RepositoryCandidate,
        draft: &PullRequestDraft,
    ) -> Result<String, CallError> {
        let url = self.url(&format!("/repos/{}/{}/pulls", repo.owner, repo.name));
        let resp = self
            .send(self.http.post(url).json(draft), ApiResource::Core)
            .await?;
        let pr: CreatePrResponse = resp.json().await?;
        Ok(pr.html_url)
    }
}

fn operator_from_user(user: UserPayload) -> Operator {
    let email = user
        .email
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| format!("{}+{}@users.noreply.github.com", user.id, user.login));
    let name = user
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| user.login.clone());
    Operator {
        login: user.login,
        name,
        email,
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Build a readable message from an error body, preferring GitHub's structured form.
fn api_error_message(body: &str) -> String {
    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(body) {
        let detail = api_error
            .errors
            .first()
            .and_then(|e| e.message.clone())
            .unwrap_or_default();
        let message = if detail.is_empty() {
            api_error.message
        } else {
            format!("{}: {}", api_error.message, detail)
        };
        return sanitize_error_body(&message);
    }
    sanitize_error_body(body)
}

/// Extract the `page` number of the `rel="next"` entry of a `Link` header.
pub fn parse_next_page(link: &str) -> Option<u32> {
    link.split(',').find_map(|part| {
        let mut sections = part.split(';');
        let target = sections.next()?.trim();
        let is_next = sections.any(|s| s.trim() == "rel=\"next\"");
        if !is_next {
            return None;
        }
        let target = target.strip_prefix('<')?.strip_suffix('>')?;
        let parsed = url::Url::parse(target).ok()?;
        let page = parsed
            .query_pairs()
            .find(|(k, _)| k == "page")
            .and_then(|(_, v)| v.parse().ok())?;
        Some(page)
    })
}

// ============================================================================
// Tests
// ============================================================================
