//! Repository-hosting collaborator
//!
//! The pipeline and the crawl controller only see this trait. [`crate::github`]
//! implements it against the GitHub REST API; tests use in-memory fakes.

use crate::error::CallError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A repository surfaced by the crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryCandidate {
    pub full_name: String,
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    pub default_branch: Option<String>,
    /// Size estimate in KB as reported by the host.
    pub size_kb: u64,
    /// Filled in once the fork exists.
    pub fork: Option<ForkHandle>,
}

/// The operator's copy of a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkHandle {
    pub full_name: String,
    pub owner: String,
    pub clone_url: String,
    pub default_branch: Option<String>,
    pub size_kb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    /// 1-based.
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub candidates: Vec<RepositoryCandidate>,
    /// `None` when the host reports no further page.
    pub next_page: Option<u32>,
    pub total_count: u64,
}

/// Identity the bot acts as. Resolved once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub login: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestDraft {
    pub title: String,
    pub body: String,
    /// `owner:branch` of the fork.
    pub head: String,
    pub base: String,
    pub maintainer_can_modify: bool,
}

#[async_trait]
pub trait Hosting: Send + Sync {
    /// The authenticated account, with an email usable for commits.
    async fn current_operator(&self) -> Result<Operator, CallError>;

    async fn search_repositories(&self, query: &SearchQuery) -> Result<SearchPage, CallError>;

    /// URL of an issue or pull request on `repo` that was authored by
    /// `author` or mentions `marker` in its body.
    async fn find_existing_proposal(
        &self,
        repo: &RepositoryCandidate,
        author: &str,
        marker: &str,
    ) -> Result<Option<String>, CallError>;

    /// Request a fork. A scheduled (not yet materialized) fork is a success.
    async fn fork(&self, repo: &RepositoryCandidate) -> Result<ForkHandle, CallError>;

    /// Open a pull request against `repo`, returning its URL.
    async fn create_pull_request(
        &self,
        repo: &RepositoryCandidate,
        draft: &PullRequestDraft,
    ) -> Result<String, CallError>;
}
