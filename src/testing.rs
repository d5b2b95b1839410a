//! In-memory collaborators for tests

use crate::error::CallError;
use crate::git_ops::{CommitAuthor, Vcs};
use crate::hosting::{
    ForkHandle, Hosting, Operator, PullRequestDraft, RepositoryCandidate, SearchPage, SearchQuery,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub fn candidate(full_name: &str) -> RepositoryCandidate {
    let (owner, name) = full_name.split_once('/').unwrap_or(("owner", full_name));
    RepositoryCandidate {
        full_name: full_name.to_string(),
        owner: owner.to_string(),
        name: name.to_string(),
        clone_url: format!("https://github.com/{}.git", full_name),
        default_branch: Some("main".to_string()),
        size_kb: 10,
        fork: None,
    }
}

pub fn operator() -> Operator {
    Operator {
        login: "unslave-bot".to_string(),
        name: "Unslave Bot".to_string(),
        email: "bot@example.com".to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Hosting
// ============================================================================

#[derive(Default)]
struct HostingState {
    pages: HashMap<(String, u32), SearchPage>,
    search_failures: HashMap<(String, u32), VecDeque<CallError>>,
    searches: Vec<SearchQuery>,
    existing_proposal: Option<String>,
    dedup_calls: u32,
    fork_size_kb: u64,
    fork_calls: u32,
    pr_failures: VecDeque<CallError>,
    pull_requests: Vec<(String, PullRequestDraft)>,
}

#[derive(Default)]
pub struct FakeHosting {
    state: Mutex<HostingState>,
}

impl FakeHosting {
    pub fn with_page(self, text: &str, page: u32, result: SearchPage) -> Self {
        lock(&self.state)
            .pages
            .insert((text.to_string(), page), result);
        self
    }

    pub fn failing_search(self, text: &str, page: u32, errors: Vec<CallError>) -> Self {
        lock(&self.state)
            .search_failures
            .insert((text.to_string(), page), errors.into());
        self
    }

    pub fn with_existing_proposal(self, url: &str) -> Self {
        lock(&self.state).existing_proposal = Some(url.to_string());
        self
    }

    pub fn with_fork_size(self, size_kb: u64) -> Self {
        lock(&self.state).fork_size_kb = size_kb;
        self
    }

    pub fn failing_pull_requests(self, errors: Vec<CallError>) -> Self {
        lock(&self.state).pr_failures = errors.into();
        self
    }

    pub fn searches(&self) -> Vec<SearchQuery> {
        lock(&self.state).searches.clone()
    }

    pub fn dedup_calls(&self) -> u32 {
        lock(&self.state).dedup_calls
    }

    pub fn fork_calls(&self) -> u32 {
        lock(&self.state).fork_calls
    }

    pub fn pull_requests(&self) -> Vec<(String, PullRequestDraft)> {
        lock(&self.state).pull_requests.clone()
    }
}

#[async_trait]
impl Hosting for FakeHosting {
    async fn current_operator(&self) -> Result<Operator, CallError> {
        Ok(operator())
    }

    async fn search_repositories(&self, query: &SearchQuery) -> Result<SearchPage, CallError> {
        let mut state = lock(&self.state);
        state.searches.push(query.clone());
        let key = (query.text.clone(), query.page);
        if let Some(err) = state
            .search_failures
            .get_mut(&key)
            .and_then(|errors| errors.pop_front())
        {
            return Err(err);
        }
        Ok(state.pages.get(&key).cloned().unwrap_or_default())
    }

    async fn find_existing_proposal(
        &self,
        _repo: &RepositoryCandidate,
        _author: &str,
        _marker: &str,
    ) -> Result<Option<String>, CallError> {
        let mut state = lock(&self.state);
        state.dedup_calls += 1;
        Ok(state.existing_proposal.clone())
    }

    async fn fork(&self, repo: &RepositoryCandidate) -> Result<ForkHandle, CallError> {
        let mut state = lock(&self.state);
        state.fork_calls += 1;
        Ok(ForkHandle {
            full_name: format!("{}/{}", operator().login, repo.name),
            owner: operator().login,
            clone_url: format!("https://github.com/{}/{}.git", operator().login, repo.name),
            default_branch: repo.default_branch.clone(),
            size_kb: state.fork_size_kb,
        })
    }

    async fn create_pull_request(
        &self,
        repo: &RepositoryCandidate,
        draft: &PullRequestDraft,
    ) -> Result<String, CallError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.pr_failures.pop_front() {
            return Err(err);
        }
        state
            .pull_requests
            .push((repo.full_name.clone(), draft.clone()));
        Ok(format!(
            "https://github.com/{}/pull/{}",
            repo.full_name,
            state.pull_requests.len()
        ))
    }
}

// ============================================================================
// Version control
// ============================================================================

#[derive(Default)]
struct VcsState {
    seed_files: Vec<(PathBuf, String)>,
    clones: Vec<(String, Option<String>, PathBuf)>,
    clone_failures: VecDeque<CallError>,
    branches: Vec<String>,
    fail_stage: HashSet<PathBuf>,
    staged: Vec<PathBuf>,
    commits: Vec<(CommitAuthor, String)>,
    push_failures: VecDeque<CallError>,
    push_attempts: u32,
    pushes: Vec<(String, String)>,
}

/// Records every call. `clone_branch` writes the seeded files into the
/// destination so the rewriter has something to walk.
#[derive(Default)]
pub struct RecordingVcs {
    state: Mutex<VcsState>,
}

impl RecordingVcs {
    pub fn with_file(self, relative: &str, content: &str) -> Self {
        lock(&self.state)
            .seed_files
            .push((PathBuf::from(relative), content.to_string()));
        self
    }

    pub fn failing_clones(self, errors: Vec<CallError>) -> Self {
        lock(&self.state).clone_failures = errors.into();
        self
    }

    pub fn failing_pushes(self, errors: Vec<CallError>) -> Self {
        lock(&self.state).push_failures = errors.into();
        self
    }

    pub fn fail_staging(&self, relative: &Path) {
        lock(&self.state).fail_stage.insert(relative.to_path_buf());
    }

    pub fn clone_count(&self) -> usize {
        lock(&self.state).clones.len()
    }

    pub fn clones(&self) -> Vec<(String, Option<String>, PathBuf)> {
        lock(&self.state).clones.clone()
    }

    pub fn branches(&self) -> Vec<String> {
        lock(&self.state).branches.clone()
    }

    pub fn staged_paths(&self) -> Vec<PathBuf> {
        lock(&self.state).staged.clone()
    }

    pub fn commits(&self) -> Vec<(CommitAuthor, String)> {
        lock(&self.state).commits.clone()
    }

    pub fn push_attempts(&self) -> u32 {
        lock(&self.state).push_attempts
    }

    pub fn pushes(&self) -> Vec<(String, String)> {
        lock(&self.state).pushes.clone()
    }
}

impl Vcs for RecordingVcs {
    fn clone_branch(&self, url: &str, branch: Option<&str>, dest: &Path) -> Result<(), CallError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.clone_failures.pop_front() {
            return Err(err);
        }
        state
            .clones
            .push((url.to_string(), branch.map(str::to_string), dest.to_path_buf()));
        for (relative, content) in &state.seed_files {
            let path = dest.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, content)?;
        }
        Ok(())
    }

    fn create_branch(&self, _repo_path: &Path, name: &str) -> Result<(), CallError> {
        lock(&self.state).branches.push(name.to_string());
        Ok(())
    }

    fn stage(&self, _repo_path: &Path, relative: &Path) -> Result<(), CallError> {
        let mut state = lock(&self.state);
        if state.fail_stage.contains(relative) {
            return Err(CallError::git("add", "index locked", false));
        }
        state.staged.push(relative.to_path_buf());
        Ok(())
    }

    fn commit(
        &self,
        _repo_path: &Path,
        author: &CommitAuthor,
        message: &str,
    ) -> Result<String, CallError> {
        let mut state = lock(&self.state);
        state.commits.push((author.clone(), message.to_string()));
        Ok(format!("{:040x}", state.commits.len()))
    }

    fn push(
        &self,
        _repo_path: &Path,
        remote_url: &str,
        branch: &str,
        _token: &str,
    ) -> Result<(), CallError> {
        let mut state = lock(&self.state);
        state.push_attempts += 1;
        if let Some(err) = state.push_failures.pop_front() {
            return Err(err);
        }
        state
            .pushes
            .push((remote_url.to_string(), branch.to_string()));
        Ok(())
    }
}
