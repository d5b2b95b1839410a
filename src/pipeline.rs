//! Remediation state machine
//!
//! Drives one [`RepositoryCandidate`] from discovery to an open pull request:
//!
//! ```text
//! Discovered -> Deduplicated -> Forked -> Cloned -> BranchCreated
//!            -> Rewritten -> Committed -> Pushed -> Proposed -> Done
//! ```
//!
//! Any state can end in `Skipped` (a policy outcome, not an error) or
//! `Failed`. Neither stops the crawl; the runner moves on to the next
//! candidate.

use crate::context::CallContext;
use crate::error::CallError;
use crate::git_ops::{CommitAuthor, Vcs};
use crate::hosting::{ForkHandle, Hosting, Operator, PullRequestDraft, RepositoryCandidate};
use crate::ledger::Ledger;
use crate::proposal::{self, FIX_MARKER};
use crate::quota::ApiResource;
use crate::retry::{with_retry, Call, RetryPlan};
use crate::rewrite::{Rewriter, WalkSummary};
use crate::workspace::Workspace;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BRANCH_NAME: &str = "slav-removal";
pub const FALLBACK_BASE_BRANCH: &str = "master";
pub const DEFAULT_MAX_SIZE_KB: u64 = 100_000;
const FORK_SETTLE_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Already in the local ledger.
    AlreadyHandled,
    /// The host has an issue or pull request for it already.
    AlreadyProposed(String),
    Oversized { size_kb: u64, limit_kb: u64 },
    NothingToChange,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyHandled => write!(f, "already handled"),
            SkipReason::AlreadyProposed(url) => write!(f, "already proposed at {}", url),
            SkipReason::Oversized { size_kb, limit_kb } => {
                write!(f, "too large ({} KB > {} KB)", size_kb, limit_kb)
            }
            SkipReason::NothingToChange => write!(f, "nothing to change"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationState {
    Discovered,
    Deduplicated,
    Forked,
    Cloned,
    BranchCreated,
    Rewritten,
    Committed,
    Pushed,
    Proposed,
    Done,
    Skipped(SkipReason),
    Failed(String),
}

impl RemediationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemediationState::Done | RemediationState::Skipped(_) | RemediationState::Failed(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemediationState::Discovered => "discovered",
            RemediationState::Deduplicated => "deduplicated",
            RemediationState::Forked => "forked",
            RemediationState::Cloned => "cloned",
            RemediationState::BranchCreated => "branch_created",
            RemediationState::Rewritten => "rewritten",
            RemediationState::Committed => "committed",
            RemediationState::Pushed => "pushed",
            RemediationState::Proposed => "proposed",
            RemediationState::Done => "done",
            RemediationState::Skipped(_) => "skipped",
            RemediationState::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationSettings {
    pub branch: String,
    /// Forks reporting more than this are skipped before cloning.
    pub max_size_kb: u64,
    #[serde(with = "duration_secs")]
    pub fork_settle: Duration,
    /// PR base when the upstream default branch is unknown.
    pub fallback_base: String,
    pub retry: RetryPlan,
}

impl Default for RemediationSettings {
    fn default() -> Self {
        Self {
            branch: DEFAULT_BRANCH_NAME.to_string(),
            max_size_kb: DEFAULT_MAX_SIZE_KB,
            fork_settle: Duration::from_secs(FORK_SETTLE_SECS),
            fallback_base: FALLBACK_BASE_BRANCH.to_string(),
            retry: RetryPlan::default(),
        }
    }
}

/// Working state of one attempt. Dropped once it reaches a terminal state.
#[derive(Debug)]
pub struct RemediationAttempt {
    pub candidate: RepositoryCandidate,
    pub state: RemediationState,
    pub history: Vec<RemediationState>,
    pub workdir: PathBuf,
    pub branch: String,
    pub rewrite: Option<WalkSummary>,
    pub commit: Option<String>,
    pub proposal_url: Option<String>,
    pub error: Option<CallError>,
}

impl RemediationAttempt {
    fn new(candidate: RepositoryCandidate, workdir: PathBuf, branch: &str) -> Self {
        Self {
            candidate,
            state: RemediationState::Discovered,
            history: Vec::new(),
            workdir,
            branch: branch.to_string(),
            rewrite: None,
            commit: None,
            proposal_url: None,
            error: None,
        }
    }

    fn advance(&mut self, next: RemediationState) {
        debug!(
            repo = %self.candidate.full_name,
            from = self.state.name(),
            to = next.name(),
            "state transition"
        );
        let previous = std::mem::replace(&mut self.state, next);
        self.history.push(previous);
    }

    fn skip(&mut self, reason: SkipReason) {
        self.advance(RemediationState::Skipped(reason));
    }

    fn fail(&mut self, err: CallError) {
        self.advance(RemediationState::Failed(err.to_string()));
        self.error = Some(err);
    }

    fn into_report(self) -> AttemptReport {
        let files_changed = self.rewrite.as_ref().map(|s| s.changed).unwrap_or(0);
        let mut history = self.history;
        history.push(self.state.clone());
        AttemptReport {
            full_name: self.candidate.full_name,
            state: self.state,
            history,
            files_changed,
            proposal_url: self.proposal_url,
            error: self.error,
        }
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub full_name: String,
    /// Terminal state.
    pub state: RemediationState,
    /// Every state visited, ending with `state`.
    pub history: Vec<RemediationState>,
    pub files_changed: usize,
    pub proposal_url: Option<String>,
    pub error: Option<CallError>,
}

impl AttemptReport {
    pub fn visited(&self, state: &RemediationState) -> bool {
        self.history.contains(state)
    }

    pub fn is_done(&self) -> bool {
        self.state == RemediationState::Done
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match &self.state {
            RemediationState::Skipped(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, RemediationState::Failed(_))
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, CallError>
where
    F: FnOnce() -> Result<T, CallError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| CallError::Local(format!("Background task failed: {}", e)))?
}

pub struct Remediator<H: Hosting, V: Vcs + 'static> {
    hosting: Arc<H>,
    vcs: Arc<V>,
    rewriter: Arc<Rewriter>,
    ledger: Arc<Mutex<Ledger>>,
    workspace: Workspace,
    operator: Operator,
    token: String,
    settings: RemediationSettings,
}

impl<H: Hosting, V: Vcs + 'static> Remediator<H, V> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosting: Arc<H>,
        vcs: Arc<V>,
        rewriter: Rewriter,
        ledger: Ledger,
        workspace: Workspace,
        operator: Operator,
        token: String,
        settings: RemediationSettings,
    ) -> Self {
        Self {
            hosting,
            vcs,
            rewriter: Arc::new(rewriter),
            ledger: Arc::new(Mutex::new(ledger)),
            workspace,
            operator,
            token,
            settings,
        }
    }

    pub fn ledger(&self) -> MutexGuard<'_, Ledger> {
        lock_ledger(&self.ledger)
    }

    /// Run one candidate to a terminal state.
    pub async fn remediate(
        &mut self,
        ctx: &CallContext,
        candidate: RepositoryCandidate,
    ) -> AttemptReport {
        let mut attempt = RemediationAttempt::new(
            candidate,
            self.workspace.path().to_path_buf(),
            &self.settings.branch,
        );

        if let Err(err) = self.drive(ctx, &mut attempt).await {
            attempt.fail(err);
        }

        let report = attempt.into_report();
        debug_assert!(report.state.is_terminal());
        match &report.state {
            RemediationState::Done => info!(
                repo = %report.full_name,
                files = report.files_changed,
                url = report.proposal_url.as_deref().unwrap_or_default(),
                "proposal opened"
            ),
            RemediationState::Skipped(reason) => {
                info!(repo = %report.full_name, reason = %reason, "skipped")
            }
            RemediationState::Failed(error) => {
                warn!(repo = %report.full_name, error = %error, "remediation failed")
            }
            _ => {}
        }
        report
    }

    async fn drive(
        &mut self,
        ctx: &CallContext,
        attempt: &mut RemediationAttempt,
    ) -> Result<(), CallError> {
        if let Some(reason) = self.deduplicate(ctx, &attempt.candidate).await? {
            attempt.skip(reason);
            return Ok(());
        }
        attempt.advance(RemediationState::Deduplicated);

        let fork = self.fork(ctx, &attempt.candidate).await?;
        attempt.candidate.fork = Some(fork.clone());
        attempt.advance(RemediationState::Forked);
        if fork.size_kb > self.settings.max_size_kb {
            attempt.skip(SkipReason::Oversized {
                size_kb: fork.size_kb,
                limit_kb: self.settings.max_size_kb,
            });
            return Ok(());
        }
        // Forks materialize asynchronously on the host.
        ctx.sleep(self.settings.fork_settle).await?;

        self.clone_fork(ctx, &fork).await?;
        attempt.advance(RemediationState::Cloned);

        let vcs = Arc::clone(&self.vcs);
        let workdir = attempt.workdir.clone();
        let branch = attempt.branch.clone();
        run_blocking(move || vcs.create_branch(&workdir, &branch)).await?;
        attempt.advance(RemediationState::BranchCreated);

        let summary = self.rewrite(&attempt.workdir).await?;
        let verdict = judge_rewrite(&summary);
        attempt.rewrite = Some(summary);
        if let Some(reason) = verdict? {
            attempt.skip(reason);
            return Ok(());
        }
        attempt.advance(RemediationState::Rewritten);

        let title = proposal::random_title();
        let vcs = Arc::clone(&self.vcs);
        let workdir = attempt.workdir.clone();
        let author = CommitAuthor {
            name: self.operator.name.clone(),
            email: self.operator.email.clone(),
        };
        let message = title.clone();
        let commit = run_blocking(move || vcs.commit(&workdir, &author, &message)).await?;
        attempt.commit = Some(commit);
        attempt.advance(RemediationState::Committed);

        self.push(ctx, &attempt.workdir, &fork, &attempt.branch).await?;
        attempt.advance(RemediationState::Pushed);

        let draft = PullRequestDraft {
            title,
            body: proposal::description(),
            head: format!("{}:{}", fork.owner, attempt.branch),
            base: attempt
                .candidate
                .default_branch
                .clone()
                .unwrap_or_else(|| self.settings.fallback_base.clone()),
            maintainer_can_modify: true,
        };
        let hosting = self.hosting.as_ref();
        let candidate = &attempt.candidate;
        let draft = &draft;
        let url = with_retry(
            ctx,
            Call::api("pull request", ApiResource::Core),
            &self.settings.retry.pull_request,
            move || hosting.create_pull_request(candidate, draft),
        )
        .await?;
        attempt.proposal_url = Some(url);
        attempt.advance(RemediationState::Proposed);

        self.remember(&attempt.candidate.full_name).await;
        attempt.advance(RemediationState::Done);
        Ok(())
    }

    async fn deduplicate(
        &self,
        ctx: &CallContext,
        candidate: &RepositoryCandidate,
    ) -> Result<Option<SkipReason>, CallError> {
        if self.ledger().contains(&candidate.full_name) {
            return Ok(Some(SkipReason::AlreadyHandled));
        }

        let hosting = self.hosting.as_ref();
        let login = self.operator.login.as_str();
        let existing = with_retry(
            ctx,
            Call::api("dedup", ApiResource::Search),
            &self.settings.retry.read,
            move || hosting.find_existing_proposal(candidate, login, FIX_MARKER),
        )
        .await?;

        match existing {
            Some(url) => {
                self.remember(&candidate.full_name).await;
                Ok(Some(SkipReason::AlreadyProposed(url)))
            }
            None => Ok(None),
        }
    }

    async fn fork(
        &self,
        ctx: &CallContext,
        candidate: &RepositoryCandidate,
    ) -> Result<ForkHandle, CallError> {
        let hosting = self.hosting.as_ref();
        with_retry(
            ctx,
            Call::api("fork", ApiResource::Core),
            &self.settings.retry.fork,
            move || hosting.fork(candidate),
        )
        .await
    }

    async fn clone_fork(&self, ctx: &CallContext, fork: &ForkHandle) -> Result<(), CallError> {
        with_retry(ctx, Call::local("clone"), &self.settings.retry.clone, || {
            let vcs = Arc::clone(&self.vcs);
            let url = fork.clone_url.clone();
            let branch = fork.default_branch.clone();
            let dest = self.workspace.path().to_path_buf();
            let reset = self.workspace.reset();
            async move {
                reset?;
                run_blocking(move || vcs.clone_branch(&url, branch.as_deref(), &dest)).await
            }
        })
        .await
    }

    async fn rewrite(&self, workdir: &Path) -> Result<WalkSummary, CallError> {
        let rewriter = Arc::clone(&self.rewriter);
        let vcs = Arc::clone(&self.vcs);
        let root = workdir.to_path_buf();
        run_blocking(move || Ok(rewriter.rewrite(&root, vcs.as_ref()))).await
    }

    async fn push(
        &self,
        ctx: &CallContext,
        workdir: &Path,
        fork: &ForkHandle,
        branch: &str,
    ) -> Result<(), CallError> {
        with_retry(ctx, Call::local("push"), &self.settings.retry.push, || {
            let vcs = Arc::clone(&self.vcs);
            let workdir = workdir.to_path_buf();
            let url = fork.clone_url.clone();
            let branch = branch.to_string();
            let token = self.token.clone();
            run_blocking(move || vcs.push(&workdir, &url, &branch, &token))
        })
        .await
    }

    /// Ledger writes take a file lock, so they run off the async workers.
    async fn remember(&self, full_name: &str) {
        let ledger = Arc::clone(&self.ledger);
        let name = full_name.to_string();
        let recorded = run_blocking(move || {
            lock_ledger(&ledger)
                .record(&name)
                .map_err(|e| CallError::Local(format!("{:#}", e)))
        })
        .await;
        if let Err(err) = recorded {
            warn!(repo = %full_name, error = %err, "failed to update ledger");
        }
    }
}

fn lock_ledger(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(|e| e.into_inner())
}

/// Decide how a finished rewrite moves the attempt on. `Ok(None)` means
/// there is something staged to commit.
fn judge_rewrite(summary: &WalkSummary) -> Result<Option<SkipReason>, CallError> {
    if summary.changed == 0 {
        // Unreadable or unwritable files are an I/O failure, not a clean tree.
        if let Some(first) = summary.errors().next() {
            return Err(CallError::Local(format!(
                "{} file(s) could not be rewritten; {}: {}",
                summary.failed,
                first.path.display(),
                first.error.as_deref().unwrap_or_default()
            )));
        }
        return Ok(Some(SkipReason::NothingToChange));
    }
    if summary.staged == 0 {
        return Err(CallError::Local(format!(
            "{} file(s) rewritten but none could be staged",
            summary.changed
        )));
    }
    Ok(None)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::LEDGER_FILE;
    use crate::quota::QuotaGate;
    use crate::retry::RetryPolicy;
    use crate::rewrite::{default_rules, BoundaryPolicy, WalkOutcome};
    use crate::testing::{candidate, operator, FakeHosting, RecordingVcs};
    use chrono::{TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        _dir: tempfile::TempDir,
        hosting: Arc<FakeHosting>,
        vcs: Arc<RecordingVcs>,
        clock: ManualClock,
        ctx: CallContext,
        remediator: Remediator<FakeHosting, RecordingVcs>,
    }

    fn harness(hosting: FakeHosting, vcs: RecordingVcs, settings: RemediationSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let hosting = Arc::new(hosting);
        let vcs = Arc::new(vcs);
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2020, 7, 7, 12, 0, 0).unwrap());
        let ctx = CallContext::new(
            Arc::new(clock.clone()),
            QuotaGate::default(),
            CancellationToken::new(),
        );
        let remediator = Remediator::new(
            Arc::clone(&hosting),
            Arc::clone(&vcs),
            Rewriter::new(default_rules(), BoundaryPolicy::UrlAware).unwrap(),
            Ledger::open(dir.path().join(LEDGER_FILE)).unwrap(),
            Workspace::acquire(dir.path().join("work")).unwrap(),
            operator(),
            "ghp_token".to_string(),
            settings,
        );
        Harness {
            _dir: dir,
            hosting,
            vcs,
            clock,
            ctx,
            remediator,
        }
    }

    fn push_transient() -> CallError {
        CallError::git("push", "Connection reset by peer", true)
    }

    #[tokio::test]
    async fn test_happy_path_reaches_done() {
        let mut h = harness(
            FakeHosting::default(),
            RecordingVcs::default().with_file("README.md", "Uses a master/slave setup.\n"),
            RemediationSettings::default(),
        );

        let report = h.remediator.remediate(&h.ctx, candidate("octo/db")).await;

        assert!(report.is_done(), "{:?}", report.state);
        assert_eq!(
            report.history,
            vec![
                RemediationState::Discovered,
                RemediationState::Deduplicated,
                RemediationState::Forked,
                RemediationState::Cloned,
                RemediationState::BranchCreated,
                RemediationState::Rewritten,
                RemediationState::Committed,
                RemediationState::Pushed,
                RemediationState::Proposed,
                RemediationState::Done,
            ]
        );
        assert_eq!(report.files_changed, 1);
        assert_eq!(h.vcs.branches(), vec![DEFAULT_BRANCH_NAME.to_string()]);

        let prs = h.hosting.pull_requests();
        assert_eq!(prs.len(), 1);
        let (repo, draft) = &prs[0];
        assert_eq!(repo, "octo/db");
        assert_eq!(draft.head, "unslave-bot:slav-removal");
        assert_eq!(draft.base, "main");
        assert!(draft.maintainer_can_modify);
        assert!(draft.body.contains(FIX_MARKER));

        let commits = h.vcs.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0.email, "bot@example.com");
        assert_eq!(commits[0].1, draft.title);

        // Fork settle wait went through the clock.
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(FORK_SETTLE_SECS)]);
        assert!(h.remediator.ledger().contains("octo/db"));
    }

    #[tokio::test]
    async fn test_existing_proposal_skips_without_fork() {
        let mut h = harness(
            FakeHosting::default().with_existing_proposal("https://github.com/octo/db/pull/3"),
            RecordingVcs::default(),
            RemediationSettings::default(),
        );

        let report = h.remediator.remediate(&h.ctx, candidate("octo/db")).await;

        assert_eq!(
            report.skip_reason(),
            Some(&SkipReason::AlreadyProposed(
                "https://github.com/octo/db/pull/3".to_string()
            ))
        );
        assert_eq!(h.hosting.fork_calls(), 0);
        assert!(h.remediator.ledger().contains("octo/db"));
    }

    #[tokio::test]
    async fn test_ledger_hit_skips_remote_check() {
        let mut h = harness(
            FakeHosting::default(),
            RecordingVcs::default(),
            RemediationSettings::default(),
        );
        h.remediator.ledger().record("octo/db").unwrap();

        let report = h.remediator.remediate(&h.ctx, candidate("Octo/DB")).await;

        assert_eq!(report.skip_reason(), Some(&SkipReason::AlreadyHandled));
        assert_eq!(h.hosting.dedup_calls(), 0);
        assert_eq!(h.hosting.fork_calls(), 0);
    }

    #[tokio::test]
    async fn test_oversized_fork_skips_without_clone() {
        let settings = RemediationSettings {
            max_size_kb: 500,
            ..Default::default()
        };
        let mut h = harness(
            FakeHosting::default().with_fork_size(501),
            RecordingVcs::default(),
            settings,
        );

        let report = h.remediator.remediate(&h.ctx, candidate("octo/huge")).await;

        assert_eq!(
            report.skip_reason(),
            Some(&SkipReason::Oversized {
                size_kb: 501,
                limit_kb: 500
            })
        );
        assert!(report.visited(&RemediationState::Forked));
        assert_eq!(h.vcs.clone_count(), 0);
        assert!(h.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_clean_repository_skips_after_rewrite() {
        let mut h = harness(
            FakeHosting::default(),
            RecordingVcs::default().with_file("src/lib.rs", "fn primary() {}\n"),
            RemediationSettings::default(),
        );

        let report = h.remediator.remediate(&h.ctx, candidate("octo/clean")).await;

        assert_eq!(report.skip_reason(), Some(&SkipReason::NothingToChange));
        assert!(h.vcs.commits().is_empty());
        assert!(h.hosting.pull_requests().is_empty());
        assert!(!h.remediator.ledger().contains("octo/clean"));
    }

    #[tokio::test]
    async fn test_push_recovers_within_ceiling() {
        let mut settings = RemediationSettings::default();
        settings.retry.push = RetryPolicy::fixed(5, Duration::from_secs(1));
        let mut h = harness(
            FakeHosting::default(),
            RecordingVcs::default()
                .with_file("a.txt", "slave\n")
                .failing_pushes(vec![push_transient(), push_transient(), push_transient()]),
            settings,
        );

        let report = h.remediator.remediate(&h.ctx, candidate("octo/db")).await;

        assert!(report.visited(&RemediationState::Proposed));
        assert!(report.is_done());
        assert_eq!(h.vcs.push_attempts(), 4);
    }

    #[tokio::test]
    async fn test_push_fails_when_ceiling_is_reached() {
        let mut settings = RemediationSettings::default();
        settings.retry.push = RetryPolicy::fixed(3, Duration::from_secs(1));
        let mut h = harness(
            FakeHosting::default(),
            RecordingVcs::default()
                .with_file("a.txt", "slave\n")
                .failing_pushes(vec![push_transient(), push_transient(), push_transient()]),
            settings,
        );

        let report = h.remediator.remediate(&h.ctx, candidate("octo/db")).await;

        assert!(report.is_failed());
        assert!(report.visited(&RemediationState::Committed));
        assert!(!report.visited(&RemediationState::Pushed));
        assert!(matches!(
            report.error,
            Some(CallError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(h.vcs.push_attempts(), 3);
        assert!(h.hosting.pull_requests().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_clone_error_is_not_retried() {
        let mut h = harness(
            FakeHosting::default(),
            RecordingVcs::default()
                .failing_clones(vec![CallError::git("clone", "not found", false)]),
            RemediationSettings::default(),
        );

        let report = h.remediator.remediate(&h.ctx, candidate("octo/gone")).await;

        assert!(report.is_failed());
        assert_eq!(report.history.last(), Some(&report.state));
        assert!(report.visited(&RemediationState::Forked));
        assert!(!report.visited(&RemediationState::Cloned));
        assert_eq!(h.vcs.clone_count(), 0);
    }

    #[tokio::test]
    async fn test_pull_request_retries_then_fails_with_branch_pushed() {
        let mut settings = RemediationSettings::default();
        settings.retry.pull_request = RetryPolicy::fixed(2, Duration::from_secs(1));
        let mut h = harness(
            FakeHosting::default().failing_pull_requests(vec![
                CallError::from_status(502, "bad gateway"),
                CallError::from_status(502, "bad gateway"),
            ]),
            RecordingVcs::default().with_file("a.txt", "Master\n"),
            settings,
        );

        let report = h.remediator.remediate(&h.ctx, candidate("octo/db")).await;

        assert!(report.is_failed());
        assert!(report.visited(&RemediationState::Pushed));
        assert_eq!(h.vcs.pushes().len(), 1);
        assert!(!h.remediator.ledger().contains("octo/db"));
    }

    #[tokio::test]
    async fn test_missing_default_branch_targets_fallback_base() {
        let mut h = harness(
            FakeHosting::default(),
            RecordingVcs::default().with_file("a.txt", "master\n"),
            RemediationSettings::default(),
        );
        let mut repo = candidate("octo/old");
        repo.default_branch = None;

        let report = h.remediator.remediate(&h.ctx, repo).await;

        assert!(report.is_done());
        assert_eq!(h.hosting.pull_requests()[0].1.base, FALLBACK_BASE_BRANCH);
        assert_eq!(h.vcs.clones()[0].1, None);
    }

    #[tokio::test]
    async fn test_stale_workdir_is_wiped_and_clone_retried() {
        let mut h = harness(
            FakeHosting::default(),
            RecordingVcs::default()
                .with_file("a.txt", "master\n")
                .failing_clones(vec![CallError::git("clone", "early EOF", true)]),
            RemediationSettings::default(),
        );
        let stale = h.remediator.workspace.path().join("stale.txt");
        std::fs::create_dir_all(h.remediator.workspace.path()).unwrap();
        std::fs::write(&stale, "left over").unwrap();

        let report = h.remediator.remediate(&h.ctx, candidate("octo/db")).await;

        assert!(report.is_done(), "{:?}", report.state);
        assert_eq!(h.vcs.clone_count(), 1);
        assert!(!stale.exists());
        assert_eq!(
            h.clock.sleeps(),
            vec![Duration::from_secs(FORK_SETTLE_SECS), Duration::from_secs(3)]
        );
    }

    #[tokio::test]
    async fn test_unstaged_rewrite_fails_without_commit() {
        let mut h = harness(
            FakeHosting::default(),
            RecordingVcs::default().with_file("a.txt", "master\n"),
            RemediationSettings::default(),
        );
        h.vcs.fail_staging(Path::new("a.txt"));

        let report = h.remediator.remediate(&h.ctx, candidate("octo/db")).await;

        assert!(report.is_failed());
        assert!(matches!(report.error, Some(CallError::Local(_))));
        assert!(report.visited(&RemediationState::BranchCreated));
        assert!(!report.visited(&RemediationState::Rewritten));
        assert_eq!(report.files_changed, 1);
        assert!(h.vcs.commits().is_empty());
        assert!(h.hosting.pull_requests().is_empty());
    }

    fn outcome(path: &str, changed: bool, error: Option<&str>) -> WalkOutcome {
        WalkOutcome {
            path: PathBuf::from(path),
            changed,
            staged: changed && error.is_none(),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_failed_writes_are_a_local_error_not_a_skip() {
        let summary = WalkSummary {
            visited: 1,
            failed: 1,
            outcomes: vec![outcome("a.txt", false, Some("write failed: Is a directory"))],
            ..Default::default()
        };

        let err = judge_rewrite(&summary).unwrap_err();

        assert!(matches!(err, CallError::Local(_)));
        assert!(err.to_string().contains("a.txt"));
    }

    #[test]
    fn test_rewrite_verdicts() {
        let clean = WalkSummary {
            visited: 3,
            skipped: 3,
            ..Default::default()
        };
        assert_eq!(
            judge_rewrite(&clean).unwrap(),
            Some(SkipReason::NothingToChange)
        );

        let partly_staged = WalkSummary {
            visited: 2,
            changed: 2,
            staged: 1,
            failed: 1,
            outcomes: vec![
                outcome("a.txt", true, Some("stage failed: index locked")),
                outcome("b.txt", true, None),
            ],
            ..Default::default()
        };
        assert_eq!(judge_rewrite(&partly_staged).unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_before_dedup() {
        let mut h = harness(
            FakeHosting::default(),
            RecordingVcs::default().with_file("a.txt", "master\n"),
            RemediationSettings::default(),
        );
        h.ctx.cancel_token().cancel();

        let report = h.remediator.remediate(&h.ctx, candidate("octo/db")).await;

        assert!(report.is_failed());
        assert!(matches!(report.error, Some(CallError::Cancelled)));
        assert_eq!(h.hosting.fork_calls(), 0);
    }
}
