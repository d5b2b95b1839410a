//! Git operations for the remediation workflow
//!
//! Clone and push shell out to `git` (transport, credentials, timeouts);
//! branch, stage and commit go through git2.

use crate::error::CallError;
use crate::util::{redact, run_command_with_timeout, CommandRunResult};
use git2::{Repository, Signature};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

const GIT_CLONE_TIMEOUT_SECS: u64 = 600;
const GIT_PUSH_TIMEOUT_SECS: u64 = 180;
const TOKEN_USERNAME: &str = "x-access-token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

/// Version-control collaborator used by the state machine and the rewriter.
pub trait Vcs: Send + Sync {
    /// Materialize `branch` (or the remote HEAD) of `url` into `dest`.
    fn clone_branch(&self, url: &str, branch: Option<&str>, dest: &Path) -> Result<(), CallError>;

    /// Create `name` at HEAD and check it out.
    fn create_branch(&self, repo_path: &Path, name: &str) -> Result<(), CallError>;

    fn stage(&self, repo_path: &Path, relative: &Path) -> Result<(), CallError>;

    /// Commit the index on top of HEAD, returning the new commit id.
    fn commit(
        &self,
        repo_path: &Path,
        author: &CommitAuthor,
        message: &str,
    ) -> Result<String, CallError>;

    /// Force-push `branch` to `remote_url`, authenticating with `token`.
    fn push(
        &self,
        repo_path: &Path,
        remote_url: &str,
        branch: &str,
        token: &str,
    ) -> Result<(), CallError>;
}

/// git2 + `git` binary implementation.
#[derive(Debug, Clone)]
pub struct GitCli {
    clone_timeout: Duration,
    push_timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            clone_timeout: Duration::from_secs(GIT_CLONE_TIMEOUT_SECS),
            push_timeout: Duration::from_secs(GIT_PUSH_TIMEOUT_SECS),
        }
    }
}

fn open_repo(repo_path: &Path) -> Result<Repository, CallError> {
    Repository::open(repo_path).map_err(|e| {
        CallError::Local(format!(
            "Failed to open repository '{}': {}",
            repo_path.display(),
            e.message()
        ))
    })
}

fn git_command(cwd: Option<&Path>) -> Command {
    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd
}

/// Classify a failed transport command (clone/push) by its stderr.
fn transport_error(
    operation: &'static str,
    output: &CommandRunResult,
    timeout: Duration,
    secret: &str,
) -> CallError {
    if output.timed_out {
        return CallError::git(
            operation,
            format!("timed out after {}s", timeout.as_secs()),
            true,
        );
    }

    let stderr = redact(output.stderr.trim(), secret);
    let lower = stderr.to_ascii_lowercase();

    const LOCAL_MARKERS: &[&str] = &[
        "could not create work tree",
        "no space left on device",
        "permission denied (os",
        "read-only file system",
        "already exists and is not an empty directory",
    ];
    if LOCAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return CallError::Local(format!("git {}: {}", operation, stderr));
    }

    const TERMINAL_MARKERS: &[&str] = &[
        "authentication failed",
        "invalid username or password",
        "permission to",
        "403",
        "could not read username",
        "remote branch",
    ];
    let transient = !TERMINAL_MARKERS.iter().any(|m| lower.contains(m));
    CallError::git(operation, stderr, transient)
}

/// Embed the token in an https remote URL. Other schemes are returned as is.
fn authenticated_url(remote_url: &str, token: &str) -> Result<String, CallError> {
    let mut parsed = url::Url::parse(remote_url)
        .map_err(|e| CallError::git("push", format!("invalid remote URL: {}", e), false))?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Ok(remote_url.to_string());
    }
    parsed
        .set_username(TOKEN_USERNAME)
        .and_then(|_| parsed.set_password(Some(token)))
        .map_err(|_| CallError::git("push", "remote URL cannot carry credentials", false))?;
    Ok(parsed.to_string())
}

impl Vcs for GitCli {
    fn clone_branch(&self, url: &str, branch: Option<&str>, dest: &Path) -> Result<(), CallError> {
        let mut cmd = git_command(None);
        cmd.args(["clone", "--depth", "1", "--single-branch"]);
        if let Some(branch) = branch {
            cmd.args(["--branch", branch]);
        }
        cmd.arg(url).arg(dest);

        let output = run_command_with_timeout(&mut cmd, self.clone_timeout)
            .map_err(|e| CallError::Local(format!("Failed to run git clone: {}", e)))?;
        if output.success() {
            return Ok(());
        }
        Err(transport_error("clone", &output, self.clone_timeout, ""))
    }

    fn create_branch(&self, repo_path: &Path, name: &str) -> Result<(), CallError> {
        let repo = open_repo(repo_path)?;
        let head_commit = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(|e| CallError::git("branch", e.message().to_string(), false))?;

        let branch = repo
            .branch(name, &head_commit, false)
            .map_err(|e| CallError::git("branch", e.message().to_string(), false))?;
        let refname = branch
            .get()
            .name()
            .ok_or_else(|| CallError::git("branch", "branch name is not valid UTF-8", false))?
            .to_string();

        let object = repo
            .revparse_single(&refname)
            .map_err(|e| CallError::git("checkout", e.message().to_string(), false))?;
        repo.checkout_tree(&object, None)
            .map_err(|e| CallError::git("checkout", e.message().to_string(), false))?;
        repo.set_head(&refname)
            .map_err(|e| CallError::git("checkout", e.message().to_string(), false))?;
        Ok(())
    }

    fn stage(&self, repo_path: &Path, relative: &Path) -> Result<(), CallError> {
        let repo = open_repo(repo_path)?;
        let mut index = repo.index()?;
        index.add_path(relative)?;
        index.write()?;
        Ok(())
    }

    fn commit(
        &self,
        repo_path: &Path,
        author: &CommitAuthor,
        message: &str,
    ) -> Result<String, CallError> {
        let repo = open_repo(repo_path)?;
        let mut index = repo.index()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let parent = match repo.head() {
            Ok(head) => match head.peel_to_commit() {
                Ok(commit) => Some(commit),
                Err(err)
                    if matches!(
                        err.code(),
                        git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound
                    ) =>
                {
                    None
                }
                Err(err) => return Err(err.into()),
            },
            Err(err)
                if matches!(
                    err.code(),
                    git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound
                ) =>
            {
                None
            }
            Err(err) => return Err(err.into()),
        };

        let sig = Signature::now(&author.name, &author.email)?;

        let oid = match parent {
            Some(ref parent) => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[parent])?,
            None => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?,
        };

        Ok(oid.to_string())
    }

    fn push(
        &self,
        repo_path: &Path,
        remote_url: &str,
        branch: &str,
        token: &str,
    ) -> Result<(), CallError> {
        let target = authenticated_url(remote_url, token)?;
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);

        let mut cmd = git_command(Some(repo_path));
        cmd.args(["push", "--force"]).arg(&target).arg(&refspec);

        let output = run_command_with_timeout(&mut cmd, self.push_timeout)
            .map_err(|e| CallError::Local(format!("Failed to run git push: {}", e)))?;
        if output.success() {
            return Ok(());
        }
        Err(transport_error("push", &output, self.push_timeout, token))
    }
}
