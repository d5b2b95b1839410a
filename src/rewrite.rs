//! Terminology rewriter
//!
//! Two passes over a working tree:
//!
//! 1. [`Rewriter::plan`] reads candidate files and computes their new
//!    content. It touches neither the disk nor git.
//! 2. [`Rewriter::apply`] writes the planned files back and stages each one.
//!
//! Only the all-lowercase and capitalized forms of a term are replaced; any
//! other casing is left alone. Where a term may match is governed by
//! [`BoundaryPolicy`].

use crate::git_ops::Vcs;
use crate::util::relative_to_root;
use rayon::prelude::*;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Extensions that produce unsafe or noisy matches.
const SKIP_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "ico", "db", "sqlite", "html", "htm", "xml",
];

const VCS_DIR: &str = ".git";

/// Characters allowed in the path part of a domain-style prefix.
const URL_PATH_CHARS: &str = r"A-Za-z0-9\-._~:/?#\[\]@!$&'()*+,;=";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    /// Lowercase form of the term to replace.
    pub term: String,
    pub lower: String,
    pub capitalized: String,
}

impl RewriteRule {
    pub fn new(term: &str, lower: &str, capitalized: &str) -> Self {
        Self {
            term: term.to_lowercase(),
            lower: lower.to_string(),
            capitalized: capitalized.to_string(),
        }
    }

    fn capitalized_term(&self) -> String {
        capitalize(&self.term)
    }
}

pub fn default_rules() -> Vec<RewriteRule> {
    vec![
        RewriteRule::new("slave", "subordinate", "Subordinate"),
        RewriteRule::new("master", "main", "Main"),
    ]
}

/// Where a term is allowed to match.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Anywhere, including inside longer identifiers (`masterpiece`).
    Substring,
    /// Whole words only.
    WordBoundary,
    /// Whole words, except inside domain-style paths such as
    /// `github.com/org/master-plan`.
    #[default]
    UrlAware,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkOutcome {
    /// Relative to the working tree root.
    pub path: PathBuf,
    pub changed: bool,
    pub staged: bool,
    pub error: Option<String>,
}

/// New content for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEdit {
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct RewritePlan {
    pub edits: Vec<PlannedEdit>,
    /// Regular files seen under the root (skipped ones included).
    pub visited: usize,
    /// Files rejected by extension, encoding or the fast probe.
    pub skipped: usize,
    /// Files or directories that could not be read.
    pub failures: Vec<WalkOutcome>,
}

/// Aggregate over one rewrite. `outcomes` lists changed and failed files.
#[derive(Debug, Clone, Default)]
pub struct WalkSummary {
    pub visited: usize,
    pub changed: usize,
    pub staged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<WalkOutcome>,
}

impl WalkSummary {
    pub fn errors(&self) -> impl Iterator<Item = &WalkOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }
}

enum FileVerdict {
    Edit(PlannedEdit),
    Skip,
    Fail(WalkOutcome),
}

pub struct Rewriter {
    rules: Vec<RewriteRule>,
    pattern: Regex,
}

impl Rewriter {
    pub fn new(rules: Vec<RewriteRule>, policy: BoundaryPolicy) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&build_pattern(&rules, policy))?;
        Ok(Self { rules, pattern })
    }

    /// Case-insensitive probe for any target term.
    pub fn mentions_terms(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.rules.iter().any(|r| lower.contains(&r.term))
    }

    /// The rewritten text, or `None` when nothing changed.
    pub fn rewrite_text(&self, text: &str) -> Option<String> {
        if !self.mentions_terms(text) {
            return None;
        }
        let replaced = self.pattern.replace_all(text, |caps: &Captures| {
            if caps.name("url").is_some() {
                return caps[0].to_string();
            }
            let term = &caps["term"];
            self.substitute(term).unwrap_or(term).to_string()
        });
        if replaced == text {
            None
        } else {
            Some(replaced.into_owned())
        }
    }

    fn substitute(&self, word: &str) -> Option<&str> {
        self.rules.iter().find_map(|rule| {
            if word == rule.term {
                Some(rule.lower.as_str())
            } else if word == rule.capitalized_term() {
                Some(rule.capitalized.as_str())
            } else {
                None
            }
        })
    }

    /// Whether a file is worth reading, judged by its name alone.
    pub fn is_candidate_path(path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => !SKIP_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
            None => true,
        }
    }

    /// Compute replacements for every file under `root`. Read-only.
    pub fn plan(&self, root: &Path) -> RewritePlan {
        let mut plan = RewritePlan::default();
        let mut files = Vec::new();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_vcs_dir(e))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    let path = err
                        .path()
                        .and_then(|p| relative_to_root(root, p).ok())
                        .unwrap_or_default();
                    plan.failures.push(WalkOutcome {
                        path,
                        changed: false,
                        staged: false,
                        error: Some(err.to_string()),
                    });
                    continue;
                }
            };
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        plan.visited = files.len();

        let verdicts: Vec<FileVerdict> = files
            .par_iter()
            .map(|path| self.plan_file(root, path))
            .collect();

        for verdict in verdicts {
            match verdict {
                FileVerdict::Edit(edit) => plan.edits.push(edit),
                FileVerdict::Skip => plan.skipped += 1,
                FileVerdict::Fail(outcome) => plan.failures.push(outcome),
            }
        }
        plan.edits.sort_by(|a, b| a.path.cmp(&b.path));
        plan
    }

    fn plan_file(&self, root: &Path, path: &Path) -> FileVerdict {
        if !Self::is_candidate_path(path) {
            return FileVerdict::Skip;
        }
        let relative = match relative_to_root(root, path) {
            Ok(r) => r,
            Err(err) => {
                return FileVerdict::Fail(WalkOutcome {
                    path: path.to_path_buf(),
                    changed: false,
                    staged: false,
                    error: Some(err),
                })
            }
        };

        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(err) => {
                return FileVerdict::Fail(WalkOutcome {
                    path: relative,
                    changed: false,
                    staged: false,
                    error: Some(format!("read failed: {}", err)),
                })
            }
        };
        // Binary content is never rewritten.
        let Ok(text) = String::from_utf8(bytes) else {
            return FileVerdict::Skip;
        };

        match self.rewrite_text(&text) {
            Some(content) => FileVerdict::Edit(PlannedEdit {
                path: relative,
                content,
            }),
            None => FileVerdict::Skip,
        }
    }

    /// Write each planned file and stage it. Per-file failures are recorded
    /// and never stop the pass.
    pub fn apply<V: Vcs + ?Sized>(&self, root: &Path, plan: RewritePlan, vcs: &V) -> WalkSummary {
        let mut summary = WalkSummary {
            visited: plan.visited,
            skipped: plan.skipped,
            failed: plan.failures.len(),
            outcomes: plan.failures,
            ..Default::default()
        };

        for edit in plan.edits {
            let mut outcome = WalkOutcome {
                path: edit.path.clone(),
                changed: false,
                staged: false,
                error: None,
            };

            if let Err(err) = fs::write(root.join(&edit.path), edit.content.as_bytes()) {
                warn!(path = %edit.path.display(), error = %err, "failed to write rewritten file");
                outcome.error = Some(format!("write failed: {}", err));
                summary.failed += 1;
                summary.outcomes.push(outcome);
                continue;
            }
            outcome.changed = true;
            summary.changed += 1;

            match vcs.stage(root, &edit.path) {
                Ok(()) => {
                    outcome.staged = true;
                    summary.staged += 1;
                }
                Err(err) => {
                    warn!(path = %edit.path.display(), error = %err, "failed to stage file");
                    outcome.error = Some(format!("stage failed: {}", err));
                    summary.failed += 1;
                }
            }
            summary.outcomes.push(outcome);
        }

        debug!(
            visited = summary.visited,
            changed = summary.changed,
            staged = summary.staged,
            failed = summary.failed,
            "rewrite finished"
        );
        summary
    }

    /// Plan and apply in one go.
    pub fn rewrite<V: Vcs + ?Sized>(&self, root: &Path, vcs: &V) -> WalkSummary {
        let plan = self.plan(root);
        self.apply(root, plan, vcs)
    }
}

fn is_vcs_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name() == VCS_DIR
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn build_pattern(rules: &[RewriteRule], policy: BoundaryPolicy) -> String {
    let alternatives = rules
        .iter()
        .flat_map(|r| [regex::escape(&r.term), regex::escape(&r.capitalized_term())])
        .collect::<Vec<_>>()
        .join("|");
    let term = format!("(?P<term>{})", alternatives);

    match policy {
        BoundaryPolicy::Substring => term,
        BoundaryPolicy::WordBoundary => format!(r"\b{}\b", term),
        BoundaryPolicy::UrlAware => format!(
            r"(?P<url>(?:[\w-]*\.\w{{2,4}}/[{}]*)+)?\b{}\b",
            URL_PATH_CHARS, term
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingVcs;

    fn rewriter(policy: BoundaryPolicy) -> Rewriter {
        Rewriter::new(default_rules(), policy).unwrap()
    }

    // ========================================================================
    // Text Replacement Tests
    // ========================================================================

    #[test]
    fn test_case_pattern_is_preserved() {
        let r = rewriter(BoundaryPolicy::UrlAware);
        assert_eq!(
            r.rewrite_text("This slave/Master setup").as_deref(),
            Some("This subordinate/Main setup")
        );
    }

    #[test]
    fn test_other_casings_pass_through() {
        let r = rewriter(BoundaryPolicy::UrlAware);
        assert_eq!(r.rewrite_text("MASTER and SLAVE and mAster"), None);
        assert_eq!(
            r.rewrite_text("MASTER and master").as_deref(),
            Some("MASTER and main")
        );
    }

    #[test]
    fn test_word_boundary_policy_keeps_identifiers() {
        let r = rewriter(BoundaryPolicy::WordBoundary);
        assert_eq!(r.rewrite_text("masterpiece slave_node"), None);
        assert_eq!(
            r.rewrite_text("the master branch").as_deref(),
            Some("the main branch")
        );
    }

    #[test]
    fn test_substring_policy_matches_inside_words() {
        let r = rewriter(BoundaryPolicy::Substring);
        assert_eq!(
            r.rewrite_text("masterpiece").as_deref(),
            Some("mainpiece")
        );
    }

    #[test]
    fn test_url_aware_leaves_paths_alone() {
        let r = rewriter(BoundaryPolicy::UrlAware);
        let text = "see https://github.com/org/master/README and the master node";
        assert_eq!(
            r.rewrite_text(text).as_deref(),
            Some("see https://github.com/org/master/README and the main node")
        );
        assert_eq!(r.rewrite_text("docs.rs/slave-lib/latest"), None);
    }

    #[test]
    fn test_word_boundary_policy_rewrites_urls() {
        let r = rewriter(BoundaryPolicy::WordBoundary);
        assert_eq!(
            r.rewrite_text("github.com/org/master").as_deref(),
            Some("github.com/org/main")
        );
    }

    #[test]
    fn test_rewrite_is_a_fixed_point() {
        for policy in [
            BoundaryPolicy::Substring,
            BoundaryPolicy::WordBoundary,
            BoundaryPolicy::UrlAware,
        ] {
            let r = rewriter(policy);
            let once = r
                .rewrite_text("Master/slave replication: master -> slave, Slave ack")
                .unwrap();
            assert_eq!(r.rewrite_text(&once), None, "policy {:?}", policy);
        }
    }

    #[test]
    fn test_text_without_terms_is_untouched() {
        let r = rewriter(BoundaryPolicy::Substring);
        assert!(!r.mentions_terms("primary and replica"));
        assert_eq!(r.rewrite_text("primary and replica"), None);
    }

    #[test]
    fn test_skip_extensions() {
        assert!(!Rewriter::is_candidate_path(Path::new("logo.PNG")));
        assert!(!Rewriter::is_candidate_path(Path::new("site/index.html")));
        assert!(!Rewriter::is_candidate_path(Path::new("pom.xml")));
        assert!(Rewriter::is_candidate_path(Path::new("src/main.rs")));
        assert!(Rewriter::is_candidate_path(Path::new("Makefile")));
    }

    // ========================================================================
    // Tree Walk Tests
    // ========================================================================

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_plan_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "README.md", b"redis master\n");

        let plan = rewriter(BoundaryPolicy::UrlAware).plan(dir.path());
        assert_eq!(plan.edits.len(), 1);
        assert_eq!(plan.edits[0].path, PathBuf::from("README.md"));
        assert_eq!(plan.edits[0].content, "redis main\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "redis master\n"
        );
    }

    #[test]
    fn test_walk_prunes_git_and_skips_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, ".git/config", b"[branch \"master\"]\n");
        write(root, "docs/index.html", b"<p>master</p>");
        write(root, "blob.bin", &[0xff, 0xfe, b'm', b'a', b's', b't', b'e', b'r']);
        write(root, "notes.txt", b"nothing to see");
        write(root, "src/db.py", b"# connect to Slave\nslave = connect()\n");

        let vcs = RecordingVcs::default();
        let summary = rewriter(BoundaryPolicy::UrlAware).rewrite(root, &vcs);

        assert_eq!(summary.visited, 4);
        assert_eq!(summary.changed, 1);
        assert_eq!(summary.staged, 1);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(vcs.staged_paths(), vec![PathBuf::from("src/db.py")]);
        assert_eq!(
            fs::read_to_string(root.join("src/db.py")).unwrap(),
            "# connect to Subordinate\nsubordinate = connect()\n"
        );
        assert_eq!(
            fs::read_to_string(root.join(".git/config")).unwrap(),
            "[branch \"master\"]\n"
        );
        assert_eq!(
            fs::read(root.join("blob.bin")).unwrap(),
            vec![0xff, 0xfe, b'm', b'a', b's', b't', b'e', b'r']
        );
    }

    #[test]
    fn test_second_pass_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.conf", b"Master = true\nslave_of = none\n");
        write(dir.path(), "b/c.md", b"A master and a slave.\n");

        let r = rewriter(BoundaryPolicy::WordBoundary);
        let vcs = RecordingVcs::default();
        let first = r.rewrite(dir.path(), &vcs);
        assert_eq!(first.changed, 2);

        let second = r.rewrite(dir.path(), &vcs);
        assert_eq!(second.changed, 0);
        assert_eq!(second.visited, 2);
    }

    #[test]
    fn test_stage_failure_is_recorded_and_walk_continues() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", b"master\n");
        write(dir.path(), "b.txt", b"slave\n");

        let vcs = RecordingVcs::default();
        vcs.fail_staging(Path::new("a.txt"));
        let summary = rewriter(BoundaryPolicy::UrlAware).rewrite(dir.path(), &vcs);

        assert_eq!(summary.changed, 2);
        assert_eq!(summary.staged, 1);
        assert_eq!(summary.failed, 1);
        let errors: Vec<_> = summary.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, PathBuf::from("a.txt"));
        assert!(errors[0].changed);
        assert!(!errors[0].staged);
        assert_eq!(vcs.staged_paths(), vec![PathBuf::from("b.txt")]);
    }

    #[test]
    fn test_write_failure_is_recorded_without_change() {
        let dir = tempfile::tempdir().unwrap();
        // The planned target became a directory, so the write is refused.
        fs::create_dir_all(dir.path().join("notes.txt")).unwrap();
        let plan = RewritePlan {
            edits: vec![PlannedEdit {
                path: PathBuf::from("notes.txt"),
                content: "main\n".to_string(),
            }],
            visited: 1,
            ..Default::default()
        };

        let vcs = RecordingVcs::default();
        let summary = rewriter(BoundaryPolicy::UrlAware).apply(dir.path(), plan, &vcs);

        assert_eq!(summary.changed, 0);
        assert_eq!(summary.staged, 0);
        assert_eq!(summary.failed, 1);
        let errors: Vec<_> = summary.errors().collect();
        assert!(errors[0].error.as_deref().unwrap().starts_with("write failed"));
        assert!(vcs.staged_paths().is_empty());
    }

    #[test]
    fn test_custom_rules() {
        let r = Rewriter::new(
            vec![RewriteRule::new("blacklist", "denylist", "Denylist")],
            BoundaryPolicy::WordBoundary,
        )
        .unwrap();
        assert_eq!(
            r.rewrite_text("Blacklist the blacklist").as_deref(),
            Some("Denylist the denylist")
        );
        assert_eq!(r.rewrite_text("master"), None);
    }
}
