//! Durable record of repositories already handled
//!
//! Stored as `handled.json` next to the settings file. A repository lands
//! here once a proposal was opened for it, or once the remote check found an
//! earlier one. The pipeline consults the ledger before asking the host.

use crate::util::{preserve_corrupt, write_atomic};
use anyhow::Context;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

pub const LEDGER_FILE: &str = "handled.json";
const LOCK_TIMEOUT_SECS: u64 = 10;
const LOCK_RETRY_MS: u64 = 50;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    repositories: BTreeSet<String>,
}

struct LedgerLock {
    file: File,
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: BTreeSet<String>,
}

impl Ledger {
    /// Load the ledger at `path`. A missing file is an empty ledger; a corrupt
    /// one is moved aside and replaced by an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = read_entries(&path)?;
        Ok(Self { path, entries })
    }

    pub fn contains(&self, full_name: &str) -> bool {
        self.entries.contains(&normalize(full_name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a repository and persist. Entries written by other processes since
    /// load are merged in. Returns false if it was already recorded.
    pub fn record(&mut self, full_name: &str) -> anyhow::Result<bool> {
        let key = normalize(full_name);
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let _lock = self.lock()?;
        let on_disk = read_entries(&self.path)?;
        self.entries.extend(on_disk);
        if !self.entries.insert(key) {
            return Ok(false);
        }

        let file = LedgerFile {
            repositories: self.entries.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        write_atomic(&self.path, &content)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(true)
    }

    fn lock(&self) -> anyhow::Result<LedgerLock> {
        let lock_path = self.path.with_extension("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(LedgerLock { file }),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        anyhow::bail!(
                            "Timed out waiting for ledger lock ({}s)",
                            LOCK_TIMEOUT_SECS
                        );
                    }
                    thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn normalize(full_name: &str) -> String {
    full_name.trim().to_lowercase()
}

fn read_entries(path: &Path) -> anyhow::Result<BTreeSet<String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read {}", path.display()))
        }
    };

    match serde_json::from_str::<LedgerFile>(&content) {
        Ok(file) => Ok(file.repositories.iter().map(|r| normalize(r)).collect()),
        Err(err) => {
            let backup = preserve_corrupt(path, &content);
            warn!(
                path = %path.display(),
                backup = %backup.display(),
                error = %err,
                "ledger was unreadable, starting empty"
            );
            Ok(BTreeSet::new())
        }
    }
}
