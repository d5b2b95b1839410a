//! Exclusive working directory
//!
//! One directory holds the clone of whichever fork is being remediated. A
//! sibling lock file stays exclusively locked for the life of the
//! [`Workspace`], so a second process pointed at the same path fails fast.

use crate::error::CallError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    lock: File,
}

impl Workspace {
    pub fn acquire(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let lock_path = lock_path_for(&path)?;
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        match FileExt::try_lock_exclusive(&lock) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                anyhow::bail!(
                    "Working directory {} is in use by another process",
                    path.display()
                );
            }
            Err(err) => return Err(err.into()),
        }

        Ok(Self { path, lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wipe the directory and recreate it empty.
    pub fn reset(&self) -> Result<(), CallError> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(CallError::Local(format!(
                    "Failed to clear {}: {}",
                    self.path.display(),
                    err
                )))
            }
        }
        fs::create_dir_all(&self.path).map_err(|err| {
            CallError::Local(format!("Failed to create {}: {}", self.path.display(), err))
        })
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock);
    }
}

fn lock_path_for(path: &Path) -> anyhow::Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Working directory needs a name: {}", path.display()))?;
    let mut lock_name = std::ffi::OsString::from(".");
    lock_name.push(name);
    lock_name.push(".lock");
    Ok(path.with_file_name(lock_name))
}
