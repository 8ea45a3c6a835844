//! Exclusive advisory lock on a working directory.
//!
//! Reconciliation moves and deletes files, so at most one build may operate
//! on a working directory at a time, whether the other attempt is a thread
//! in this process or a separate invocation.
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Lock file created inside the working directory.
pub const LOCK_FILE_NAME: &str = ".asmtodsk.lock";

/// Held for the length of one build; the lock is released when dropped.
#[derive(Debug)]
pub struct WorkdirLock {
    _file: File,
}

impl WorkdirLock {
    /// Take the lock without waiting. `Ok(None)` means another attempt holds it.
    pub fn try_acquire(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lock {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { _file: file })),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                tracing::debug!(lock = %path.display(), "working directory is busy");
                Ok(None)
            }
            Err(err) => Err(err).with_context(|| format!("lock {}", path.display())),
        }
    }
}
