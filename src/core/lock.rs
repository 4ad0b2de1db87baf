//! Cross-process advisory locking via exclusive lockfile creation.
//!
//! `create_new` gives single-winner semantics per path; losers poll until
//! the configured timeout elapses. The lock is advisory: correctness relies
//! on every cooperating process using the same lock path.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::core::error::RagmillError;

/// Filesystem lock with timeout semantics.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    handle: Option<File>,
}

impl FileLock {
    pub fn new(path: PathBuf, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            path,
            timeout,
            poll_interval,
            handle: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, waiting up to the configured timeout.
    ///
    /// Re-acquiring a held lock is a no-op. Timeouts surface as
    /// `RagmillError::LockTimeout`, distinct from other lock failures.
    pub fn acquire(&mut self) -> Result<(), RagmillError> {
        if self.handle.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                RagmillError::LockError(format!(
                    "Failed preparing lock directory for {}: {err}",
                    self.path.display()
                ))
            })?;
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(file) => {
                    self.handle = Some(file);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(RagmillError::LockTimeout(format!(
                            "Timed out acquiring lock at {}",
                            self.path.display()
                        )));
                    }
                    std::thread::sleep(self.poll_interval);
                }
                Err(err) => {
                    return Err(RagmillError::LockError(format!(
                        "Failed acquiring lock at {}: {err}",
                        self.path.display()
                    )));
                }
            }
        }
    }

    /// Release the lock if held. Safe to call when never acquired.
    pub fn release(&mut self) {
        if self.handle.take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }

    pub fn is_held(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Lock path for a sibling-suffixed file lock (`manifest.json.lock`).
pub fn build_lock_path(target: &Path, suffix: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!("{name}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release_removes_lockfile() {
        let dir = std::env::temp_dir().join(format!("ragmill-lock-{}", std::process::id()));
        let path = dir.join("unit.lock");
        let mut lock = FileLock::new(
            path.clone(),
            Duration::from_millis(100),
            Duration::from_millis(5),
        );
        lock.acquire().unwrap();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_contended_acquire_times_out() {
        let dir = std::env::temp_dir().join(format!("ragmill-lock-to-{}", std::process::id()));
        let path = dir.join("contended.lock");
        let mut first = FileLock::new(
            path.clone(),
            Duration::from_millis(100),
            Duration::from_millis(5),
        );
        first.acquire().unwrap();
        let mut second = FileLock::new(
            path.clone(),
            Duration::from_millis(50),
            Duration::from_millis(5),
        );
        match second.acquire() {
            Err(RagmillError::LockTimeout(_)) => {}
            other => panic!("expected lock timeout, got {:?}", other.err()),
        }
        first.release();
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_build_lock_path_appends_suffix() {
        let path = build_lock_path(Path::new("/tmp/sources/a/manifest.json"), ".lock");
        assert_eq!(
            path,
            Path::new("/tmp/sources/a/manifest.json.lock").to_path_buf()
        );
    }
}
