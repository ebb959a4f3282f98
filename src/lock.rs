//! Advisory file locks and atomic writes
//!
//! Three locks are built on [`FileLock`]:
//! - the per-task lock (`obj.lock` in the task directory), held for the whole
//!   of a task run so the same fingerprint never executes twice at once
//! - the sync cursor lock (`LAST_SYNC_COMMIT.lock`), serializing index syncs
//! - the in-process log writer's lock next to the log branch ref
//!
//! Locks are `flock`-style (via fs2) and are released by the OS when the
//! holding process dies.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::trace;

use crate::error::{Error, Result};

/// Poll interval while waiting on a contended lock with a deadline
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A held exclusive lock; released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Wait as long as it takes. Missing parent directories are created.
    pub fn acquire_blocking(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = open(path)?;
        file.lock_exclusive()?;
        trace!(path = %path.display(), "lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Wait at most `timeout_ms`, or forever when it is `None`.
    pub fn acquire_with(path: impl AsRef<Path>, timeout_ms: Option<u64>) -> Result<Self> {
        let Some(timeout_ms) = timeout_ms else {
            return Self::acquire_blocking(path);
        };

        let path = path.as_ref();
        let file = open(path)?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    trace!(path = %path.display(), "lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if contended(&err) => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockFailed(path.to_path_buf()));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn open(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn contended(err: &io::Error) -> bool {
    // fs2 reports sharing violations as "Other" on Windows
    err.kind() == io::ErrorKind::WouldBlock
        || cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33))
}

/// Replace `path` with `contents` via a synced sibling and a rename.
///
/// Takes no lock; callers hold the matching [`FileLock`].
pub fn write_atomic(path: impl AsRef<Path>, contents: &str) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut staging = path.as_os_str().to_owned();
    staging.push(format!(".{}.tmp", std::process::id()));
    let staging = PathBuf::from(staging);

    let mut file = File::create(&staging)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&staging, path)?;
    Ok(())
}
