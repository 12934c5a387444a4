//! Startup garbage collection for crashed console proxies.
//!
//! A proxy killed with SIGKILL leaves its PID in `ttyC<n>.lck` and its
//! `ttyC<n>` socket behind in `/tmp/netio<uid>`. The flock itself died with
//! the process, but the stale socket path makes the next bind fail and the
//! PID in the lock file misleads whoever reads it.
//!
//! Lock files are emptied rather than unlinked, under a trial flock, so a
//! proxy attaching concurrently always contends on the same inode.
//!
//! # Example
//!
//! ```no_run
//! use netsim_compute::cleanup::cleanup_stale_resources;
//!
//! // In main(), before attaching any console
//! cleanup_stale_resources();
//! ```

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info, warn};

use crate::console::{netio_dir, read_lock_pid, LOCK_EXTENSION};

/// Clean up stale console files of the current user.
pub fn cleanup_stale_resources() -> usize {
    info!("Checking for stale console locks");
    cleanup_stale_resources_in(&netio_dir())
}

/// Clean up stale console files under `dir`. Returns the number of lock
/// files cleared.
pub fn cleanup_stale_resources_in(dir: &Path) -> usize {
    let stale = list_stale_resources_in(dir);
    let mut cleared = 0;
    for lock in &stale.locks {
        // Re-check under the flock: a proxy may have attached since the scan.
        let Some(held) = try_lock(&lock.path) else {
            debug!("Console lock {} was taken meanwhile", lock.path.display());
            continue;
        };
        info!("Clearing stale console lock {}", lock.path.display());
        if let Err(e) = held.set_len(0) {
            warn!("Failed to clear {}: {}", lock.path.display(), e);
            continue;
        }
        cleared += 1;
        if lock.socket.exists()
            && let Err(e) = fs::remove_file(&lock.socket)
        {
            warn!("Failed to remove stale socket {}: {}", lock.socket.display(), e);
        }
    }
    cleared
}

/// Check if a process with the given PID exists.
fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// The flock on `path`, if nobody else holds it.
fn try_lock(path: &Path) -> Option<Flock<File>> {
    let file = OpenOptions::new().read(true).write(true).open(path).ok()?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock).ok()
}

/// Stale console files of the current user.
pub fn list_stale_resources() -> StaleResources {
    list_stale_resources_in(&netio_dir())
}

/// Stale console files under `dir`.
pub fn list_stale_resources_in(dir: &Path) -> StaleResources {
    let mut resources = StaleResources::default();
    let Ok(entries) = fs::read_dir(dir) else {
        debug!("No console directory {}", dir.display());
        return resources;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != LOCK_EXTENSION) {
            continue;
        }
        // Released locks are empty.
        if fs::metadata(&path).is_ok_and(|m| m.len() == 0) {
            continue;
        }
        let pid = read_lock_pid(&path);
        let alive = pid.is_some_and(process_exists);
        if alive || try_lock(&path).is_none() {
            debug!("Console lock {} is held (PID {:?})", path.display(), pid);
            continue;
        }
        resources.locks.push(StaleLock {
            socket: path.with_extension(""),
            path,
            pid,
        });
    }
    resources.locks.sort_by(|a, b| a.path.cmp(&b.path));
    resources
}

/// A lock file whose owner is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleLock {
    /// Lock file.
    pub path: PathBuf,
    /// Client socket next to it.
    pub socket: PathBuf,
    /// PID the lock file names.
    pub pid: Option<u32>,
}

/// Information about stale resources found on the system.
#[derive(Debug, Default)]
pub struct StaleResources {
    /// Stale console locks.
    pub locks: Vec<StaleLock>,
}

impl StaleResources {
    /// Check if there are any stale resources.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Get total count of stale resources.
    pub fn count(&self) -> usize {
        self.locks.len()
    }
}
