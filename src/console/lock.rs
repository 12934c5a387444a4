//! Advisory console lock.
//!
//! The lock file holds the PID of the attached proxy. Contention and any
//! failure of the locking primitive both refuse the attach.
//!
//! The file is never unlinked. Releasing empties it while the flock is still
//! held, so every proxy locks the same inode and an empty file means nobody
//! is attached.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use super::error::{ConsoleError, ConsoleResult};

/// Held for as long as a proxy is attached.
pub struct ConsoleLock {
    path: PathBuf,
    file: Flock<File>,
}

impl std::fmt::Debug for ConsoleLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleLock").field("path", &self.path).finish()
    }
}

/// PID recorded in a lock file.
pub fn read_lock_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

impl ConsoleLock {
    /// Take the lock without waiting and record our PID in it.
    pub fn acquire(path: &Path) -> ConsoleResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((mut file, Errno::EAGAIN)) => {
                let mut content = String::new();
                let _ = file.read_to_string(&mut content);
                return Err(ConsoleError::Locked {
                    path: path.to_path_buf(),
                    pid: content.trim().parse().ok(),
                });
            }
            Err((_, source)) => {
                return Err(ConsoleError::LockUnavailable {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!("Console lock {} acquired", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConsoleLock {
    fn drop(&mut self) {
        // Flock drops after this body, so the truncate happens under the lock.
        if let Err(e) = self.file.set_len(0) {
            debug!("Could not clear console lock {}: {}", self.path.display(), e);
        }
    }
}
