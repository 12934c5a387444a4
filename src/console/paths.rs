//! Console socket locations.

use std::path::{Path, PathBuf};

/// Extension of console lock files.
pub const LOCK_EXTENSION: &str = "lck";

/// `/tmp/netio<uid>` for the current user.
pub fn netio_dir() -> PathBuf {
    PathBuf::from(format!("/tmp/netio{}", nix::unistd::getuid()))
}

/// Sockets and lock file of one console instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetioPaths {
    /// Proxy side (`ttyC<n>`).
    pub client: PathBuf,
    /// Backend side (`ttyS<n>`).
    pub server: PathBuf,
    /// `<client>.lck`.
    pub lock: PathBuf,
}

impl NetioPaths {
    /// Paths of `instance` under `dir`.
    pub fn in_dir(dir: &Path, instance: u32) -> Self {
        let client = dir.join(format!("ttyC{instance}"));
        let lock = lock_path(&client);
        Self {
            server: dir.join(format!("ttyS{instance}")),
            client,
            lock,
        }
    }

    /// Paths of `instance` for the current user.
    pub fn for_instance(instance: u32) -> Self {
        Self::in_dir(&netio_dir(), instance)
    }

    /// Directory holding the sockets.
    pub fn dir(&self) -> &Path {
        self.client.parent().unwrap_or(Path::new("/tmp"))
    }
}

/// `<socket>.lck`.
pub fn lock_path(socket: &Path) -> PathBuf {
    let mut name = socket.as_os_str().to_owned();
    name.push(".");
    name.push(LOCK_EXTENSION);
    PathBuf::from(name)
}
