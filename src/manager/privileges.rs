//! Raw network access detection for helper binaries.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::debug;

const CAP_NET_RAW: u32 = 13;
const CAPABILITY_XATTR: &str = "security.capability";

fn resolve(executable: &Path) -> Option<PathBuf> {
    if executable.components().count() > 1 {
        return Some(executable.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(executable))
            .find(|candidate| candidate.is_file())
    })
}

/// Permitted capability set of a file, from its `security.capability`
/// attribute.
fn file_capabilities(path: &Path) -> Option<u32> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let c_name = CString::new(CAPABILITY_XATTR).ok()?;
    let mut buf = [0u8; 24];
    // SAFETY: both strings are NUL-terminated and `buf` outlives the call,
    // which writes at most `buf.len()` bytes.
    let len = unsafe {
        libc::getxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if len < 8 {
        return None;
    }
    // Layout: magic/flags (u32 LE), then permitted bits 0..32 (u32 LE).
    Some(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]))
}

/// Whether `executable` can open raw sockets and TAP devices.
///
/// True when running as root, when the binary is root-owned and setuid or
/// setgid, or when it carries CAP_NET_RAW. Any detection failure counts
/// as no access.
pub fn has_privileged_access(executable: &Path) -> bool {
    if nix::unistd::geteuid().is_root() {
        return true;
    }
    let Some(path) = resolve(executable) else {
        debug!("{} not found in PATH", executable.display());
        return false;
    };
    let Ok(metadata) = std::fs::metadata(&path) else {
        return false;
    };
    let mode = metadata.permissions().mode();
    if metadata.uid() == 0 && mode & (libc::S_ISUID | libc::S_ISGID) as u32 != 0 {
        return true;
    }
    file_capabilities(&path).is_some_and(|permitted| permitted & (1 << CAP_NET_RAW) != 0)
}
