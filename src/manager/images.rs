//! Image lookup, upload and listing.
//!
//! Checksums are SHA-256, cached next to each image in a `.sha256sum`
//! sidecar.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::compute::{ComputeError, ComputeResult};
use crate::config::ServerConfig;

/// Sidecar extension holding a cached checksum.
pub const CHECKSUM_EXTENSION: &str = "sha256sum";

const COPY_BUFFER: usize = 64 * 1024;

/// One image file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    /// Name relative to the directory it was found in.
    pub filename: String,
    /// Absolute path.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Hex SHA-256.
    pub checksum: String,
}

/// Directories searched for a backend's images, existing ones only:
/// the backend directory, the additional directories, then the images root.
pub fn images_directories(server: &ServerConfig, type_dir: &str) -> Vec<PathBuf> {
    let root = server.images_dir();
    let mut dirs = vec![root.join(type_dir)];
    dirs.extend(server.additional_images_dirs());
    dirs.push(root);
    dirs.retain(|d| d.is_dir());
    dirs.dedup();
    dirs
}

/// `C:...` style paths.
fn is_foreign_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Find `wanted` under `dir`. A one-level parent in `wanted` must match the
/// name of the directory holding the file.
fn search_directory(dir: &Path, wanted: &Path) -> Option<PathBuf> {
    let file_name = wanted.file_name()?;
    let parent_name = wanted.parent().and_then(|p| p.file_name());

    let mut entries: Vec<_> = fs::read_dir(dir).ok()?.filter_map(Result::ok).collect();
    entries.sort_by_key(|e| e.file_name());

    let dir_matches = parent_name.is_none_or(|p| dir.file_name() == Some(p));
    if dir_matches
        && let Some(found) = entries
            .iter()
            .find(|e| e.file_name() == file_name && !e.path().is_dir())
    {
        return Some(found.path());
    }
    entries
        .iter()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .find_map(|e| search_directory(&e.path(), wanted))
}

/// Resolve an image reference to an existing file.
///
/// Relative references are searched recursively in `search_dirs`, then
/// looked up verbatim under `default_dir`. Absolute paths are accepted as-is
/// only on a local server; otherwise they must lie inside one of the
/// directories.
pub fn resolve_image_path(
    path: &str,
    search_dirs: &[PathBuf],
    default_dir: &Path,
    local: bool,
) -> ComputeResult<PathBuf> {
    if path.is_empty() || path == "." {
        return Err(ComputeError::Validation("Image path is empty".to_string()));
    }
    if is_foreign_absolute(path) {
        return Err(ComputeError::Forbidden(format!(
            "{} is not allowed on this remote server. Please only use a file from '{}'",
            path,
            default_dir.display()
        )));
    }
    let missing = || ComputeError::ImageMissing {
        image: path.to_string(),
    };

    let requested = Path::new(path);
    if requested.is_relative() {
        if requested.components().any(|c| c == Component::ParentDir) {
            return Err(ComputeError::Forbidden(format!(
                "{path} escapes the image directories"
            )));
        }
        for dir in search_dirs {
            debug!("Searching for image '{}' in '{}'", path, dir.display());
            if let Some(found) = search_directory(dir, requested) {
                return Ok(found);
            }
        }
        let candidate = default_dir.join(requested);
        if candidate.is_file() {
            return Ok(candidate);
        }
        return Err(missing());
    }

    if local {
        return if requested.exists() {
            Ok(requested.to_path_buf())
        } else {
            Err(missing())
        };
    }

    let normalized = normalize(requested);
    for dir in search_dirs.iter().map(|d| d.as_path()).chain([default_dir]) {
        if normalized.starts_with(normalize(dir)) {
            return if normalized.exists() {
                Ok(normalized)
            } else {
                Err(missing())
            };
        }
    }
    Err(ComputeError::Forbidden(format!(
        "{} is not allowed on this remote server. Please only use a file from '{}'",
        path,
        default_dir.display()
    )))
}

/// `<image>.sha256sum`.
pub fn checksum_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".");
    name.push(CHECKSUM_EXTENSION);
    PathBuf::from(name)
}

/// Checksum of an image, from its sidecar when valid, computed (and
/// cached) otherwise.
pub fn checksum(image: &Path) -> io::Result<String> {
    let sidecar = checksum_path(image);
    if let Ok(cached) = fs::read_to_string(&sidecar) {
        let cached = cached.trim();
        if cached.len() == 64 && cached.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(cached.to_string());
        }
    }
    let mut hasher = Sha256::new();
    io::copy(&mut fs::File::open(image)?, &mut hasher)?;
    let digest = hex::encode(hasher.finalize());
    if let Err(e) = fs::write(&sidecar, format!("{digest}\n")) {
        warn!("Could not cache checksum for {}: {}", image.display(), e);
    }
    Ok(digest)
}

fn validate_image_name(filename: &str) -> ComputeResult<PathBuf> {
    let relative = Path::new(filename);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if filename.is_empty() || !plain {
        return Err(ComputeError::Validation(format!(
            "Invalid image file name '{filename}'"
        )));
    }
    if filename.ends_with(&format!(".{CHECKSUM_EXTENSION}")) {
        return Err(ComputeError::Validation(format!(
            "'{filename}' is a reserved checksum file name"
        )));
    }
    Ok(relative.to_path_buf())
}

/// Stream an image into `dir/filename`.
///
/// Data goes to a temporary file in the target directory which replaces the
/// destination only once the stream completed. The cached checksum is
/// removed before writing and recomputed from the written bytes.
pub async fn write_image<R>(dir: &Path, filename: &str, mut stream: R) -> ComputeResult<ImageInfo>
where
    R: AsyncRead + Unpin + Send,
{
    let relative = validate_image_name(filename)?;
    let target = dir.join(&relative);
    let parent = target.parent().unwrap_or(dir).to_path_buf();
    tokio::fs::create_dir_all(&parent).await?;

    match tokio::fs::remove_file(checksum_path(&target)).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let temp = tempfile::NamedTempFile::new_in(&parent)?;
    let mut file = tokio::fs::File::from_std(temp.reopen()?);
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o644))?;
    temp.persist(&target).map_err(|e| e.error)?;

    let digest = hex::encode(hasher.finalize());
    tokio::fs::write(checksum_path(&target), format!("{digest}\n")).await?;
    debug!("Wrote image {} ({} bytes)", target.display(), size);

    Ok(ImageInfo {
        filename: relative.to_string_lossy().into_owned(),
        path: target,
        size,
        checksum: digest,
    })
}

fn collect_images(root: &Path, dir: &Path, seen: &mut Vec<String>, out: &mut Vec<ImageInfo>) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.filter_map(Result::ok).collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name.ends_with(&format!(".{CHECKSUM_EXTENSION}")) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_images(root, &path, seen, out)?;
            continue;
        }
        let filename = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        if seen.contains(&filename) || out.iter().any(|i: &ImageInfo| i.path == path) {
            continue;
        }
        let size = fs::metadata(&path)?.len();
        out.push(ImageInfo {
            checksum: checksum(&path)?,
            filename: filename.clone(),
            path,
            size,
        });
        seen.push(filename);
    }
    Ok(())
}

/// Images under `dirs`, first directory winning on duplicate names.
/// Nested search directories list each file once.
///
/// Directories are walked on the blocking pool since checksums may need to
/// be computed.
pub async fn list_images(dirs: Vec<PathBuf>) -> ComputeResult<Vec<ImageInfo>> {
    let images = tokio::task::spawn_blocking(move || {
        let mut seen = Vec::new();
        let mut out = Vec::new();
        for dir in &dirs {
            collect_images(dir, dir, &mut seen, &mut out)?;
        }
        Ok::<_, io::Error>(out)
    })
    .await
    .map_err(io::Error::other)??;
    Ok(images)
}
