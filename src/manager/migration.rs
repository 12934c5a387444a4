//! One-time migration of pre-UUID nodes.
//!
//! Old projects kept their files in `<project>/<name>-files` and numbered
//! nodes. Migration moves both layouts under `project-files/` and records
//! the assigned UUID in a per-project ledger so a project reopened later
//! maps the same numeric id to the same node without moving anything.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::info;
use uuid::Uuid;

use super::copy_tree;
use crate::compute::{ComputeContext, ComputeError, ComputeResult};
use crate::project::Project;
use crate::telemetry::AuditEvent;

/// Ledger file name inside the project directory.
pub const LEDGER_FILE: &str = ".legacy-node-ids.json";

type Ledger = BTreeMap<String, Uuid>;

fn migration_error(path: &Path) -> impl FnOnce(io::Error) -> ComputeError + '_ {
    move |source| ComputeError::Migration {
        path: path.to_path_buf(),
        source,
    }
}

fn read_ledger(path: &Path) -> ComputeResult<Ledger> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| migration_error(path)(io::Error::new(io::ErrorKind::InvalidData, e))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Ledger::new()),
        Err(e) => Err(migration_error(path)(e)),
    }
}

fn write_ledger(path: &Path, ledger: &Ledger) -> io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, ledger).map_err(io::Error::from)?;
    temp.write_all(b"\n")?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}

/// Rename, falling back to copy and delete across filesystems.
fn move_tree(from: &Path, to: &Path) -> io::Result<()> {
    if is_empty_dir(to) {
        fs::remove_dir(to)?;
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            copy_tree(from, to)?;
            fs::remove_dir_all(from)
        }
        Err(e) => Err(e),
    }
}

struct Plan {
    ledger_path: PathBuf,
    key: String,
    node_id: Uuid,
    files_dir: Option<(PathBuf, PathBuf)>,
    workdir: Option<(PathBuf, PathBuf)>,
}

fn apply(plan: &Plan, mut ledger: Ledger) -> ComputeResult<()> {
    if let Some((from, to)) = &plan.files_dir
        && from.is_dir()
        && (!to.exists() || is_empty_dir(to))
    {
        info!("Moving legacy project files {} to {}", from.display(), to.display());
        move_tree(from, to).map_err(migration_error(from))?;
    }
    if let Some((from, to)) = &plan.workdir
        && from.is_dir()
    {
        info!("Moving legacy node directory {} to {}", from.display(), to.display());
        move_tree(from, to).map_err(migration_error(from))?;
    }
    ledger.insert(plan.key.clone(), plan.node_id);
    write_ledger(&plan.ledger_path, &ledger).map_err(migration_error(&plan.ledger_path))
}

/// Map a legacy numeric node id to a UUID, migrating its files the first
/// time.
///
/// `legacy_workdir` is the node's old directory relative to
/// `project-files/`. Callers hold the compute migration lock.
pub(crate) async fn migrate_legacy_node(
    compute: &ComputeContext,
    project: &Project,
    backend: &'static str,
    legacy_id: u64,
    legacy_workdir: Option<PathBuf>,
) -> ComputeResult<Uuid> {
    let ledger_path = project.path().join(LEDGER_FILE);
    let key = format!("{backend}:{legacy_id}");
    let ledger = read_ledger(&ledger_path)?;
    if let Some(&node_id) = ledger.get(&key) {
        return Ok(node_id);
    }

    let node_id = Uuid::new_v4();
    let files = project.project_files_dir();
    let plan = Plan {
        files_dir: project
            .legacy_files_dir()
            .map(|legacy| (legacy, files.clone())),
        workdir: legacy_workdir
            .map(|old| (files.join(old), project.node_working_dir(backend, node_id))),
        ledger_path,
        key,
        node_id,
    };

    tokio::task::spawn_blocking(move || apply(&plan, ledger))
        .await
        .map_err(io::Error::other)??;

    info!(
        "Migrated legacy {} node {} of project {} to {}",
        backend,
        legacy_id,
        project.id(),
        node_id
    );
    compute.audit().log(AuditEvent::NodeMigrate {
        project_id: project.id(),
        legacy_id,
        node_id,
    });
    Ok(node_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{compute, RecordingLauncher};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_migrates_once() {
        let dir = tempfile::tempdir().unwrap();
        let compute = compute(dir.path(), Arc::new(RecordingLauncher::default()));
        let project = compute.projects().get_or_create(Uuid::new_v4()).unwrap();
        project.set_name("lab");

        let legacy = project.path().join("lab-files/vpcs/pc-5");
        fs::create_dir_all(&legacy).unwrap();
        fs::write(legacy.join("startup.vpc"), b"set pcname PC1\n").unwrap();

        let id = migrate_legacy_node(&compute, &project, "vpcs", 5, Some("vpcs/pc-5".into()))
            .await
            .unwrap();

        let moved = project.node_working_dir("vpcs", id).join("startup.vpc");
        assert_eq!(fs::read(moved).unwrap(), b"set pcname PC1\n");
        assert!(!project.path().join("lab-files").exists());
        assert!(!project.project_files_dir().join("vpcs/pc-5").exists());

        let again = migrate_legacy_node(&compute, &project, "vpcs", 5, Some("vpcs/pc-5".into()))
            .await
            .unwrap();
        assert_eq!(again, id);

        let other = migrate_legacy_node(&compute, &project, "docker", 5, None)
            .await
            .unwrap();
        assert_ne!(other, id);
    }

    #[tokio::test]
    async fn test_corrupt_ledger_is_a_migration_error() {
        let dir = tempfile::tempdir().unwrap();
        let compute = compute(dir.path(), Arc::new(RecordingLauncher::default()));
        let project = compute.projects().get_or_create(Uuid::new_v4()).unwrap();
        fs::write(project.path().join(LEDGER_FILE), b"{not json").unwrap();

        let err = migrate_legacy_node(&compute, &project, "vpcs", 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::Migration { .. }));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_move_tree_replaces_empty_target() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("old");
        let to = dir.path().join("new");
        fs::create_dir_all(from.join("sub")).unwrap();
        fs::write(from.join("sub/f"), b"x").unwrap();
        fs::create_dir_all(&to).unwrap();

        move_tree(&from, &to).unwrap();
        assert_eq!(fs::read(to.join("sub/f")).unwrap(), b"x");
        assert!(!from.exists());
    }
}
