//! Projects and their on-disk layout.
//!
//! A project is created on first reference and owns no backend resources
//! directly: closing it asks every [`ProjectMember`] (one per backend
//! manager) to close the project's nodes, then bulk-releases whatever ports
//! the project still holds.
//!
//! # Layout
//!
//! ```text
//! <projects_path>/<project_id>/
//! └── project-files/
//!     ├── captures/
//!     └── <backend>/<node_id>/
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::compute::{ComputeError, ComputeResult};
use crate::ports::PortManager;

/// Directory holding per-node working directories.
pub const PROJECT_FILES_DIR: &str = "project-files";

/// Directory under project files holding packet captures.
pub const CAPTURES_DIR: &str = "captures";

/// Something that owns nodes belonging to projects.
#[async_trait]
pub trait ProjectMember: Send + Sync {
    /// Close every node of the project.
    async fn close_project(&self, project_id: Uuid) -> ComputeResult<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// A named collection of nodes persisted to a working directory.
#[derive(Debug)]
pub struct Project {
    id: Uuid,
    path: PathBuf,
    name: Mutex<Option<String>>,
    nodes: Mutex<BTreeSet<Uuid>>,
    variables: Mutex<BTreeMap<String, String>>,
}

impl Project {
    fn new(id: Uuid, path: PathBuf) -> Self {
        Self {
            id,
            path,
            name: Mutex::new(None),
            nodes: Mutex::new(BTreeSet::new()),
            variables: Mutex::new(BTreeMap::new()),
        }
    }

    /// Project identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Project root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Display name, when the controller supplied one.
    pub fn name(&self) -> Option<String> {
        lock(&self.name).clone()
    }

    /// Set the display name.
    pub fn set_name(&self, name: impl Into<String>) {
        *lock(&self.name) = Some(name.into());
    }

    /// `<project>/project-files`.
    pub fn project_files_dir(&self) -> PathBuf {
        self.path.join(PROJECT_FILES_DIR)
    }

    /// `<project>/project-files/captures`.
    pub fn captures_dir(&self) -> PathBuf {
        self.project_files_dir().join(CAPTURES_DIR)
    }

    /// Working directory of a node, without creating it.
    pub fn node_working_dir(&self, backend: &str, node_id: Uuid) -> PathBuf {
        self.project_files_dir()
            .join(backend)
            .join(node_id.to_string())
    }

    /// Project files directory of pre-UUID projects (`<name>-files`).
    pub fn legacy_files_dir(&self) -> Option<PathBuf> {
        self.name()
            .map(|name| self.path.join(format!("{name}-files")))
    }

    /// Attach a node.
    pub fn add_node(&self, node_id: Uuid) {
        lock(&self.nodes).insert(node_id);
    }

    /// Detach a node. Returns whether it was attached.
    pub fn remove_node(&self, node_id: Uuid) -> bool {
        lock(&self.nodes).remove(&node_id)
    }

    /// Attached nodes in id order.
    pub fn node_ids(&self) -> Vec<Uuid> {
        lock(&self.nodes).iter().copied().collect()
    }

    /// A project variable.
    pub fn variable(&self, key: &str) -> Option<String> {
        lock(&self.variables).get(key).cloned()
    }

    /// Set a project variable.
    pub fn set_variable(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.variables).insert(key.into(), value.into());
    }

    /// All project variables.
    pub fn variables(&self) -> BTreeMap<String, String> {
        lock(&self.variables).clone()
    }
}

/// Live projects by id.
#[derive(Debug)]
pub struct ProjectRegistry {
    root: PathBuf,
    ports: Arc<PortManager>,
    projects: Mutex<HashMap<Uuid, Arc<Project>>>,
}

impl ProjectRegistry {
    /// Create a registry rooted at the projects directory.
    pub fn new(root: impl Into<PathBuf>, ports: Arc<PortManager>) -> Self {
        Self {
            root: root.into(),
            ports,
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Projects directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the project, creating it and its directories on first use.
    pub fn get_or_create(&self, id: Uuid) -> ComputeResult<Arc<Project>> {
        if id.is_nil() {
            return Err(ComputeError::Validation(
                "Project ID cannot be the nil UUID".to_string(),
            ));
        }
        let mut projects = lock(&self.projects);
        if let Some(project) = projects.get(&id) {
            return Ok(Arc::clone(project));
        }
        let project = Arc::new(Project::new(id, self.root.join(id.to_string())));
        std::fs::create_dir_all(project.project_files_dir())?;
        info!("Opened project {} at {}", id, project.path().display());
        projects.insert(id, Arc::clone(&project));
        Ok(project)
    }

    /// An open project.
    pub fn get(&self, id: Uuid) -> ComputeResult<Arc<Project>> {
        lock(&self.projects)
            .get(&id)
            .cloned()
            .ok_or_else(|| ComputeError::NotFound(format!("Project ID {id} doesn't exist")))
    }

    /// Open projects.
    pub fn list(&self) -> Vec<Arc<Project>> {
        lock(&self.projects).values().cloned().collect()
    }

    /// Close the project's nodes, release its ports and forget it.
    ///
    /// Every member is asked even if one fails; the first failure is returned
    /// after the ports are released.
    pub async fn close(&self, id: Uuid, members: &[&dyn ProjectMember]) -> ComputeResult<()> {
        let project = self.get(id)?;
        let mut first_error = None;
        for member in members {
            if let Err(e) = member.close_project(id).await {
                warn!("Error while closing project {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        let released = self.ports.release_all(id);
        if released > 0 {
            warn!("Project {} left {} ports allocated", id, released);
        }
        lock(&self.projects).remove(&project.id());
        info!("Closed project {}", id);
        first_error.map_or(Ok(()), Err)
    }

    /// Close the project and remove its directory.
    pub async fn delete(&self, id: Uuid, members: &[&dyn ProjectMember]) -> ComputeResult<()> {
        let path = self.get(id)?.path().to_path_buf();
        self.close(id, members).await?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("Deleted project {}", id);
        Ok(())
    }
}
