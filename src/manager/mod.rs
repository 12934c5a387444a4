//! Per-backend node registries.
//!
//! A [`Manager`] owns the live nodes of one backend type. The backend itself
//! is described by a [`Backend`] implementation: its name, its settings
//! type, how many adapters a node gets and how to build its [`Driver`].
//!
//! # Architecture
//!
//! ```text
//! create_node ─► parse id (UUID / legacy numeric ─► migration)
//!             ─► project ─► working dir ─► console port ─► Driver
//!             ─► Node::create ─► register ─► node.created
//! delete_node ─► unregister ─► Node::close ─► node.deleted
//! ```
//!
//! Images are resolved against `<images>/<BACKEND>`, the additional image
//! directories, then `<images>`.

mod images;
mod migration;
mod privileges;

pub use images::{
    checksum, checksum_path, images_directories, list_images, resolve_image_path, write_image,
    ImageInfo, CHECKSUM_EXTENSION,
};
pub use migration::LEDGER_FILE;
pub use privileges::has_privileged_access;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::compute::{ComputeContext, ComputeError, ComputeResult};
use crate::nio::Nio;
use crate::node::{Adapter, Driver, Node, NodeSpec};
use crate::project::ProjectMember;
use crate::telemetry::AuditEvent;

/// Static description of a backend type.
pub trait Backend: Send + Sync + 'static {
    /// Backend type name, also the working directory segment.
    const NAME: &'static str;

    /// Whether nodes get `project-files/<NAME>/<id>`.
    const HAS_WORKING_DIRECTORY: bool = true;

    /// Whether nodes get a console TCP port.
    const HAS_CONSOLE: bool = false;

    /// Backend-specific node settings.
    type Params: DeserializeOwned + Default + Send;

    /// Directory under the images root holding this backend's images.
    fn image_dir_name(&self) -> String {
        Self::NAME.to_uppercase()
    }

    /// Old working directory of a legacy node, relative to `project-files/`.
    fn legacy_workdir(&self, _legacy_id: u64) -> Option<PathBuf> {
        None
    }

    /// Adapters a new node starts with.
    fn adapters(&self, params: &Self::Params) -> ComputeResult<Vec<Adapter>>;

    /// Build the driver of a new node.
    fn driver(
        &self,
        spec: &NodeSpec,
        params: Self::Params,
        compute: &Arc<ComputeContext>,
    ) -> ComputeResult<Box<dyn Driver>>;
}

enum RequestedId {
    Fresh,
    Uuid(Uuid),
    Legacy(u64),
}

fn parse_requested_id(node_id: Option<&str>) -> ComputeResult<RequestedId> {
    let Some(raw) = node_id else {
        return Ok(RequestedId::Fresh);
    };
    if raw.len() == 36
        && let Ok(id) = Uuid::parse_str(raw)
    {
        return Ok(RequestedId::Uuid(id));
    }
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit())
        && let Ok(legacy) = raw.parse::<u64>()
    {
        return Ok(RequestedId::Legacy(legacy));
    }
    Err(ComputeError::Validation(format!(
        "Node ID {raw} is not a valid UUID"
    )))
}

fn parse_node_id(node_id: &str) -> ComputeResult<Uuid> {
    match parse_requested_id(Some(node_id))? {
        RequestedId::Uuid(id) => Ok(id),
        _ => Err(ComputeError::Validation(format!(
            "Node ID {node_id} is not a valid UUID"
        ))),
    }
}

/// Recursively copy `from` into `to`, recreating symlinks as symlinks.
pub(crate) fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Registry and factory for the nodes of one backend.
pub struct Manager<B: Backend> {
    backend: B,
    compute: Arc<ComputeContext>,
    nodes: RwLock<HashMap<Uuid, Arc<Node>>>,
}

impl<B: Backend> std::fmt::Debug for Manager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("backend", &B::NAME)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Manager<B> {
    /// Create an empty registry.
    pub fn new(backend: B, compute: Arc<ComputeContext>) -> Self {
        Self {
            backend,
            compute,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// The backend description.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Shared services.
    pub fn compute(&self) -> &Arc<ComputeContext> {
        &self.compute
    }

    /// All live nodes.
    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Create a node, or return the registered node with the same id.
    ///
    /// `node_id` may be a UUID, a legacy numeric id (migrated once, under
    /// the compute-wide migration lock) or absent.
    pub async fn create_node(
        &self,
        name: &str,
        project_id: Uuid,
        node_id: Option<&str>,
        params: Value,
    ) -> ComputeResult<Arc<Node>> {
        let requested = parse_requested_id(node_id)?;
        if let RequestedId::Uuid(id) = requested
            && let Some(node) = self.nodes.read().await.get(&id)
        {
            return Ok(Arc::clone(node));
        }
        if name.trim().is_empty() {
            return Err(ComputeError::Validation("Node name is empty".to_string()));
        }
        let params: B::Params = if params.is_null() {
            B::Params::default()
        } else {
            serde_json::from_value(params).map_err(|e| {
                ComputeError::Validation(format!("Invalid {} node settings: {}", B::NAME, e))
            })?
        };

        let project = self.compute.projects().get_or_create(project_id)?;
        let id = match requested {
            RequestedId::Fresh => Uuid::new_v4(),
            RequestedId::Uuid(id) => id,
            RequestedId::Legacy(legacy_id) => {
                let _guard = self.compute.migration_lock().lock().await;
                let id = migration::migrate_legacy_node(
                    &self.compute,
                    &project,
                    B::NAME,
                    legacy_id,
                    self.backend.legacy_workdir(legacy_id),
                )
                .await?;
                if let Some(node) = self.nodes.read().await.get(&id) {
                    return Ok(Arc::clone(node));
                }
                id
            }
        };

        let adapters = self.backend.adapters(&params)?;
        let working_dir = if B::HAS_WORKING_DIRECTORY {
            let dir = project.node_working_dir(B::NAME, id);
            tokio::fs::create_dir_all(&dir).await?;
            Some(dir)
        } else {
            None
        };
        let console = if B::HAS_CONSOLE {
            Some(
                self.compute
                    .ports()
                    .allocate_console_port(project_id, None, None)?,
            )
        } else {
            None
        };

        let spec = NodeSpec {
            id,
            name: name.to_string(),
            project_id,
            node_type: B::NAME,
            working_dir,
            console,
            adapters,
        };
        let driver = match self.backend.driver(&spec, params, &self.compute) {
            Ok(driver) => driver,
            Err(e) => {
                if let Some(port) = console {
                    self.compute.ports().release_tcp_port(port, project_id);
                }
                return Err(e);
            }
        };
        let node = Arc::new(Node::new(spec, driver, Arc::clone(&self.compute)));
        if let Err(e) = node.create().await {
            if let Err(close_err) = node.close().await {
                warn!(node_id = %id, "Close after failed create: {}", close_err);
            }
            return Err(e);
        }

        {
            let mut nodes = self.nodes.write().await;
            if let Some(existing) = nodes.get(&id) {
                let existing = Arc::clone(existing);
                drop(nodes);
                if let Err(e) = node.close().await {
                    warn!(node_id = %id, "Close of duplicate node failed: {}", e);
                }
                return Ok(existing);
            }
            nodes.insert(id, Arc::clone(&node));
        }
        project.add_node(id);

        info!("{} node {} '{}' created in project {}", B::NAME, id, name, project_id);
        self.compute.audit().log(AuditEvent::NodeCreate {
            node_id: id,
            name: name.to_string(),
            node_type: B::NAME.to_string(),
            project_id,
        });
        self.emit("node.created", &node).await;
        Ok(node)
    }

    async fn emit(&self, action: &str, node: &Node) {
        match serde_json::to_value(node.info().await) {
            Ok(event) => self
                .compute
                .notifications()
                .project_emit(action, event, node.project_id()),
            Err(e) => warn!("Could not serialize node {}: {}", node.id(), e),
        }
    }

    /// Look up a node, optionally scoped to a project.
    ///
    /// A node of another project is reported exactly like a missing one.
    pub async fn get_node(&self, node_id: &str, project_id: Option<Uuid>) -> ComputeResult<Arc<Node>> {
        let id = parse_node_id(node_id)?;
        let not_found = || ComputeError::NotFound(format!("Node ID {node_id} doesn't exist"));
        let node = self.nodes.read().await.get(&id).cloned().ok_or_else(not_found)?;
        match project_id {
            Some(project) if project != node.project_id() => Err(not_found()),
            _ => Ok(node),
        }
    }

    /// Unregister and close a node.
    ///
    /// The node is gone from the registry even when closing fails.
    pub async fn delete_node(&self, node_id: &str) -> ComputeResult<()> {
        let id = parse_node_id(node_id)?;
        let node = self
            .nodes
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| ComputeError::NotFound(format!("Node ID {node_id} doesn't exist")))?;

        let name = node.name().await;
        self.emit("node.deleted", &node).await;
        let result = node.close().await;
        if let Ok(project) = self.compute.projects().get(node.project_id()) {
            project.remove_node(id);
        }
        info!("{} node {} '{}' deleted", B::NAME, id, name);
        self.compute.audit().log(AuditEvent::NodeDelete { node_id: id, name });
        result
    }

    /// Replace `destination_id`'s files with a copy of `source_id`'s and
    /// regenerate its derived configuration.
    ///
    /// Nodes without a working directory are returned unchanged.
    pub async fn duplicate_node(&self, source_id: &str, destination_id: &str) -> ComputeResult<Arc<Node>> {
        let source = self.get_node(source_id, None).await?;
        let destination = self.get_node(destination_id, None).await?;
        let (Some(from), Some(to)) = (source.working_dir(), destination.working_dir()) else {
            return Ok(destination);
        };
        let (from, to) = (from.to_path_buf(), to.to_path_buf());

        tokio::task::spawn_blocking(move || {
            if to.exists() {
                fs::remove_dir_all(&to)?;
            }
            copy_tree(&from, &to)
        })
        .await
        .map_err(io::Error::other)
        .and_then(|r| r)
        .map_err(|e| ComputeError::Conflict(format!("Can't duplicate node data: {e}")))?;

        destination.regenerate_configuration().await?;
        info!("Duplicated {} node {} into {}", B::NAME, source.id(), destination.id());
        Ok(destination)
    }

    /// Create a NIO, checking TAP access against the configured helper.
    pub async fn create_nio(&self, settings: &Value) -> ComputeResult<Nio> {
        let helper = PathBuf::from(&self.compute.config().ubridge.path);
        crate::nio::create_nio(settings, &helper).await
    }

    /// Existing image directories for this backend.
    pub fn images_directories(&self) -> Vec<PathBuf> {
        images_directories(&self.compute.config().server, &self.backend.image_dir_name())
    }

    fn default_images_dir(&self) -> PathBuf {
        self.compute
            .config()
            .server
            .images_dir()
            .join(self.backend.image_dir_name())
    }

    /// Resolve an image reference. `extra_dir` is searched first.
    pub fn resolve_image_path(&self, path: &str, extra_dir: Option<&Path>) -> ComputeResult<PathBuf> {
        let mut dirs: Vec<PathBuf> = extra_dir.map(Path::to_path_buf).into_iter().collect();
        dirs.extend(self.images_directories());
        resolve_image_path(
            path,
            &dirs,
            &self.default_images_dir(),
            self.compute.config().server.local,
        )
    }

    /// Images available to this backend.
    pub async fn list_images(&self) -> ComputeResult<Vec<ImageInfo>> {
        list_images(self.images_directories()).await
    }

    /// Store an uploaded image in this backend's image directory.
    pub async fn write_image<R>(&self, filename: &str, stream: R) -> ComputeResult<ImageInfo>
    where
        R: AsyncRead + Unpin + Send,
    {
        let info = write_image(&self.default_images_dir(), filename, stream).await?;
        info!("Image {} written ({} bytes)", info.path.display(), info.size);
        self.compute.audit().log(AuditEvent::ImageWrite {
            path: info.path.display().to_string(),
            checksum: info.checksum.clone(),
        });
        Ok(info)
    }
}

#[async_trait]
impl<B: Backend> ProjectMember for Manager<B> {
    async fn close_project(&self, project_id: Uuid) -> ComputeResult<()> {
        let closing: Vec<Arc<Node>> = {
            let mut nodes = self.nodes.write().await;
            let ids: Vec<Uuid> = nodes
                .values()
                .filter(|n| n.project_id() == project_id)
                .map(|n| n.id())
                .collect();
            ids.iter().filter_map(|id| nodes.remove(id)).collect()
        };
        let project = self.compute.projects().get(project_id).ok();
        let mut first_error = None;
        for node in closing {
            if let Err(e) = node.close().await {
                warn!(node_id = %node.id(), "Close failed with project {}: {}", project_id, e);
                first_error.get_or_insert(e);
            }
            if let Some(project) = &project {
                project.remove_node(node.id());
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeStatus;
    use crate::test_support::{compute, FakeDriver, RecordingLauncher};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    struct FakeParams {
        adapters: u32,
        fail: bool,
    }

    struct FakeBackend;

    impl Backend for FakeBackend {
        const NAME: &'static str = "fake";
        const HAS_CONSOLE: bool = true;
        type Params = FakeParams;

        fn legacy_workdir(&self, legacy_id: u64) -> Option<PathBuf> {
            Some(PathBuf::from(format!("fake/pc-{legacy_id}")))
        }

        fn adapters(&self, params: &FakeParams) -> ComputeResult<Vec<Adapter>> {
            Ok((0..params.adapters.max(1)).map(Adapter::new).collect())
        }

        fn driver(
            &self,
            _spec: &NodeSpec,
            params: FakeParams,
            _compute: &Arc<ComputeContext>,
        ) -> ComputeResult<Box<dyn Driver>> {
            if params.fail {
                return Err(ComputeError::Validation("refused".to_string()));
            }
            Ok(Box::new(FakeDriver::namespace(4242)))
        }
    }

    fn manager(dir: &Path) -> Manager<FakeBackend> {
        Manager::new(
            FakeBackend,
            compute(dir, Arc::new(RecordingLauncher::default())),
        )
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let project = Uuid::new_v4();
        let id = Uuid::new_v4().to_string();

        let first = manager
            .create_node("PC1", project, Some(&id), json!({"adapters": 2}))
            .await
            .unwrap();
        let second = manager
            .create_node("renamed", project, Some(&id), Value::Null)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.name().await, "PC1");
        assert_eq!(manager.nodes().await.len(), 1);
        assert!(first.working_dir().unwrap().is_dir());
        assert!(first.console().await.is_some());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let project = Uuid::new_v4();

        for (name, id, params) in [
            ("PC1", Some("not-a-uuid"), Value::Null),
            ("", None, Value::Null),
            ("PC1", None, json!({"adapters": "many"})),
        ] {
            let err = manager.create_node(name, project, id, params).await.unwrap_err();
            assert!(matches!(err, ComputeError::Validation(_)), "{err}");
        }
    }

    #[tokio::test]
    async fn test_driver_failure_releases_console() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let project = Uuid::new_v4();

        assert!(manager
            .create_node("PC1", project, None, json!({"fail": true}))
            .await
            .is_err());
        assert!(manager.compute().ports().allocated_ports(project).is_empty());
        assert!(manager.nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_node_scoping() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let project = Uuid::new_v4();
        let node = manager
            .create_node("PC1", project, None, Value::Null)
            .await
            .unwrap();
        let id = node.id().to_string();

        assert!(manager.get_node(&id, Some(project)).await.is_ok());
        assert!(manager.get_node(&id, None).await.is_ok());

        let foreign = manager.get_node(&id, Some(Uuid::new_v4())).await.unwrap_err();
        let missing = manager
            .get_node(&Uuid::new_v4().to_string(), None)
            .await
            .unwrap_err();
        assert_eq!(foreign.status_code(), 404);
        assert_eq!(missing.status_code(), 404);

        let invalid = manager.get_node("42", None).await.unwrap_err();
        assert_eq!(invalid.status_code(), 400);
    }

    #[tokio::test]
    async fn test_delete_node() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let project = Uuid::new_v4();
        let mut queue = manager.compute().notifications().queue();

        let node = manager
            .create_node("PC1", project, None, Value::Null)
            .await
            .unwrap();
        node.start().await.unwrap();
        let console = node.console().await.unwrap();
        let id = node.id().to_string();

        manager.delete_node(&id).await.unwrap();
        assert!(node.is_closed().await);
        assert_eq!(node.status().await, NodeStatus::Stopped);
        assert!(!manager.compute().ports().is_tcp_allocated(console));
        assert!(matches!(
            manager.delete_node(&id).await,
            Err(ComputeError::NotFound(_))
        ));
        let project = manager.compute().projects().get(project).unwrap();
        assert!(project.node_ids().is_empty());

        let mut actions = Vec::new();
        while let Some(n) = queue.try_get() {
            actions.push(n.action);
        }
        assert_eq!(actions.first().map(String::as_str), Some("node.created"));
        assert_eq!(actions.last().map(String::as_str), Some("node.deleted"));
    }

    #[tokio::test]
    async fn test_duplicate_copies_tree() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let project = Uuid::new_v4();
        let src = manager.create_node("PC1", project, None, Value::Null).await.unwrap();
        let dst = manager.create_node("PC2", project, None, Value::Null).await.unwrap();

        let src_dir = src.working_dir().unwrap();
        fs::create_dir_all(src_dir.join("configs")).unwrap();
        fs::write(src_dir.join("configs/startup.cfg"), b"hostname PC1").unwrap();
        std::os::unix::fs::symlink("configs/startup.cfg", src_dir.join("link")).unwrap();
        fs::write(dst.working_dir().unwrap().join("stale"), b"old").unwrap();

        let out = manager
            .duplicate_node(&src.id().to_string(), &dst.id().to_string())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&out, &dst));

        let dst_dir = dst.working_dir().unwrap();
        assert_eq!(fs::read(dst_dir.join("configs/startup.cfg")).unwrap(), b"hostname PC1");
        assert!(fs::symlink_metadata(dst_dir.join("link")).unwrap().file_type().is_symlink());
        assert!(!dst_dir.join("stale").exists());
    }

    #[tokio::test]
    async fn test_legacy_id_migrates_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let project_id = Uuid::new_v4();
        let project = manager.compute().projects().get_or_create(project_id).unwrap();
        let legacy = project.project_files_dir().join("fake/pc-5");
        fs::create_dir_all(&legacy).unwrap();
        fs::write(legacy.join("startup.vpc"), b"set pcname PC1\n").unwrap();

        let node = manager
            .create_node("PC1", project_id, Some("5"), Value::Null)
            .await
            .unwrap();
        assert_eq!(
            fs::read(node.working_dir().unwrap().join("startup.vpc")).unwrap(),
            b"set pcname PC1\n"
        );
        assert!(!legacy.exists());

        let again = manager
            .create_node("PC1", project_id, Some("5"), Value::Null)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&node, &again));
    }

    #[tokio::test]
    async fn test_close_project_closes_its_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let in_a = manager.create_node("PC1", a, None, Value::Null).await.unwrap();
        let in_b = manager.create_node("PC2", b, None, Value::Null).await.unwrap();

        manager
            .compute()
            .projects()
            .close(a, &[&manager as &dyn ProjectMember])
            .await
            .unwrap();

        assert!(in_a.is_closed().await);
        assert!(!in_b.is_closed().await);
        assert_eq!(manager.nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_write_then_resolve_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::ConfigLoader::defaults().unwrap();
        config.server.images_path = dir.path().join("images").display().to_string();
        let compute = ComputeContext::builder(config)
            .projects_path(dir.path().join("projects"))
            .probe_ports(false)
            .launcher(Arc::new(RecordingLauncher::default()))
            .build()
            .unwrap();
        let manager = Manager::new(FakeBackend, compute);

        let info = manager.write_image("disk.img", &b"image"[..]).await.unwrap();
        assert_eq!(info.path, dir.path().join("images/FAKE/disk.img"));
        assert_eq!(manager.resolve_image_path("disk.img", None).unwrap(), info.path);

        let images = manager.list_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].checksum, info.checksum);
    }
}
