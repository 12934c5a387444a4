//! Container nodes.
//!
//! The container engine is reached through [`ContainerEngine`]; this module
//! only sequences engine calls and describes how adapters are wired. Adapter
//! `N` is a TAP device `tap-nsim-e<N>` created by the bridge helper and moved
//! into the container's network namespace as `eth<N>`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::compute::{ComputeContext, ComputeError, ComputeResult};
use crate::manager::Backend;
use crate::node::{
    Adapter, BackendError, ContainerEngineError, Driver, DriverContext, InternalEndpoint,
    NodeSpec, Started, Wiring,
};

/// Upper bound on adapters per container.
pub const MAX_ADAPTERS: u32 = 99;

/// What the engine needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment, `KEY=value`.
    pub environment: Vec<String>,
    /// Command overriding the image's.
    pub start_command: Option<String>,
    /// Host directory mounted into the container.
    pub working_dir: Option<PathBuf>,
}

/// Container engine operations.
///
/// Implementations report "already in that state" answers as
/// [`ContainerEngineError::NotModified`].
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a container and return its id.
    async fn create(&self, request: &ContainerRequest) -> Result<String, ContainerEngineError>;
    /// Start a container.
    async fn start(&self, id: &str) -> Result<(), ContainerEngineError>;
    /// Stop a container.
    async fn stop(&self, id: &str) -> Result<(), ContainerEngineError>;
    /// Freeze a container.
    async fn pause(&self, id: &str) -> Result<(), ContainerEngineError>;
    /// Thaw a container.
    async fn unpause(&self, id: &str) -> Result<(), ContainerEngineError>;
    /// Delete a container.
    async fn remove(&self, id: &str) -> Result<(), ContainerEngineError>;
    /// PID of the container's init process.
    async fn inspect_pid(&self, id: &str) -> Result<u32, ContainerEngineError>;
}

/// Container node settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerParams {
    /// Image reference.
    pub image: String,
    /// Number of adapters.
    pub adapters: u32,
    /// Environment, `KEY=value`.
    pub environment: Vec<String>,
    /// Command overriding the image's.
    pub start_command: Option<String>,
}

impl Default for DockerParams {
    fn default() -> Self {
        Self {
            image: String::new(),
            adapters: 1,
            environment: Vec::new(),
            start_command: None,
        }
    }
}

/// The `docker` backend.
#[derive(Clone)]
pub struct Docker {
    engine: Arc<dyn ContainerEngine>,
}

impl Docker {
    /// Backend using `engine`.
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }
}

impl Backend for Docker {
    const NAME: &'static str = "docker";
    type Params = DockerParams;

    fn adapters(&self, params: &DockerParams) -> ComputeResult<Vec<Adapter>> {
        if params.adapters > MAX_ADAPTERS {
            return Err(ComputeError::Validation(format!(
                "A container supports at most {MAX_ADAPTERS} adapters"
            )));
        }
        Ok((0..params.adapters).map(Adapter::new).collect())
    }

    fn driver(
        &self,
        spec: &NodeSpec,
        params: DockerParams,
        _compute: &Arc<ComputeContext>,
    ) -> ComputeResult<Box<dyn Driver>> {
        if params.image.trim().is_empty() {
            return Err(ComputeError::Validation(
                "A container node needs an image".to_string(),
            ));
        }
        Ok(Box::new(DockerDriver {
            engine: Arc::clone(&self.engine),
            request: ContainerRequest {
                name: spec.name.clone(),
                image: params.image,
                environment: params.environment,
                start_command: params.start_command,
                working_dir: spec.working_dir.clone(),
            },
            container: Mutex::new(None),
        }))
    }
}

/// TAP device name of an adapter on the host.
pub fn tap_name(adapter: u32) -> String {
    format!("tap-nsim-e{adapter}")
}

/// Sequences engine calls for one container.
pub struct DockerDriver {
    engine: Arc<dyn ContainerEngine>,
    request: ContainerRequest,
    container: Mutex<Option<String>>,
}

impl DockerDriver {
    async fn container_id(&self) -> Result<String, ContainerEngineError> {
        self.container
            .lock()
            .await
            .clone()
            .ok_or_else(|| ContainerEngineError::NotFound(self.request.name.clone()))
    }
}

fn tolerate_not_modified(result: Result<(), ContainerEngineError>) -> Result<(), ContainerEngineError> {
    match result {
        Err(ContainerEngineError::NotModified(id)) => {
            debug!("Container {} already in requested state", id);
            Ok(())
        }
        other => other,
    }
}

#[async_trait]
impl Driver for DockerDriver {
    fn wiring(&self) -> Wiring {
        Wiring::Bridged
    }

    async fn create(&self, node: DriverContext<'_>) -> Result<(), BackendError> {
        let id = self.engine.create(&self.request).await?;
        info!(node_id = %node.node_id, node = node.name, "Container {} created from {}", id, self.request.image);
        *self.container.lock().await = Some(id);
        Ok(())
    }

    async fn start(&self, node: DriverContext<'_>) -> Result<Started, BackendError> {
        let id = self.container_id().await?;
        tolerate_not_modified(self.engine.start(&id).await)?;
        // Right away: the namespace move needs a live PID.
        let pid = self.engine.inspect_pid(&id).await?;
        info!(node_id = %node.node_id, node = node.name, "Container {} running with PID {}", id, pid);
        Ok(Started { pid: Some(pid) })
    }

    async fn stop(&self, node: DriverContext<'_>) -> Result<(), BackendError> {
        let id = self.container_id().await?;
        self.engine.stop(&id).await?;
        info!(node_id = %node.node_id, node = node.name, "Container {} stopped", id);
        Ok(())
    }

    async fn suspend(&self, _node: DriverContext<'_>) -> Result<(), BackendError> {
        let id = self.container_id().await?;
        self.engine.pause(&id).await?;
        Ok(())
    }

    async fn resume(&self, _node: DriverContext<'_>) -> Result<(), BackendError> {
        let id = self.container_id().await?;
        self.engine.unpause(&id).await?;
        Ok(())
    }

    async fn close(&self, node: DriverContext<'_>) -> Result<(), BackendError> {
        let Some(id) = self.container.lock().await.take() else {
            return Ok(());
        };
        match self.engine.remove(&id).await {
            Ok(()) | Err(ContainerEngineError::NotFound(_)) => {
                info!(node_id = %node.node_id, "Container {} removed", id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn endpoint(&self, adapter: u32, started: &Started) -> Option<InternalEndpoint> {
        Some(InternalEndpoint::Namespace {
            tap: tap_name(adapter),
            pid: started.pid?,
            ifname: format!("eth{adapter}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::Manager;
    use crate::nio::Nio;
    use crate::node::NodeStatus;
    use crate::test_support::{compute, RecordingLauncher};
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeEngine {
        calls: StdMutex<Vec<String>>,
        running: StdMutex<bool>,
    }

    impl FakeEngine {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn create(&self, request: &ContainerRequest) -> Result<String, ContainerEngineError> {
            self.record(format!("create {} {}", request.name, request.image));
            Ok("c0ffee".to_string())
        }

        async fn start(&self, id: &str) -> Result<(), ContainerEngineError> {
            self.record(format!("start {id}"));
            let mut running = self.running.lock().unwrap();
            if *running {
                return Err(ContainerEngineError::NotModified(id.to_string()));
            }
            *running = true;
            Ok(())
        }

        async fn stop(&self, id: &str) -> Result<(), ContainerEngineError> {
            self.record(format!("stop {id}"));
            let mut running = self.running.lock().unwrap();
            if !*running {
                return Err(ContainerEngineError::NotModified(id.to_string()));
            }
            *running = false;
            Ok(())
        }

        async fn pause(&self, id: &str) -> Result<(), ContainerEngineError> {
            self.record(format!("pause {id}"));
            Ok(())
        }

        async fn unpause(&self, id: &str) -> Result<(), ContainerEngineError> {
            self.record(format!("unpause {id}"));
            Ok(())
        }

        async fn remove(&self, id: &str) -> Result<(), ContainerEngineError> {
            self.record(format!("remove {id}"));
            Ok(())
        }

        async fn inspect_pid(&self, id: &str) -> Result<u32, ContainerEngineError> {
            self.record(format!("inspect {id}"));
            Ok(4242)
        }
    }

    fn setup(dir: &std::path::Path) -> (Manager<Docker>, Arc<FakeEngine>, Arc<RecordingLauncher>) {
        let engine = Arc::new(FakeEngine::default());
        let launcher = Arc::new(RecordingLauncher::default());
        let manager = Manager::new(
            Docker::new(engine.clone()),
            compute(dir, launcher.clone()),
        );
        (manager, engine, launcher)
    }

    #[tokio::test]
    async fn test_image_required() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, engine, _) = setup(dir.path());
        let err = manager
            .create_node("web1", Uuid::new_v4(), None, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::Validation(_)));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, engine, launcher) = setup(dir.path());
        let node = manager
            .create_node("web1", Uuid::new_v4(), None, json!({"image": "nginx:latest", "adapters": 2}))
            .await
            .unwrap();
        node.add_nio(1, 0, Nio::udp(10003, "127.0.0.1", 10004)).await.unwrap();

        node.start().await.unwrap();
        node.suspend().await.unwrap();
        assert_eq!(node.status().await, NodeStatus::Suspended);
        node.resume().await.unwrap();
        node.stop().await.unwrap();
        manager.delete_node(&node.id().to_string()).await.unwrap();

        assert_eq!(
            engine.calls(),
            [
                "create web1 nginx:latest",
                "start c0ffee",
                "inspect c0ffee",
                "pause c0ffee",
                "unpause c0ffee",
                "stop c0ffee",
                "remove c0ffee",
            ]
        );
        let lines = launcher.helper.lines();
        assert!(lines.contains(&"docker move_to_ns tap-nsim-e0 4242 eth0".to_string()));
        assert!(lines.contains(&"docker move_to_ns tap-nsim-e1 4242 eth1".to_string()));
        assert!(lines.contains(&"bridge add_nio_udp bridge1 10003 127.0.0.1 10004".to_string()));
    }

    #[tokio::test]
    async fn test_start_of_running_container_still_fetches_pid() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, engine, launcher) = setup(dir.path());
        let node = manager
            .create_node("web1", Uuid::new_v4(), None, json!({"image": "alpine"}))
            .await
            .unwrap();
        *engine.running.lock().unwrap() = true;

        node.start().await.unwrap();
        assert!(launcher
            .helper
            .lines()
            .contains(&"docker move_to_ns tap-nsim-e0 4242 eth0".to_string()));
    }

    #[test]
    fn test_too_many_adapters() {
        let docker = Docker::new(Arc::new(FakeEngine::default()));
        let params = DockerParams {
            adapters: MAX_ADAPTERS + 1,
            ..DockerParams::default()
        };
        assert!(docker.adapters(&params).is_err());
    }
}
