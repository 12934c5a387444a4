use std::fs;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use netsim_compute::backends::{ContainerEngine, ContainerRequest, Docker, EthernetSwitch, Vpcs};
use netsim_compute::compute::{ComputeContext, ComputeError};
use netsim_compute::config::ConfigLoader;
use netsim_compute::manager::Manager;
use netsim_compute::node::{ContainerEngineError, NodeStatus};
use netsim_compute::ubridge::{
    BridgeCommand, BridgeHelper, BridgeLauncher, LaunchRequest, UbridgeResult,
};
use serde_json::json;
use uuid::Uuid;

#[derive(Default)]
struct Helper {
    lines: Mutex<Vec<String>>,
}

#[async_trait]
impl BridgeHelper for Helper {
    async fn send(&self, command: &BridgeCommand) -> UbridgeResult<Vec<String>> {
        self.lines.lock().unwrap().push(command.to_string());
        Ok(Vec::new())
    }

    async fn shutdown(&self) -> UbridgeResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Launcher {
    helper: Arc<Helper>,
}

#[async_trait]
impl BridgeLauncher for Launcher {
    async fn launch(&self, _request: LaunchRequest<'_>) -> UbridgeResult<Arc<dyn BridgeHelper>> {
        Ok(self.helper.clone() as Arc<dyn BridgeHelper>)
    }
}

#[derive(Default)]
struct Engine {
    calls: Mutex<Vec<String>>,
}

impl Engine {
    fn record(&self, call: String) -> Result<(), ContainerEngineError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for Engine {
    async fn create(&self, request: &ContainerRequest) -> Result<String, ContainerEngineError> {
        self.record(format!("create {}", request.image))?;
        Ok("web1-container".to_string())
    }

    async fn start(&self, id: &str) -> Result<(), ContainerEngineError> {
        self.record(format!("start {id}"))
    }

    async fn stop(&self, id: &str) -> Result<(), ContainerEngineError> {
        self.record(format!("stop {id}"))
    }

    async fn pause(&self, id: &str) -> Result<(), ContainerEngineError> {
        self.record(format!("pause {id}"))
    }

    async fn unpause(&self, id: &str) -> Result<(), ContainerEngineError> {
        self.record(format!("unpause {id}"))
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerEngineError> {
        self.record(format!("remove {id}"))
    }

    async fn inspect_pid(&self, _id: &str) -> Result<u32, ContainerEngineError> {
        Ok(4321)
    }
}

fn compute(dir: &std::path::Path, launcher: Arc<Launcher>) -> Arc<ComputeContext> {
    ComputeContext::builder(ConfigLoader::defaults().unwrap())
        .projects_path(dir.join("projects"))
        .probe_ports(false)
        .launcher(launcher)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_container_wired_to_udp_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(Launcher::default());
    let compute = compute(dir.path(), launcher.clone());
    let engine = Arc::new(Engine::default());
    let manager = Manager::new(Docker::new(engine.clone()), compute.clone());
    let mut events = compute.notifications().queue();

    let project = Uuid::new_v4();
    let node = manager
        .create_node("web1", project, None, json!({"image": "nginx"}))
        .await
        .unwrap();
    let nio = manager
        .create_nio(&json!({"type": "nio_udp", "lport": 10001, "rhost": "127.0.0.1", "rport": 10002}))
        .await
        .unwrap();
    node.add_nio(0, 0, nio).await.unwrap();
    node.start().await.unwrap();
    assert_eq!(node.status().await, NodeStatus::Started);
    assert!(compute.ports().is_udp_allocated(10001));

    assert_eq!(
        *launcher.helper.lines.lock().unwrap(),
        [
            "bridge create bridge0",
            "bridge add_nio_tap bridge0 tap-nsim-e0",
            "docker move_to_ns tap-nsim-e0 4321 eth0",
            "bridge add_nio_udp bridge0 10001 127.0.0.1 10002",
            "bridge start bridge0",
        ]
    );

    node.stop().await.unwrap();
    assert!(!compute.ports().is_udp_allocated(10001));
    manager.delete_node(&node.id().to_string()).await.unwrap();

    assert_eq!(
        *engine.calls.lock().unwrap(),
        [
            "create nginx",
            "start web1-container",
            "stop web1-container",
            "remove web1-container",
        ]
    );

    let mut actions = Vec::new();
    while let Some(event) = events.try_get() {
        assert_eq!(event.metadata["project_id"], json!(project));
        actions.push(event.action);
    }
    assert_eq!(actions.first().map(String::as_str), Some("node.created"));
    assert_eq!(actions.last().map(String::as_str), Some("node.deleted"));
    assert!(actions.iter().any(|a| a == "node.updated"));
}

#[tokio::test]
async fn test_legacy_vpcs_node_migrates_once() {
    let dir = tempfile::tempdir().unwrap();
    let compute = compute(dir.path(), Arc::new(Launcher::default()));
    let manager = Manager::new(Vpcs, compute.clone());

    let project = Uuid::new_v4();
    let legacy = dir
        .path()
        .join("projects")
        .join(project.to_string())
        .join("project-files/vpcs/pc-5");
    fs::create_dir_all(&legacy).unwrap();
    fs::write(legacy.join("startup.vpc"), "ip 10.0.0.5/24\n").unwrap();

    let node = manager
        .create_node("PC1", project, Some("5"), json!({}))
        .await
        .unwrap();
    let workdir = node.working_dir().unwrap().to_path_buf();
    assert!(workdir.ends_with(format!("project-files/vpcs/{}", node.id())));
    assert!(!legacy.exists());
    assert_eq!(
        fs::read_to_string(workdir.join("startup.vpc")).unwrap(),
        "set pcname PC1\nip 10.0.0.5/24\n"
    );

    let id = node.id();
    manager.delete_node(&id.to_string()).await.unwrap();
    let again = manager
        .create_node("PC1", project, Some("5"), json!({}))
        .await
        .unwrap();
    assert_eq!(again.id(), id);
}

#[tokio::test]
async fn test_switch_rejects_unknown_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let compute = compute(dir.path(), Arc::new(Launcher::default()));
    let manager = Manager::new(EthernetSwitch, compute);

    let node = manager
        .create_node("SW1", Uuid::new_v4(), None, json!({"ports": 4}))
        .await
        .unwrap();
    assert!(node.working_dir().is_none());

    let err = manager.get_node(&node.id().to_string(), Some(Uuid::new_v4())).await.unwrap_err();
    assert!(matches!(err, ComputeError::NotFound(_)));
    assert_eq!(err.status_code(), 404);
}
