//! The generic node: lifecycle, NIO bindings and bridge wiring.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::adapter::{Adapter, PortBinding};
use super::driver::{Driver, DriverContext, InternalEndpoint, Started, Wiring};
use super::error::{BackendError, ProcessError};
use crate::compute::{ComputeContext, ComputeError, ComputeResult};
use crate::nio::{LinkType, Nio, NioFilters};
use crate::ports::PortError;
use crate::telemetry::AuditEvent;
use crate::ubridge::{Bridge, BridgeCommand, BridgeHelper, BridgeState, LaunchRequest};

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Backend not running.
    Stopped,
    /// Backend running and wired.
    Started,
    /// Backend paused; wiring kept.
    Suspended,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Stopped => "stopped",
            NodeStatus::Started => "started",
            NodeStatus::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Serializable view of a node, used as notification payload.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Node identifier.
    pub node_id: Uuid,
    /// Display name.
    pub name: String,
    /// Owning project.
    pub project_id: Uuid,
    /// Backend type.
    pub node_type: String,
    /// Lifecycle state.
    pub status: NodeStatus,
    /// Console TCP port.
    pub console: Option<u16>,
    /// Working directory.
    pub node_directory: Option<PathBuf>,
    /// Bound NIOs.
    pub adapters: Vec<PortBinding>,
}

/// Everything a manager decides before handing a node to its driver.
#[derive(Debug)]
pub struct NodeSpec {
    /// Node identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Owning project.
    pub project_id: Uuid,
    /// Backend type.
    pub node_type: &'static str,
    /// Working directory, for backends that have one.
    pub working_dir: Option<PathBuf>,
    /// Console TCP port already allocated for the node.
    pub console: Option<u16>,
    /// Provisioned adapters.
    pub adapters: Vec<Adapter>,
}

/// What exists only while the node is started.
struct Runtime {
    started: Started,
    helper: Option<Arc<dyn BridgeHelper>>,
    /// Bridges by adapter number.
    bridges: BTreeMap<u32, Bridge>,
}

struct NodeState {
    name: String,
    status: NodeStatus,
    adapters: Vec<Adapter>,
    console: Option<u16>,
    runtime: Option<Runtime>,
    /// NIO local ports reserved while started.
    held_ports: Vec<u16>,
    closed: bool,
}

impl NodeState {
    fn adapter_index(&self, number: u32) -> ComputeResult<usize> {
        self.adapters
            .iter()
            .position(|a| a.number() == number)
            .ok_or_else(|| {
                ComputeError::Validation(format!(
                    "Adapter {} doesn't exist on node {}",
                    number, self.name
                ))
            })
    }
}

fn bridge_name(adapter: u32) -> String {
    format!("bridge{adapter}")
}

/// Treat "already in the requested state" as success.
fn absorb(result: Result<(), BackendError>) -> Result<(), BackendError> {
    match result {
        Err(e) if e.is_no_op() => {
            debug!("Ignoring no-op backend error: {}", e);
            Ok(())
        }
        other => other,
    }
}

fn validate_capture_name(filename: &str) -> ComputeResult<()> {
    let path = Path::new(filename);
    let plain = path.components().count() == 1
        && matches!(path.components().next(), Some(std::path::Component::Normal(_)));
    if filename.is_empty() || !plain {
        return Err(ComputeError::Validation(format!(
            "Invalid capture file name '{filename}'"
        )));
    }
    Ok(())
}

/// A supervised device instance.
///
/// All mutation is serialized through an internal async mutex held for the
/// duration of each operation.
pub struct Node {
    id: Uuid,
    project_id: Uuid,
    node_type: &'static str,
    working_dir: Option<PathBuf>,
    driver: Box<dyn Driver>,
    compute: Arc<ComputeContext>,
    state: Mutex<NodeState>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("node_type", &self.node_type)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Assemble a node. The driver's `create` hook is run by [`Node::create`].
    pub fn new(spec: NodeSpec, driver: Box<dyn Driver>, compute: Arc<ComputeContext>) -> Self {
        Self {
            id: spec.id,
            project_id: spec.project_id,
            node_type: spec.node_type,
            working_dir: spec.working_dir,
            driver,
            compute,
            state: Mutex::new(NodeState {
                name: spec.name,
                status: NodeStatus::Stopped,
                adapters: spec.adapters,
                console: spec.console,
                runtime: None,
                held_ports: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Node identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Owning project.
    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    /// Backend type.
    pub fn node_type(&self) -> &'static str {
        self.node_type
    }

    /// Working directory, for backends that have one.
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Current display name.
    pub async fn name(&self) -> String {
        self.state.lock().await.name.clone()
    }

    /// Current lifecycle state.
    pub async fn status(&self) -> NodeStatus {
        self.state.lock().await.status
    }

    /// Console TCP port.
    pub async fn console(&self) -> Option<u16> {
        self.state.lock().await.console
    }

    /// Copy of the NIO bound to a slot.
    pub async fn nio(&self, adapter: u32, port: u32) -> Option<Nio> {
        let state = self.state.lock().await;
        let index = state.adapter_index(adapter).ok()?;
        state.adapters[index].nio(port).cloned()
    }

    /// Names of the bridges currently relaying, in adapter order.
    pub async fn bridges(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .runtime
            .as_ref()
            .map(|r| r.bridges.values().map(|b| b.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Serializable snapshot.
    pub async fn info(&self) -> NodeInfo {
        let state = self.state.lock().await;
        self.snapshot(&state)
    }

    fn snapshot(&self, state: &NodeState) -> NodeInfo {
        NodeInfo {
            node_id: self.id,
            name: state.name.clone(),
            project_id: self.project_id,
            node_type: self.node_type.to_string(),
            status: state.status,
            console: state.console,
            node_directory: self.working_dir.clone(),
            adapters: state
                .adapters
                .iter()
                .flat_map(|adapter| {
                    adapter.nios().map(|(port, nio)| PortBinding {
                        adapter_number: adapter.number(),
                        port_number: port,
                        nio: nio.clone(),
                    })
                })
                .collect(),
        }
    }

    fn context<'a>(
        &'a self,
        name: &'a str,
        console: Option<u16>,
        adapters: &'a [Adapter],
    ) -> DriverContext<'a> {
        DriverContext {
            node_id: self.id,
            name,
            project_id: self.project_id,
            working_dir: self.working_dir.as_deref(),
            console,
            adapters,
            compute: &self.compute,
        }
    }

    fn emit(&self, action: &str, state: &NodeState) {
        match serde_json::to_value(self.snapshot(state)) {
            Ok(event) => self
                .compute
                .notifications()
                .project_emit(action, event, self.project_id),
            Err(e) => warn!("Could not serialize node {}: {}", self.id, e),
        }
    }

    /// Log a backend failure, report it to listeners and wrap it.
    fn backend_failure(&self, name: &str, operation: &'static str, err: BackendError) -> ComputeError {
        if let BackendError::Unsupported { .. } = err {
            return ComputeError::Conflict(format!("{name}: {err}"));
        }
        error!(node_id = %self.id, node = name, operation, "Backend failure: {}", err);
        self.compute.notifications().project_emit(
            "log.error",
            json!({
                "node_id": self.id,
                "message": format!("{name}: {operation} failed: {err}"),
            }),
            self.project_id,
        );
        ComputeError::Backend {
            node: name.to_string(),
            operation,
            source: err,
        }
    }

    fn ensure_open(&self, state: &NodeState) -> ComputeResult<()> {
        if state.closed {
            return Err(ComputeError::Conflict(format!(
                "Node {} has been closed",
                state.name
            )));
        }
        Ok(())
    }

    fn link_owner(&self, adapter: u32) -> String {
        format!("{}:{}", self.id, bridge_name(adapter))
    }

    /// Reserve a NIO's local port for the project while the node runs.
    ///
    /// Returns whether the port was free in the pool before.
    fn hold_port(&self, held: &mut Vec<u16>, lport: u16) -> ComputeResult<bool> {
        let fresh = !self.compute.ports().is_udp_allocated(lport);
        match self.compute.ports().reserve_udp_port(lport, self.project_id) {
            Ok(()) => {
                if !held.contains(&lport) {
                    held.push(lport);
                }
                Ok(fresh)
            }
            Err(PortError::OutOfRange { .. }) => {
                debug!("UDP port {} is outside the managed range", lport);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Free a NIO's local port, whether or not the node holds it.
    fn release_port(&self, held: &mut Vec<u16>, lport: u16) {
        held.retain(|p| *p != lport);
        self.compute.ports().release_udp_port(lport, self.project_id);
    }

    fn release_all_ports(&self, held: &mut Vec<u16>) {
        for lport in held.drain(..) {
            self.compute.ports().release_udp_port(lport, self.project_id);
        }
    }

    fn release_claim(&self, nio: &Nio, adapter: u32) {
        if let Some(key) = nio.key() {
            self.compute.links().release(&key, &self.link_owner(adapter));
        }
    }

    /// Drop the link claim and local port of every bound NIO.
    fn release_bindings(&self, state: &mut NodeState) {
        for adapter in &state.adapters {
            for (_, nio) in adapter.nios() {
                self.release_claim(nio, adapter.number());
                if let Some(lport) = nio.lport() {
                    self.release_port(&mut state.held_ports, lport);
                }
            }
        }
    }

    fn helper_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(|| {
                self.compute
                    .projects()
                    .get(self.project_id)
                    .ok()
                    .map(|p| p.path().to_path_buf())
            })
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Run the driver's creation hook.
    pub async fn create(&self) -> ComputeResult<()> {
        let state = self.state.lock().await;
        let result = self
            .driver
            .create(self.context(&state.name, state.console, &state.adapters))
            .await;
        result.map_err(|e| self.backend_failure(&state.name, "create", e))?;
        info!(node_id = %self.id, node = %state.name, "Node {} created", self.node_type);
        Ok(())
    }

    /// Start the backend and wire every bound NIO.
    ///
    /// Starting a started node is a no-op; starting a suspended node resumes
    /// it. If wiring fails the backend is stopped again and nothing stays
    /// allocated.
    pub async fn start(&self) -> ComputeResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.ensure_open(state)?;
        match state.status {
            NodeStatus::Started => return Ok(()),
            NodeStatus::Suspended => return self.resume_locked(state).await,
            NodeStatus::Stopped => {}
        }

        let lports: Vec<u16> = state
            .adapters
            .iter()
            .flat_map(|a| a.nios().filter_map(|(_, nio)| nio.lport()))
            .collect();
        let mut held = Vec::new();
        for lport in lports {
            if let Err(e) = self.hold_port(&mut held, lport) {
                self.release_all_ports(&mut held);
                return Err(e);
            }
        }
        state.held_ports = held;

        let result = self
            .driver
            .start(self.context(&state.name, state.console, &state.adapters))
            .await;
        let started = match result {
            Ok(started) => started,
            Err(BackendError::Process(ProcessError::AlreadyRunning { pid })) => {
                Started { pid: Some(pid) }
            }
            Err(e) if e.is_no_op() => Started::default(),
            Err(e) => {
                self.release_all_ports(&mut state.held_ports);
                return Err(self.backend_failure(&state.name, "start", e));
            }
        };

        let mut runtime = Runtime {
            started,
            helper: None,
            bridges: BTreeMap::new(),
        };
        let wired = match self.driver.wiring() {
            Wiring::Bridged => self.wire_bridges(&state.adapters, &mut runtime).await,
            Wiring::Direct => {
                let result = self
                    .attach_direct(self.context(&state.name, state.console, &state.adapters))
                    .await;
                result.map_err(|e| self.backend_failure(&state.name, "attach_nio", e))
            }
        };
        if let Err(e) = wired {
            error!(node_id = %self.id, node = %state.name, "Start aborted: {}", e);
            if let Err(stop_err) = self.teardown(state, Some(runtime)).await {
                warn!(node_id = %self.id, "Cleanup after failed start: {}", stop_err);
            }
            return Err(e);
        }

        let pid = runtime.started.pid;
        state.runtime = Some(runtime);
        state.status = NodeStatus::Started;
        info!(node_id = %self.id, node = %state.name, "Node started");
        self.compute.audit().log(AuditEvent::NodeStart {
            node_id: self.id,
            name: state.name.clone(),
            pid,
        });
        self.emit("node.updated", state);
        Ok(())
    }

    async fn wire_bridges(&self, adapters: &[Adapter], runtime: &mut Runtime) -> ComputeResult<()> {
        let endpoints: Vec<(u32, InternalEndpoint)> = adapters
            .iter()
            .filter_map(|a| {
                self.driver
                    .endpoint(a.number(), &runtime.started)
                    .map(|e| (a.number(), e))
            })
            .collect();
        if endpoints.is_empty() {
            return Ok(());
        }

        let working_dir = self.helper_dir();
        let helper = self
            .compute
            .launcher()
            .launch(LaunchRequest {
                node_id: self.id,
                project_id: self.project_id,
                working_dir: &working_dir,
            })
            .await?;
        runtime.helper = Some(Arc::clone(&helper));

        for (number, endpoint) in endpoints {
            let bridge = Bridge::create(helper.as_ref(), bridge_name(number)).await?;
            let bridge = runtime.bridges.entry(number).or_insert(bridge);
            self.attach_endpoint(helper.as_ref(), bridge, &endpoint).await?;
            let nio = adapters
                .iter()
                .find(|a| a.number() == number)
                .and_then(|a| a.nio(0));
            if let Some(nio) = nio {
                Self::relay_nio(helper.as_ref(), bridge, nio).await?;
            }
        }
        Ok(())
    }

    async fn attach_endpoint(
        &self,
        helper: &dyn BridgeHelper,
        bridge: &mut Bridge,
        endpoint: &InternalEndpoint,
    ) -> ComputeResult<()> {
        match endpoint {
            InternalEndpoint::Udp {
                lport,
                rhost,
                rport,
            } => {
                bridge
                    .add_nio(helper, &Nio::udp(*lport, rhost.clone(), *rport))
                    .await?
            }
            InternalEndpoint::Tap { device } => bridge.add_tap(helper, device).await?,
            InternalEndpoint::Namespace { tap, pid, ifname } => {
                bridge.add_tap(helper, tap).await?;
                helper
                    .send(&BridgeCommand::MoveToNs {
                        tap: tap.clone(),
                        pid: *pid,
                        ifname: ifname.clone(),
                    })
                    .await?;
                debug!(node_id = %self.id, "Moved {} into PID {} as {}", tap, pid, ifname);
            }
        }
        Ok(())
    }

    async fn relay_nio(helper: &dyn BridgeHelper, bridge: &mut Bridge, nio: &Nio) -> ComputeResult<()> {
        bridge.add_nio(helper, nio).await?;
        if !nio.filters().is_empty() {
            bridge.apply_filters(helper, nio).await?;
        }
        if nio.is_suspended() {
            return Ok(());
        }
        bridge.start(helper).await?;
        if let Some(capture) = nio.capture() {
            bridge
                .start_capture(helper, &capture.path, capture.link_type)
                .await?;
        }
        Ok(())
    }

    async fn attach_direct(&self, ctx: DriverContext<'_>) -> Result<(), BackendError> {
        for adapter in ctx.adapters {
            for (port, nio) in adapter.nios() {
                self.driver
                    .attach_nio(ctx, adapter.number(), port, nio)
                    .await?;
                if let Some(capture) = nio.capture() {
                    self.driver
                        .capture_start(ctx, adapter.number(), port, &capture.path, capture.link_type)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Delete bridges, stop the helper and the backend, release held ports.
    ///
    /// Link claims stay with the bindings.
    async fn teardown(&self, state: &mut NodeState, runtime: Option<Runtime>) -> ComputeResult<()> {
        if let Some(mut runtime) = runtime {
            if let Some(helper) = runtime.helper.take() {
                for bridge in runtime.bridges.values_mut() {
                    if let Err(e) = bridge.delete(helper.as_ref()).await {
                        warn!(node_id = %self.id, "Could not delete {}: {}", bridge.name(), e);
                    }
                }
                if let Err(e) = helper.shutdown().await {
                    warn!(node_id = %self.id, "Bridge helper shutdown failed: {}", e);
                }
            }
        }
        let result = self
            .driver
            .stop(self.context(&state.name, state.console, &state.adapters))
            .await;
        self.release_all_ports(&mut state.held_ports);
        absorb(result).map_err(|e| self.backend_failure(&state.name, "stop", e))
    }

    /// Tear down wiring and stop the backend. Stopping a stopped node is a
    /// no-op.
    pub async fn stop(&self) -> ComputeResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.ensure_open(state)?;
        self.stop_locked(state).await
    }

    async fn stop_locked(&self, state: &mut NodeState) -> ComputeResult<()> {
        if state.status == NodeStatus::Stopped && state.runtime.is_none() {
            return Ok(());
        }
        let runtime = state.runtime.take();
        self.teardown(state, runtime).await?;
        state.status = NodeStatus::Stopped;
        info!(node_id = %self.id, node = %state.name, "Node stopped");
        self.compute.audit().log(AuditEvent::NodeStop {
            node_id: self.id,
            name: state.name.clone(),
        });
        self.emit("node.updated", state);
        Ok(())
    }

    /// Pause the backend, keeping its wiring.
    pub async fn suspend(&self) -> ComputeResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.ensure_open(state)?;
        match state.status {
            NodeStatus::Suspended => return Ok(()),
            NodeStatus::Stopped => {
                return Err(ComputeError::Conflict(format!(
                    "Node {} is not started",
                    state.name
                )));
            }
            NodeStatus::Started => {}
        }
        let result = self
            .driver
            .suspend(self.context(&state.name, state.console, &state.adapters))
            .await;
        absorb(result).map_err(|e| self.backend_failure(&state.name, "suspend", e))?;
        state.status = NodeStatus::Suspended;
        info!(node_id = %self.id, node = %state.name, "Node suspended");
        self.emit("node.updated", state);
        Ok(())
    }

    /// Resume a suspended backend.
    pub async fn resume(&self) -> ComputeResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.ensure_open(state)?;
        match state.status {
            NodeStatus::Started => Ok(()),
            NodeStatus::Stopped => Err(ComputeError::Conflict(format!(
                "Node {} is not suspended",
                state.name
            ))),
            NodeStatus::Suspended => self.resume_locked(state).await,
        }
    }

    async fn resume_locked(&self, state: &mut NodeState) -> ComputeResult<()> {
        let result = self
            .driver
            .resume(self.context(&state.name, state.console, &state.adapters))
            .await;
        absorb(result).map_err(|e| self.backend_failure(&state.name, "resume", e))?;
        state.status = NodeStatus::Started;
        info!(node_id = %self.id, node = %state.name, "Node resumed");
        self.emit("node.updated", state);
        Ok(())
    }

    /// Bind a NIO to an adapter slot, wiring it immediately when started.
    ///
    /// The link is claimed for this node at bind time, so a NIO already
    /// bound elsewhere is refused even while both nodes are stopped.
    pub async fn add_nio(&self, adapter: u32, port: u32, nio: Nio) -> ComputeResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.ensure_open(state)?;
        let index = state.adapter_index(adapter)?;
        state.adapters[index].check_port(port)?;
        if let Some(existing) = state.adapters[index].nio(port) {
            return Err(ComputeError::Conflict(format!(
                "Adapter {adapter} port {port} is already connected to {existing}"
            )));
        }

        self.compute.links().claim(&nio, &self.link_owner(adapter))?;
        if let Some(runtime) = state.runtime.as_mut() {
            let mut fresh = false;
            if let Some(lport) = nio.lport() {
                match self.hold_port(&mut state.held_ports, lport) {
                    Ok(was_free) => fresh = was_free,
                    Err(e) => {
                        self.release_claim(&nio, adapter);
                        return Err(e);
                    }
                }
            }
            let wired = match self.driver.wiring() {
                Wiring::Bridged => match (runtime.helper.clone(), runtime.bridges.get_mut(&adapter)) {
                    (Some(helper), Some(bridge)) => {
                        Self::relay_nio(helper.as_ref(), bridge, &nio).await
                    }
                    _ => Ok(()),
                },
                Wiring::Direct => {
                    let result = self
                        .driver
                        .attach_nio(
                            self.context(&state.name, state.console, &state.adapters),
                            adapter,
                            port,
                            &nio,
                        )
                        .await;
                    result.map_err(|e| self.backend_failure(&state.name, "attach_nio", e))
                }
            };
            if let Err(e) = wired {
                if let Some(lport) = nio.lport() {
                    if fresh {
                        self.release_port(&mut state.held_ports, lport);
                    } else {
                        state.held_ports.retain(|p| *p != lport);
                    }
                }
                self.release_claim(&nio, adapter);
                return Err(e);
            }
        }

        info!(node_id = %self.id, node = %state.name, "Adapter {} port {} connected to {}", adapter, port, nio);
        self.compute.audit().log(AuditEvent::NioBind {
            node_id: self.id,
            adapter,
            port,
            nio: nio.to_string(),
        });
        state.adapters[index].bind(port, nio)?;
        self.emit("node.updated", state);
        Ok(())
    }

    /// Unbind the NIO of a slot and return it.
    ///
    /// The link claim and the NIO's local port are released whether or not
    /// the node is running.
    pub async fn remove_nio(&self, adapter: u32, port: u32) -> ComputeResult<Nio> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.ensure_open(state)?;
        let index = state.adapter_index(adapter)?;
        state.adapters[index].check_port(port)?;
        let Some(nio) = state.adapters[index].nio(port).cloned() else {
            return Err(ComputeError::Conflict(format!(
                "Adapter {adapter} port {port} is not connected"
            )));
        };

        if let Some(runtime) = state.runtime.as_mut() {
            match self.driver.wiring() {
                Wiring::Bridged => {
                    if let Some(helper) = runtime.helper.clone() {
                        self.disconnect_nio(helper.as_ref(), runtime, adapter, &nio)
                            .await?;
                    }
                }
                Wiring::Direct => {
                    let ctx = self.context(&state.name, state.console, &state.adapters);
                    let mut result = Ok(());
                    if nio.is_capturing() {
                        result = absorb(self.driver.capture_stop(ctx, adapter, port).await);
                    }
                    if result.is_ok() {
                        result = absorb(self.driver.detach_nio(ctx, adapter, port).await);
                    }
                    result.map_err(|e| self.backend_failure(&state.name, "detach_nio", e))?;
                }
            }
        }
        if let Some(lport) = nio.lport() {
            self.release_port(&mut state.held_ports, lport);
        }
        self.release_claim(&nio, adapter);

        let mut nio = state.adapters[index].unbind(port).unwrap_or(nio);
        nio.stop_capture();
        info!(node_id = %self.id, node = %state.name, "Adapter {} port {} disconnected from {}", adapter, port, nio);
        self.compute.audit().log(AuditEvent::NioUnbind {
            node_id: self.id,
            adapter,
            port,
        });
        self.emit("node.updated", state);
        Ok(nio)
    }

    async fn disconnect_nio(
        &self,
        helper: &dyn BridgeHelper,
        runtime: &mut Runtime,
        adapter: u32,
        nio: &Nio,
    ) -> ComputeResult<()> {
        let Some(bridge) = runtime.bridges.get_mut(&adapter) else {
            return Ok(());
        };
        bridge.stop_capture(helper).await?;
        let removed = bridge.remove_nio(helper, nio).await?;
        if removed {
            return Ok(());
        }

        // Host devices can only be detached by recreating the bridge.
        bridge.delete(helper).await?;
        runtime.bridges.remove(&adapter);
        if let Some(endpoint) = self.driver.endpoint(adapter, &runtime.started) {
            let mut bridge = Bridge::create(helper, bridge_name(adapter)).await?;
            self.attach_endpoint(helper, &mut bridge, &endpoint).await?;
            runtime.bridges.insert(adapter, bridge);
        }
        Ok(())
    }

    /// Replace the filters and suspend flag of a bound NIO, applying them
    /// live when started.
    pub async fn update_nio(
        &self,
        adapter: u32,
        port: u32,
        filters: NioFilters,
        suspend: bool,
    ) -> ComputeResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.ensure_open(state)?;
        let index = state.adapter_index(adapter)?;
        state.adapters[index].check_port(port)?;
        let nio = {
            let Some(nio) = state.adapters[index].nio_mut(port) else {
                return Err(ComputeError::Conflict(format!(
                    "Adapter {adapter} port {port} is not connected"
                )));
            };
            nio.set_filters(filters);
            nio.set_suspended(suspend);
            nio.clone()
        };

        if let Some(runtime) = state.runtime.as_mut() {
            match self.driver.wiring() {
                Wiring::Bridged => {
                    if let (Some(helper), Some(bridge)) =
                        (runtime.helper.clone(), runtime.bridges.get_mut(&adapter))
                    {
                        let helper = helper.as_ref();
                        bridge.apply_filters(helper, &nio).await?;
                        if nio.is_suspended() {
                            bridge.stop(helper).await?;
                        } else {
                            bridge.start(helper).await?;
                            if let Some(capture) = nio.capture()
                                && bridge.capture().is_none()
                            {
                                bridge
                                    .start_capture(helper, &capture.path, capture.link_type)
                                    .await?;
                            }
                        }
                    }
                }
                Wiring::Direct => {
                    let result = self
                        .driver
                        .update_nio(
                            self.context(&state.name, state.console, &state.adapters),
                            adapter,
                            port,
                            &nio,
                        )
                        .await;
                    result.map_err(|e| self.backend_failure(&state.name, "update_nio", e))?;
                }
            }
        }
        debug!(node_id = %self.id, "Updated NIO on adapter {} port {}", adapter, port);
        self.emit("node.updated", state);
        Ok(())
    }

    /// Start capturing a link into `<project>/project-files/captures/<filename>`.
    ///
    /// On a stopped node the capture is recorded and begins at start.
    pub async fn capture_start(
        &self,
        adapter: u32,
        port: u32,
        filename: &str,
        link_type: LinkType,
    ) -> ComputeResult<PathBuf> {
        validate_capture_name(filename)?;
        let captures = self.compute.projects().get(self.project_id)?.captures_dir();
        tokio::fs::create_dir_all(&captures).await?;
        let path = captures.join(filename);

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.ensure_open(state)?;
        let index = state.adapter_index(adapter)?;
        state.adapters[index].check_port(port)?;
        match state.adapters[index].nio_mut(port) {
            Some(nio) => nio.start_capture(&path, link_type)?,
            None => {
                return Err(ComputeError::Conflict(format!(
                    "Adapter {adapter} port {port} is not connected"
                )));
            }
        }

        if let Some(runtime) = state.runtime.as_mut() {
            let result = match self.driver.wiring() {
                Wiring::Bridged => {
                    match (runtime.helper.clone(), runtime.bridges.get_mut(&adapter)) {
                        (Some(helper), Some(bridge)) if bridge.state() == BridgeState::Started => bridge
                            .start_capture(helper.as_ref(), &path, link_type)
                            .await
                            .map_err(ComputeError::from),
                        _ => Ok(()),
                    }
                }
                Wiring::Direct => {
                    let result = self
                        .driver
                        .capture_start(
                            self.context(&state.name, state.console, &state.adapters),
                            adapter,
                            port,
                            &path,
                            link_type,
                        )
                        .await;
                    result.map_err(|e| self.backend_failure(&state.name, "capture_start", e))
                }
            };
            if let Err(e) = result {
                if let Some(nio) = state.adapters[index].nio_mut(port) {
                    nio.stop_capture();
                }
                return Err(e);
            }
        }

        info!(node_id = %self.id, node = %state.name, "Capturing adapter {} port {} to {}", adapter, port, path.display());
        self.compute.audit().log(AuditEvent::CaptureStart {
            node_id: self.id,
            adapter,
            path: path.display().to_string(),
        });
        Ok(path)
    }

    /// Stop capturing a link. No-op when not capturing.
    pub async fn capture_stop(&self, adapter: u32, port: u32) -> ComputeResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.ensure_open(state)?;
        let index = state.adapter_index(adapter)?;
        state.adapters[index].check_port(port)?;
        let capturing = match state.adapters[index].nio(port) {
            Some(nio) => nio.is_capturing(),
            None => {
                return Err(ComputeError::Conflict(format!(
                    "Adapter {adapter} port {port} is not connected"
                )));
            }
        };
        if !capturing {
            return Ok(());
        }

        if let Some(runtime) = state.runtime.as_mut() {
            match self.driver.wiring() {
                Wiring::Bridged => {
                    if let (Some(helper), Some(bridge)) =
                        (runtime.helper.clone(), runtime.bridges.get_mut(&adapter))
                    {
                        bridge.stop_capture(helper.as_ref()).await?;
                    }
                }
                Wiring::Direct => {
                    let result = self
                        .driver
                        .capture_stop(
                            self.context(&state.name, state.console, &state.adapters),
                            adapter,
                            port,
                        )
                        .await;
                    absorb(result)
                        .map_err(|e| self.backend_failure(&state.name, "capture_stop", e))?;
                }
            }
        }
        if let Some(nio) = state.adapters[index].nio_mut(port) {
            nio.stop_capture();
        }
        info!(node_id = %self.id, node = %state.name, "Stopped capture on adapter {} port {}", adapter, port);
        self.compute.audit().log(AuditEvent::CaptureStop {
            node_id: self.id,
            adapter,
        });
        Ok(())
    }

    /// Change the display name and regenerate name-derived configuration.
    pub async fn rename(&self, new_name: &str) -> ComputeResult<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(ComputeError::Validation(
                "Node name cannot be empty".to_string(),
            ));
        }
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.ensure_open(state)?;
        let old = std::mem::replace(&mut state.name, new_name.to_string());
        info!(node_id = %self.id, "Renamed node {} to {}", old, state.name);
        self.regenerate_locked(state).await?;
        self.emit("node.updated", state);
        Ok(())
    }

    /// Rewrite files derived from the node's name or settings.
    pub async fn regenerate_configuration(&self) -> ComputeResult<()> {
        let guard = self.state.lock().await;
        self.ensure_open(&guard)?;
        self.regenerate_locked(&guard).await
    }

    async fn regenerate_locked(&self, state: &NodeState) -> ComputeResult<()> {
        let result = self
            .driver
            .regenerate_configuration(self.context(&state.name, state.console, &state.adapters))
            .await;
        result.map_err(|e| self.backend_failure(&state.name, "regenerate_configuration", e))
    }

    /// Stop the node and release everything it holds. Closing twice is a
    /// no-op.
    ///
    /// Resources are released even when stopping fails; the first failure is
    /// returned.
    pub async fn close(&self) -> ComputeResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Ok(());
        }
        let mut first_error = None;
        if let Err(e) = self.stop_locked(state).await {
            warn!(node_id = %self.id, "Stop during close failed: {}", e);
            first_error = Some(e);
        }

        let result = self
            .driver
            .close(self.context(&state.name, state.console, &state.adapters))
            .await;
        if let Err(e) = absorb(result) {
            let e = self.backend_failure(&state.name, "close", e);
            first_error.get_or_insert(e);
        }

        if let Some(console) = state.console.take() {
            self.compute.ports().release_tcp_port(console, self.project_id);
        }
        self.release_bindings(state);
        for adapter in &mut state.adapters {
            adapter.clear();
        }
        self.release_all_ports(&mut state.held_ports);
        state.closed = true;
        info!(node_id = %self.id, node = %state.name, "Node closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Whether the node has been closed.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{compute, FakeDriver, RecordingLauncher};

    async fn node_with(
        driver: FakeDriver,
        launcher: Arc<RecordingLauncher>,
        dir: &Path,
    ) -> (Node, Arc<ComputeContext>) {
        let compute = compute(dir, launcher);
        let project_id = Uuid::new_v4();
        compute.projects().get_or_create(project_id).unwrap();
        let node = Node::new(
            NodeSpec {
                id: Uuid::new_v4(),
                name: "web1".to_string(),
                project_id,
                node_type: "fake",
                working_dir: Some(dir.to_path_buf()),
                console: None,
                adapters: vec![Adapter::new(0)],
            },
            Box::new(driver),
            Arc::clone(&compute),
        );
        node.create().await.unwrap();
        (node, compute)
    }

    #[tokio::test]
    async fn test_bridged_start_stop_commands() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let (node, compute) =
            node_with(FakeDriver::namespace(4242), Arc::clone(&launcher), dir.path()).await;

        node.add_nio(0, 0, Nio::udp(10001, "127.0.0.1", 10002))
            .await
            .unwrap();
        node.start().await.unwrap();
        assert_eq!(node.status().await, NodeStatus::Started);
        assert_eq!(node.bridges().await, vec!["bridge0".to_string()]);
        assert!(compute.ports().is_udp_allocated(10001));

        node.stop().await.unwrap();
        assert!(!compute.ports().is_udp_allocated(10001));
        assert!(node.bridges().await.is_empty());

        assert_eq!(
            launcher.helper.lines(),
            vec![
                "bridge create bridge0",
                "bridge add_nio_tap bridge0 tap-fake-e0",
                "docker move_to_ns tap-fake-e0 4242 eth0",
                "bridge add_nio_udp bridge0 10001 127.0.0.1 10002",
                "bridge start bridge0",
                "bridge stop bridge0",
                "bridge delete bridge0",
            ]
        );
        assert_eq!(launcher.helper.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_unbind_while_stopped_frees_port() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let (node, compute) = node_with(FakeDriver::udp_tunnel(), launcher, dir.path()).await;

        let lport = compute.ports().allocate_udp_port(node.project_id()).unwrap();
        node.add_nio(0, 0, Nio::udp(lport, "127.0.0.1", lport + 1))
            .await
            .unwrap();
        assert!(compute.ports().is_udp_allocated(lport));

        node.remove_nio(0, 0).await.unwrap();
        assert!(!compute.ports().is_udp_allocated(lport));
        assert_eq!(compute.links().holder(&format!("udp:{lport}")), None);
    }

    #[tokio::test]
    async fn test_close_frees_bound_ports() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let (node, compute) = node_with(FakeDriver::udp_tunnel(), launcher, dir.path()).await;

        let lport = compute.ports().allocate_udp_port(node.project_id()).unwrap();
        node.add_nio(0, 0, Nio::udp(lport, "127.0.0.1", lport + 1))
            .await
            .unwrap();

        node.close().await.unwrap();
        assert!(!compute.ports().is_udp_allocated(lport));
        assert_eq!(compute.links().holder(&format!("udp:{lport}")), None);
    }

    #[tokio::test]
    async fn test_namespace_failure_aborts_start() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        launcher.helper.fail_namespace_moves();
        let driver = FakeDriver::namespace(4242);
        let stops = driver.stops();
        let (node, compute) = node_with(driver, Arc::clone(&launcher), dir.path()).await;
        node.add_nio(0, 0, Nio::udp(10001, "127.0.0.1", 10002))
            .await
            .unwrap();

        let err = node.start().await.unwrap_err();
        assert!(matches!(err, ComputeError::UbridgeNamespace { pid: 4242, .. }));
        assert_eq!(node.status().await, NodeStatus::Stopped);
        assert_eq!(stops.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!compute.ports().is_udp_allocated(10001));
        assert_eq!(launcher.helper.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_add_nio_while_started_wires_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let (node, _compute) =
            node_with(FakeDriver::udp_tunnel(), Arc::clone(&launcher), dir.path()).await;

        node.start().await.unwrap();
        node.add_nio(0, 0, Nio::udp(10001, "127.0.0.1", 10002))
            .await
            .unwrap();
        let lines = launcher.helper.lines();
        assert_eq!(
            lines[lines.len() - 2..],
            [
                "bridge add_nio_udp bridge0 10001 127.0.0.1 10002".to_string(),
                "bridge start bridge0".to_string(),
            ]
        );

        let removed = node.remove_nio(0, 0).await.unwrap();
        assert_eq!(removed.lport(), Some(10001));
        assert_eq!(
            launcher.helper.lines().last().unwrap(),
            "bridge remove_nio_udp bridge0 10001 127.0.0.1 10002"
        );
    }

    #[tokio::test]
    async fn test_same_nio_on_two_nodes_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let compute = compute(dir.path(), launcher);
        let project_id = Uuid::new_v4();
        compute.projects().get_or_create(project_id).unwrap();
        let make = |name: &str| {
            Node::new(
                NodeSpec {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    project_id,
                    node_type: "fake",
                    working_dir: None,
                    console: None,
                    adapters: vec![Adapter::new(0)],
                },
                Box::new(FakeDriver::udp_tunnel()),
                Arc::clone(&compute),
            )
        };
        let (a, b) = (make("a"), make("b"));
        a.start().await.unwrap();
        b.start().await.unwrap();

        let nio = Nio::udp(10001, "127.0.0.1", 10002);
        a.add_nio(0, 0, nio.clone()).await.unwrap();
        let err = b.add_nio(0, 0, nio).await.unwrap_err();
        assert!(matches!(err, ComputeError::Conflict(_)));
        assert!(b.nio(0, 0).await.is_none());
    }

    #[tokio::test]
    async fn test_shared_link_refused_while_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let compute = compute(dir.path(), launcher);
        let project_id = Uuid::new_v4();
        compute.projects().get_or_create(project_id).unwrap();
        let make = |name: &str| {
            Node::new(
                NodeSpec {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    project_id,
                    node_type: "fake",
                    working_dir: None,
                    console: None,
                    adapters: vec![Adapter::new(0)],
                },
                Box::new(FakeDriver::udp_tunnel()),
                Arc::clone(&compute),
            )
        };
        let (a, b) = (make("a"), make("b"));

        a.add_nio(0, 0, Nio::tap("tap-shared")).await.unwrap();
        let err = b.add_nio(0, 0, Nio::tap("tap-shared")).await.unwrap_err();
        assert!(matches!(err, ComputeError::Conflict(_)));
        assert!(b.nio(0, 0).await.is_none());

        a.remove_nio(0, 0).await.unwrap();
        b.add_nio(0, 0, Nio::tap("tap-shared")).await.unwrap();
        assert_eq!(
            compute.links().holder("tap:tap-shared"),
            Some(format!("{}:bridge0", b.id()))
        );
    }

    #[tokio::test]
    async fn test_capture_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let (node, _compute) =
            node_with(FakeDriver::udp_tunnel(), Arc::clone(&launcher), dir.path()).await;
        node.add_nio(0, 0, Nio::udp(10001, "127.0.0.1", 10002))
            .await
            .unwrap();

        assert!(matches!(
            node.capture_start(0, 0, "../escape.pcap", LinkType::En10mb).await,
            Err(ComputeError::Validation(_))
        ));

        // Recorded while stopped, applied at start.
        let path = node
            .capture_start(0, 0, "web1.pcap", LinkType::En10mb)
            .await
            .unwrap();
        assert!(path.ends_with("project-files/captures/web1.pcap"));
        assert!(matches!(
            node.capture_start(0, 0, "web1.pcap", LinkType::En10mb).await,
            Err(ComputeError::Conflict(_))
        ));

        node.start().await.unwrap();
        assert!(launcher
            .helper
            .lines()
            .iter()
            .any(|l| l.starts_with("bridge start_capture bridge0")));

        node.capture_stop(0, 0).await.unwrap();
        node.capture_stop(0, 0).await.unwrap();
        assert!(!node.nio(0, 0).await.unwrap().is_capturing());
    }

    #[tokio::test]
    async fn test_suspend_unsupported_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let (node, _compute) = node_with(FakeDriver::udp_tunnel(), launcher, dir.path()).await;

        assert!(matches!(node.suspend().await, Err(ComputeError::Conflict(_))));
        node.start().await.unwrap();
        assert!(matches!(node.suspend().await, Err(ComputeError::Conflict(_))));
        assert_eq!(node.status().await, NodeStatus::Started);
    }

    #[tokio::test]
    async fn test_backend_failure_emits_log_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let driver = FakeDriver::udp_tunnel();
        driver.fail_next_start();
        let (node, compute) = node_with(driver, launcher, dir.path()).await;
        let mut queue = compute.notifications().queue();

        let err = node.start().await.unwrap_err();
        assert!(matches!(err, ComputeError::Backend { operation: "start", .. }));
        assert_eq!(err.status_code(), 502);

        let event = queue.get(std::time::Duration::from_secs(1)).await;
        assert_eq!(event.action, "log.error");
        assert_eq!(event.event["node_id"], json!(node.id()));
    }

    #[tokio::test]
    async fn test_update_nio_applies_filters_live() {
        use crate::nio::NioFilter;

        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let (node, _compute) =
            node_with(FakeDriver::udp_tunnel(), Arc::clone(&launcher), dir.path()).await;
        node.add_nio(0, 0, Nio::udp(10001, "127.0.0.1", 10002))
            .await
            .unwrap();
        node.start().await.unwrap();

        let filters = NioFilters::from(vec![NioFilter::new("delay", vec![json!(50), json!(10)])]);
        node.update_nio(0, 0, filters, true).await.unwrap();

        let lines = launcher.helper.lines();
        assert_eq!(
            lines[lines.len() - 3..],
            [
                "bridge reset_packet_filters bridge0".to_string(),
                "bridge add_packet_filter bridge0 filter0 delay 50 10".to_string(),
                "bridge stop bridge0".to_string(),
            ]
        );
        assert!(node.nio(0, 0).await.unwrap().is_suspended());
    }

    #[tokio::test]
    async fn test_close_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let (node, _compute) = node_with(FakeDriver::udp_tunnel(), launcher, dir.path()).await;
        node.add_nio(0, 0, Nio::null()).await.unwrap();
        node.start().await.unwrap();

        node.close().await.unwrap();
        node.close().await.unwrap();
        assert!(node.is_closed().await);
        assert_eq!(node.status().await, NodeStatus::Stopped);
        assert!(node.nio(0, 0).await.is_none());
        assert!(matches!(node.start().await, Err(ComputeError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_rename_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let driver = FakeDriver::udp_tunnel();
        let regenerated = driver.regenerated();
        let (node, _compute) = node_with(driver, launcher, dir.path()).await;

        node.rename("PC2").await.unwrap();
        assert_eq!(node.name().await, "PC2");
        assert_eq!(regenerated.lock().unwrap().as_slice(), ["PC2".to_string()]);
        assert!(matches!(node.rename("  ").await, Err(ComputeError::Validation(_))));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(NodeStatus::Suspended).unwrap(), json!("suspended"));
    }
}
