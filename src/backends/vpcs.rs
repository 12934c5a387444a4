//! Virtual PC Simulator nodes.
//!
//! Each node runs one `vpcs` process in its working directory. The process
//! serves its console on the node's console port and exchanges frames with
//! the bridge helper over a local UDP tunnel allocated with the node.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compute::{ComputeContext, ComputeResult};
use crate::manager::Backend;
use crate::node::{
    Adapter, BackendError, Driver, DriverContext, InternalEndpoint, NodeSpec, ProcessError,
    Started, Wiring,
};

/// Startup script run by every VPCS instance.
pub const STARTUP_SCRIPT: &str = "startup.vpc";

const LOG_FILE: &str = "vpcs.log";
const PCNAME_COMMAND: &str = "set pcname";
const TUNNEL_HOST: &str = "127.0.0.1";
const STARTUP_GRACE: Duration = Duration::from_millis(250);
const STOP_GRACE: Duration = Duration::from_secs(3);

/// VPCS node settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VpcsParams {
    /// Initial startup script contents. The `set pcname` line is managed.
    pub startup_script: Option<String>,
}

/// The `vpcs` backend.
#[derive(Debug, Default)]
pub struct Vpcs;

impl Backend for Vpcs {
    const NAME: &'static str = "vpcs";
    const HAS_CONSOLE: bool = true;
    type Params = VpcsParams;

    fn legacy_workdir(&self, legacy_id: u64) -> Option<PathBuf> {
        Some(PathBuf::from(format!("vpcs/pc-{legacy_id}")))
    }

    fn adapters(&self, _params: &VpcsParams) -> ComputeResult<Vec<Adapter>> {
        Ok(vec![Adapter::new(0)])
    }

    fn driver(
        &self,
        spec: &NodeSpec,
        params: VpcsParams,
        compute: &Arc<ComputeContext>,
    ) -> ComputeResult<Box<dyn Driver>> {
        let ports = compute.ports();
        let vpcs_port = ports.allocate_udp_port(spec.project_id)?;
        let bridge_port = match ports.allocate_udp_port(spec.project_id) {
            Ok(port) => port,
            Err(e) => {
                ports.release_udp_port(vpcs_port, spec.project_id);
                return Err(e.into());
            }
        };
        Ok(Box::new(VpcsDriver {
            executable: PathBuf::from(&compute.config().vpcs.path),
            initial_script: params.startup_script,
            vpcs_port,
            bridge_port,
            process: Mutex::new(None),
        }))
    }
}

/// Rewrite the `set pcname` line of a startup script.
pub fn render_startup_script(existing: &str, name: &str) -> String {
    let pcname = format!("{PCNAME_COMMAND} {name}");
    let mut replaced = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            if line.trim_start().starts_with(PCNAME_COMMAND) {
                replaced = true;
                pcname.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.insert(0, pcname);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Drives one `vpcs` process.
pub struct VpcsDriver {
    executable: PathBuf,
    initial_script: Option<String>,
    /// Port VPCS listens on.
    vpcs_port: u16,
    /// Port the bridge helper listens on.
    bridge_port: u16,
    process: Mutex<Option<Child>>,
}

fn working_dir<'a>(node: &DriverContext<'a>) -> Result<&'a Path, ProcessError> {
    node.working_dir.ok_or_else(|| {
        ProcessError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "VPCS node has no working directory",
        ))
    })
}

impl VpcsDriver {
    fn write_startup_script(&self, dir: &Path, name: &str) -> Result<(), ProcessError> {
        let path = dir.join(STARTUP_SCRIPT);
        let existing = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.initial_script.clone().unwrap_or_default()
            }
            Err(e) => return Err(e.into()),
        };
        fs::write(&path, render_startup_script(&existing, name))?;
        Ok(())
    }

    fn command(&self, node: &DriverContext<'_>, dir: &Path) -> Result<Command, ProcessError> {
        let log = fs::File::create(dir.join(LOG_FILE))?;
        let mut command = Command::new(&self.executable);
        if let Some(console) = node.console {
            command.arg("-p").arg(console.to_string());
        }
        command
            .args(["-m", "1", "-i", "1", "-F", "-R"])
            .arg("-s")
            .arg(self.vpcs_port.to_string())
            .arg("-c")
            .arg(self.bridge_port.to_string())
            .arg("-t")
            .arg(TUNNEL_HOST)
            .arg(STARTUP_SCRIPT)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true);
        Ok(command)
    }

    fn release_tunnel(&self, compute: &ComputeContext, project_id: Uuid) {
        compute.ports().release_udp_port(self.vpcs_port, project_id);
        compute.ports().release_udp_port(self.bridge_port, project_id);
    }
}

async fn terminate(child: &mut Child) -> Result<(), ProcessError> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(source) => return Err(ProcessError::Signal { pid, source }),
    }
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(status) => {
            debug!("VPCS process {} exited with {:?}", pid, status);
            Ok(())
        }
        Err(_) => {
            warn!("VPCS process {} ignored SIGTERM, killing it", pid);
            child.kill().await?;
            Ok(())
        }
    }
}

#[async_trait]
impl Driver for VpcsDriver {
    fn wiring(&self) -> Wiring {
        Wiring::Bridged
    }

    async fn create(&self, node: DriverContext<'_>) -> Result<(), BackendError> {
        let dir = working_dir(&node)?;
        self.write_startup_script(dir, node.name)?;
        Ok(())
    }

    async fn start(&self, node: DriverContext<'_>) -> Result<Started, BackendError> {
        let mut process = self.process.lock().await;
        if let Some(child) = process.as_mut() {
            match (child.try_wait(), child.id()) {
                (Ok(None), Some(pid)) => return Err(ProcessError::AlreadyRunning { pid }.into()),
                _ => *process = None,
            }
        }

        let dir = working_dir(&node)?;
        self.write_startup_script(dir, node.name)?;
        let mut child = self
            .command(&node, dir)?
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                path: self.executable.clone(),
                source,
            })?;

        tokio::time::sleep(STARTUP_GRACE).await;
        if let Some(status) = child.try_wait().map_err(ProcessError::Io)? {
            let log = fs::read_to_string(dir.join(LOG_FILE)).unwrap_or_default();
            warn!(node_id = %node.node_id, "VPCS exited early: {}", log.trim());
            return Err(ProcessError::EarlyExit {
                status: status.to_string(),
            }
            .into());
        }

        let pid = child.id();
        info!(node_id = %node.node_id, node = node.name, "VPCS started with PID {:?}", pid);
        *process = Some(child);
        Ok(Started { pid })
    }

    async fn stop(&self, node: DriverContext<'_>) -> Result<(), BackendError> {
        let Some(mut child) = self.process.lock().await.take() else {
            return Err(ProcessError::NotRunning.into());
        };
        terminate(&mut child).await?;
        info!(node_id = %node.node_id, node = node.name, "VPCS stopped");
        Ok(())
    }

    async fn close(&self, node: DriverContext<'_>) -> Result<(), BackendError> {
        let running = self.process.lock().await.take();
        let result = match running {
            Some(mut child) => terminate(&mut child).await,
            None => Ok(()),
        };
        self.release_tunnel(node.compute, node.project_id);
        result.map_err(BackendError::from)
    }

    fn endpoint(&self, adapter: u32, _started: &Started) -> Option<InternalEndpoint> {
        (adapter == 0).then(|| InternalEndpoint::Udp {
            lport: self.bridge_port,
            rhost: TUNNEL_HOST.to_string(),
            rport: self.vpcs_port,
        })
    }

    async fn regenerate_configuration(&self, node: DriverContext<'_>) -> Result<(), BackendError> {
        let dir = working_dir(&node)?;
        self.write_startup_script(dir, node.name)?;
        Ok(())
    }
}
