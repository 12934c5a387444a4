//! TCP client for the bridge helper and the helper process launcher.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{UbridgeError, UbridgeResult};
use super::protocol::{parse_version, BridgeCommand, ReplyParser};
use super::{BridgeHelper, BridgeLauncher, LaunchRequest};
use crate::ports::PortManager;

/// Oldest helper release with namespace moves and packet filters.
pub const MIN_UBRIDGE_VERSION: (u32, u32, u32) = (0, 9, 14);

/// Attempts made by [`UbridgeHypervisor::probe_version`].
const VERSION_PROBE_ATTEMPTS: u32 = 3;

/// Delay between connect attempts while the helper starts up.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Grace period between `hypervisor stop` and a forced kill.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Log file written next to the node's files.
const UBRIDGE_LOG: &str = "ubridge.log";

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Line-protocol client for one helper's control port.
///
/// Commands are serialized: one command and its full reply at a time.
pub struct UbridgeHypervisor {
    addr: SocketAddr,
    command_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl UbridgeHypervisor {
    /// Connect to a helper control port.
    ///
    /// Retries until `connect_timeout` elapses since a freshly spawned helper
    /// needs a moment before it listens.
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> UbridgeResult<Self> {
        let deadline = tokio::time::Instant::now() + connect_timeout;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    return Err(UbridgeError::Connect { addr, source: e });
                }
                Err(e) => {
                    debug!("Bridge helper at {} not ready yet: {}", addr, e);
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        };
        stream.set_nodelay(true)?;

        let (read, write) = stream.into_split();
        info!("Connected to bridge helper at {}", addr);
        Ok(Self {
            addr,
            command_timeout,
            conn: Mutex::new(Some(Connection {
                reader: BufReader::new(read),
                writer: write,
            })),
        })
    }

    /// Control address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Ask the helper for its version.
    ///
    /// A helper that is still initializing may answer with something that is
    /// not a version yet; the probe is retried up to three times before the
    /// last error is returned. A too-old helper fails immediately.
    pub async fn probe_version(&self) -> UbridgeResult<(u32, u32, u32)> {
        let mut last_error = UbridgeError::Protocol("no version reply".to_string());

        for attempt in 1..=VERSION_PROBE_ATTEMPTS {
            match self.send(&BridgeCommand::HypervisorVersion).await {
                Ok(reply) => match reply.first().and_then(|raw| parse_version(raw)) {
                    Some(version) if version >= MIN_UBRIDGE_VERSION => return Ok(version),
                    Some(version) => {
                        return Err(UbridgeError::Protocol(format!(
                            "bridge helper {}.{}.{} is too old, {}.{}.{} or newer is required",
                            version.0,
                            version.1,
                            version.2,
                            MIN_UBRIDGE_VERSION.0,
                            MIN_UBRIDGE_VERSION.1,
                            MIN_UBRIDGE_VERSION.2
                        )));
                    }
                    None => {
                        last_error = UbridgeError::Protocol(format!(
                            "unexpected version reply {reply:?}"
                        ));
                    }
                },
                Err(UbridgeError::Command { message, .. }) => {
                    last_error = UbridgeError::Protocol(message);
                }
                Err(e) => return Err(e),
            }
            debug!(
                "Version probe attempt {}/{} failed: {}",
                attempt, VERSION_PROBE_ATTEMPTS, last_error
            );
            if attempt < VERSION_PROBE_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        Err(last_error)
    }

    async fn exchange(conn: &mut Connection, line: &str) -> UbridgeResult<Vec<String>> {
        conn.writer.write_all(line.as_bytes()).await?;
        conn.writer.write_all(b"\n").await?;
        conn.writer.flush().await?;

        let mut parser = ReplyParser::new();
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = conn.reader.read_line(&mut buf).await?;
            if n == 0 {
                return Err(UbridgeError::NotRunning);
            }
            match parser.feed(&buf) {
                None => continue,
                Some(Ok(payload)) => return Ok(payload),
                Some(Err(message)) => {
                    return Err(UbridgeError::Command {
                        command: line.to_string(),
                        message,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl BridgeHelper for UbridgeHypervisor {
    async fn send(&self, command: &BridgeCommand) -> UbridgeResult<Vec<String>> {
        let line = command.to_string();
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(UbridgeError::NotRunning)?;

        debug!("bridge helper {} <- {}", self.addr, line);
        let result =
            match tokio::time::timeout(self.command_timeout, Self::exchange(conn, &line)).await {
                Ok(result) => result,
                Err(_) => {
                    // The reply may still arrive; the stream is out of sync now.
                    *guard = None;
                    return Err(UbridgeError::Timeout {
                        command: line,
                        secs: self.command_timeout.as_secs(),
                    });
                }
            };

        match result {
            Err(UbridgeError::Command {
                command: sent,
                message,
            }) => match command {
                BridgeCommand::MoveToNs { tap, pid, .. } => Err(UbridgeError::Namespace {
                    tap: tap.clone(),
                    pid: *pid,
                    message,
                }),
                _ => Err(UbridgeError::Command {
                    command: sent,
                    message,
                }),
            },
            Err(UbridgeError::NotRunning) => {
                *guard = None;
                Err(UbridgeError::NotRunning)
            }
            other => {
                if let Ok(ref reply) = other {
                    debug!("bridge helper {} -> {:?}", self.addr, reply);
                }
                other
            }
        }
    }

    async fn shutdown(&self) -> UbridgeResult<()> {
        let stop = self.send(&BridgeCommand::HypervisorStop).await;
        *self.conn.lock().await = None;
        match stop {
            Ok(_) | Err(UbridgeError::NotRunning) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A helper process owned by one started node.
struct ManagedHelper {
    hypervisor: UbridgeHypervisor,
    child: Mutex<Option<Child>>,
    port: u16,
    project_id: Uuid,
    ports: Arc<PortManager>,
}

#[async_trait]
impl BridgeHelper for ManagedHelper {
    async fn send(&self, command: &BridgeCommand) -> UbridgeResult<Vec<String>> {
        self.hypervisor.send(command).await
    }

    async fn shutdown(&self) -> UbridgeResult<()> {
        if let Err(e) = self.hypervisor.shutdown().await {
            warn!("Bridge helper on port {} did not stop cleanly: {}", self.port, e);
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
                Ok(Ok(status)) => debug!("Bridge helper exited with {}", status),
                Ok(Err(e)) => warn!("Failed to wait for bridge helper: {}", e),
                Err(_) => {
                    warn!(
                        "Bridge helper on port {} still running after {:?}, killing",
                        self.port, STOP_GRACE_PERIOD
                    );
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill bridge helper: {}", e);
                    }
                }
            }
        }

        self.ports.release_tcp_port(self.port, self.project_id);
        Ok(())
    }
}

/// Spawns one helper process per started node.
pub struct UbridgeLauncher {
    path: PathBuf,
    host: IpAddr,
    ports: Arc<PortManager>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl UbridgeLauncher {
    /// Create a launcher for the helper at `path`.
    ///
    /// Control ports come from the console range of `ports`.
    pub fn new(
        path: impl Into<PathBuf>,
        ports: Arc<PortManager>,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports,
            connect_timeout,
            command_timeout,
        }
    }

    /// Helper executable.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn spawn(&self, port: u16, working_dir: &Path) -> UbridgeResult<Child> {
        let log = std::fs::File::create(working_dir.join(UBRIDGE_LOG)).map_err(|e| {
            UbridgeError::Launch {
                path: self.path.clone(),
                source: e,
            }
        })?;
        let stderr = log.try_clone().map_err(|e| UbridgeError::Launch {
            path: self.path.clone(),
            source: e,
        })?;

        Command::new(&self.path)
            .arg("-H")
            .arg(format!("{}:{}", self.host, port))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| UbridgeError::Launch {
                path: self.path.clone(),
                source: e,
            })
    }
}

#[async_trait]
impl BridgeLauncher for UbridgeLauncher {
    async fn launch(&self, request: LaunchRequest<'_>) -> UbridgeResult<Arc<dyn BridgeHelper>> {
        let port = self
            .ports
            .allocate_console_port(request.project_id, None, Some(self.host))
            .map_err(|e| UbridgeError::Protocol(format!("no control port for bridge helper: {e}")))?;

        let launched = async {
            let mut child = self.spawn(port, request.working_dir).await?;
            info!(
                "Started bridge helper for node {} on {}:{} (pid {:?})",
                request.node_id,
                self.host,
                port,
                child.id()
            );

            let hypervisor = match UbridgeHypervisor::connect(
                SocketAddr::new(self.host, port),
                self.connect_timeout,
                self.command_timeout,
            )
            .await
            {
                Ok(hypervisor) => hypervisor,
                Err(e) => {
                    let _ = child.kill().await;
                    return Err(e);
                }
            };

            if let Err(e) = hypervisor.probe_version().await {
                let _ = child.kill().await;
                return Err(e);
            }

            Ok::<_, UbridgeError>((child, hypervisor))
        }
        .await;

        match launched {
            Ok((child, hypervisor)) => Ok(Arc::new(ManagedHelper {
                hypervisor,
                child: Mutex::new(Some(child)),
                port,
                project_id: request.project_id,
                ports: Arc::clone(&self.ports),
            })),
            Err(e) => {
                self.ports.release_tcp_port(port, request.project_id);
                Err(e)
            }
        }
    }
}
