//! The attach loop.
//!
//! One edge-triggered epoll set services the backend datagram socket, the
//! input side (terminal or telnet listener) and every viewer. Sockets are
//! non-blocking and drained until `WouldBlock` on each wakeup.

use std::collections::HashMap;
use std::fs::{self, DirBuilder, File};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::{debug, info, warn};

use super::error::{ConsoleError, ConsoleResult};
use super::escape::{parse_escape, EscapeFilter};
use super::lock::ConsoleLock;
use super::paths::NetioPaths;
use super::telnet::{escape_iac, TelnetFilter, ANNOUNCE};
use crate::config::ConsoleConfig;
use crate::telemetry::{try_audit, AuditEvent};

const BACKEND: u64 = 0;
const INPUT: u64 = 1;
const FIRST_VIEWER: u64 = 2;
const BUFFER: usize = 4096;
const MAX_EVENTS: usize = 16;
const POLL_INTERVAL_MS: u16 = 200;

/// Sent to a viewer refused for exceeding the viewer limit.
pub const TOO_MANY_VIEWERS: &[u8] = b"Too many connections to this console\r\n";

/// Proxy settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleOptions {
    /// Escape byte.
    pub escape: u8,
    /// Telnet viewers served at once.
    pub max_viewers: usize,
}

impl ConsoleOptions {
    /// Options from the `[console]` section.
    pub fn from_config(config: &ConsoleConfig) -> ConsoleResult<Self> {
        Ok(Self {
            escape: parse_escape(&config.escape)?,
            max_viewers: config.max_viewers.max(1),
        })
    }
}

struct Viewer {
    stream: TcpStream,
    filter: TelnetFilter,
}

/// Terminal raw mode for as long as the guard lives.
struct RawTerminal;

impl RawTerminal {
    fn enable() -> io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

fn wait(epoll: &Epoll, events: &mut [EpollEvent], timeout: EpollTimeout) -> ConsoleResult<usize> {
    loop {
        match epoll.wait(events, timeout) {
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// A console attached to one backend instance.
pub struct ConsoleProxy {
    instance: u32,
    paths: NetioPaths,
    backend: UnixDatagram,
    options: ConsoleOptions,
    _lock: ConsoleLock,
}

impl std::fmt::Debug for ConsoleProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleProxy")
            .field("instance", &self.instance)
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl ConsoleProxy {
    /// Lock the console and connect to the backend socket.
    ///
    /// Fails with [`ConsoleError::Locked`] when another proxy is attached.
    pub fn attach(instance: u32, paths: NetioPaths, options: ConsoleOptions) -> ConsoleResult<Self> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(paths.dir())?;

        let lock = match ConsoleLock::acquire(&paths.lock) {
            Ok(lock) => lock,
            Err(e) => {
                if let ConsoleError::Locked { pid, .. } = &e {
                    warn!("Console {} refused: held by PID {:?}", instance, pid);
                    if let Some(audit) = try_audit() {
                        audit.log(AuditEvent::ConsoleReject {
                            instance,
                            holder_pid: *pid,
                        });
                    }
                }
                return Err(e);
            }
        };

        match fs::remove_file(&paths.client) {
            Ok(()) => debug!("Removed stale socket {}", paths.client.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let socket_error = |path: &std::path::Path| {
            let path = path.to_path_buf();
            move |source| ConsoleError::Socket { path, source }
        };
        let backend = UnixDatagram::bind(&paths.client).map_err(socket_error(&paths.client))?;
        if let Err(e) = backend.connect(&paths.server) {
            let _ = fs::remove_file(&paths.client);
            return Err(socket_error(&paths.server)(e));
        }
        backend.set_nonblocking(true)?;

        Ok(Self {
            instance,
            paths,
            backend,
            options,
            _lock: lock,
        })
    }

    /// Socket and lock paths.
    pub fn paths(&self) -> &NetioPaths {
        &self.paths
    }

    fn audit_attach(&self, mode: &str) {
        info!("Console {} attached ({})", self.instance, mode);
        if let Some(audit) = try_audit() {
            audit.log(AuditEvent::ConsoleAttach {
                instance: self.instance,
                pid: std::process::id(),
                mode: mode.to_string(),
            });
        }
    }

    fn send_backend(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Err(e) = self.backend.send(data) {
            debug!("Console {} backend send failed: {}", self.instance, e);
        }
    }

    fn drain_backend(&self, mut sink: impl FnMut(&[u8]) -> io::Result<()>) -> ConsoleResult<()> {
        let mut buf = [0u8; BUFFER];
        loop {
            match self.backend.recv(&mut buf) {
                Ok(n) => sink(&buf[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                // Delivery errors of an earlier send.
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    debug!("Console {} backend not listening", self.instance);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Bridge the backend to the controlling terminal until the escape
    /// sequence or end of input.
    pub fn run_tty(&self) -> ConsoleResult<()> {
        let mut input = File::from(io::stdin().as_fd().try_clone_to_owned()?);
        let mut stdout = io::stdout();
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(
            self.backend.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, BACKEND),
        )?;
        epoll.add(input.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, INPUT))?;

        self.audit_attach("tty");
        let _raw = RawTerminal::enable()?;
        let mut escape = EscapeFilter::new(self.options.escape);
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let mut buf = [0u8; BUFFER];
        loop {
            let n = wait(&epoll, &mut events, EpollTimeout::NONE)?;
            for event in &events[..n] {
                match event.data() {
                    BACKEND => self.drain_backend(|data| {
                        stdout.write_all(data)?;
                        stdout.flush()
                    })?,
                    _ => {
                        let read = input.read(&mut buf)?;
                        if read == 0 {
                            return Ok(());
                        }
                        let out = escape.feed(&buf[..read]);
                        self.send_backend(&out.data);
                        if out.quit {
                            info!("Console {} detached", self.instance);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Serve the backend to telnet viewers until `shutdown` is set.
    pub fn run_telnet(&self, listener: TcpListener, shutdown: &AtomicBool) -> ConsoleResult<()> {
        listener.set_nonblocking(true)?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let edge = EpollFlags::EPOLLIN | EpollFlags::EPOLLET;
        epoll.add(self.backend.as_fd(), EpollEvent::new(edge, BACKEND))?;
        epoll.add(listener.as_fd(), EpollEvent::new(edge, INPUT))?;
        self.audit_attach("telnet");

        let mut viewers: HashMap<u64, Viewer> = HashMap::new();
        let mut next_token = FIRST_VIEWER;
        let mut events = [EpollEvent::empty(); MAX_EVENTS];

        while !shutdown.load(Ordering::SeqCst) {
            let n = wait(&epoll, &mut events, EpollTimeout::from(POLL_INTERVAL_MS))?;
            for event in &events[..n] {
                let mut dead = Vec::new();
                match event.data() {
                    BACKEND => self.drain_backend(|data| {
                        let data = escape_iac(data);
                        for (token, viewer) in viewers.iter_mut() {
                            if viewer.stream.write_all(&data).is_err() {
                                dead.push(*token);
                            }
                        }
                        Ok(())
                    })?,
                    INPUT => loop {
                        let (mut stream, peer) = match listener.accept() {
                            Ok(accepted) => accepted,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) => {
                                warn!("Console {} accept failed: {}", self.instance, e);
                                break;
                            }
                        };
                        if viewers.len() >= self.options.max_viewers {
                            info!("Console {} refused viewer {}: limit reached", self.instance, peer);
                            let _ = stream.write_all(TOO_MANY_VIEWERS);
                            continue;
                        }
                        stream.set_nonblocking(true)?;
                        let _ = stream.set_nodelay(true);
                        if stream.write_all(&ANNOUNCE).is_err() {
                            continue;
                        }
                        epoll.add(stream.as_fd(), EpollEvent::new(edge, next_token))?;
                        debug!("Console {} viewer {} connected", self.instance, peer);
                        viewers.insert(
                            next_token,
                            Viewer {
                                stream,
                                filter: TelnetFilter::new(),
                            },
                        );
                        next_token += 1;
                    },
                    token => {
                        if let Some(viewer) = viewers.get_mut(&token)
                            && !self.serve_viewer(viewer)
                        {
                            dead.push(token);
                        }
                    }
                }
                for token in dead {
                    if let Some(viewer) = viewers.remove(&token) {
                        let _ = epoll.delete(viewer.stream.as_fd());
                        debug!("Console {} viewer {} gone", self.instance, token);
                    }
                }
            }
        }
        info!("Console {} telnet proxy stopped", self.instance);
        Ok(())
    }

    /// Forward a viewer's pending input. False once the viewer is gone.
    fn serve_viewer(&self, viewer: &mut Viewer) -> bool {
        let mut buf = [0u8; BUFFER];
        loop {
            match viewer.stream.read(&mut buf) {
                Ok(0) => return false,
                Ok(n) => {
                    let out = viewer.filter.feed(&buf[..n]);
                    if !out.reply.is_empty() && viewer.stream.write_all(&out.reply).is_err() {
                        return false;
                    }
                    self.send_backend(&out.data);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }
}

impl Drop for ConsoleProxy {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.paths.client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::read_lock_pid;
    use crate::console::telnet::IAC;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const OPTIONS: ConsoleOptions = ConsoleOptions {
        escape: 0x1e,
        max_viewers: 1,
    };

    #[test]
    fn test_options_from_config() {
        let config = ConsoleConfig {
            escape: "^^".to_string(),
            max_viewers: 0,
            telnet_host: String::new(),
        };
        let options = ConsoleOptions::from_config(&config).unwrap();
        assert_eq!(options.escape, 0x1e);
        assert_eq!(options.max_viewers, 1);
    }

    #[test]
    fn test_attach_requires_backend_socket() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NetioPaths::in_dir(dir.path(), 4);
        let err = ConsoleProxy::attach(4, paths.clone(), OPTIONS).unwrap_err();
        assert!(matches!(err, ConsoleError::Socket { .. }));
        // The failed attach released the lock and removed the client socket.
        assert_eq!(read_lock_pid(&paths.lock), None);
        assert!(!paths.client.exists());
        assert!(ConsoleLock::acquire(&paths.lock).is_ok());
    }

    #[test]
    fn test_second_proxy_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NetioPaths::in_dir(dir.path(), 5);
        let _backend = UnixDatagram::bind(&paths.server).unwrap();

        let proxy = ConsoleProxy::attach(5, paths.clone(), OPTIONS).unwrap();
        let err = ConsoleProxy::attach(5, paths.clone(), OPTIONS).unwrap_err();
        assert!(err.to_string().contains(&format!("held by PID {}", std::process::id())));

        drop(proxy);
        assert!(!paths.client.exists());
        assert_eq!(read_lock_pid(&paths.lock), None);
        assert!(ConsoleProxy::attach(5, paths.clone(), OPTIONS).is_ok());
    }

    #[test]
    fn test_telnet_viewers() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NetioPaths::in_dir(dir.path(), 6);
        let backend = UnixDatagram::bind(&paths.server).unwrap();
        backend.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let proxy = ConsoleProxy::attach(6, paths.clone(), OPTIONS).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || proxy.run_telnet(listener, &flag));

        let mut viewer = TcpStream::connect(addr).unwrap();
        viewer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut announce = [0u8; 12];
        viewer.read_exact(&mut announce).unwrap();
        assert_eq!(announce, ANNOUNCE);

        let mut extra = TcpStream::connect(addr).unwrap();
        extra.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut refused = Vec::new();
        extra.read_to_end(&mut refused).unwrap();
        assert_eq!(refused, TOO_MANY_VIEWERS);

        viewer.write_all(&[b'l', b's', IAC, IAC, b'\r']).unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        while received.len() < 4 {
            let n = backend.recv(&mut buf).unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, [b'l', b's', IAC, b'\r']);

        backend.send_to(&[b'o', b'k', IAC], &paths.client).unwrap();
        let mut echoed = [0u8; 4];
        viewer.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, [b'o', b'k', IAC, IAC]);

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }
}
