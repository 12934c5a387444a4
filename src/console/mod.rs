//! Console proxy.
//!
//! Backends expose their serial console as a UNIX datagram socket
//! (`/tmp/netio<uid>/ttyS<n>`). The proxy binds the peer socket
//! (`ttyC<n>`) and bridges it either to the controlling terminal in raw mode
//! or to telnet viewers.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────── epoll (edge-triggered) ────────────┐
//!  backend ttyS<n> ◄──► │ ttyC<n> ──► broadcast ──► viewer 1..max_viewers │
//!                       │         ◄── telnet filter ◄──                   │
//!                       │  or: stdin ─► escape filter ─► ttyC<n>          │
//!                       └─────────────────────────────────────────────────┘
//! ```
//!
//! Only one proxy may attach to an instance: `ttyC<n>.lck` is flock'ed and
//! records the holder's PID. Any failure to take the lock refuses the
//! attach.
//!
//! # Example
//!
//! ```no_run
//! use netsim_compute::console::{ConsoleOptions, ConsoleProxy, NetioPaths};
//!
//! let options = ConsoleOptions { escape: 0x1e, max_viewers: 10 };
//! let proxy = ConsoleProxy::attach(3, NetioPaths::for_instance(3), options).unwrap();
//! proxy.run_tty().unwrap();
//! ```

mod error;
mod escape;
mod lock;
mod paths;
mod proxy;
pub mod telnet;

pub use error::{ConsoleError, ConsoleResult};
pub use escape::{parse_escape, EscapeFilter, Escaped};
pub use lock::{read_lock_pid, ConsoleLock};
pub use paths::{lock_path, netio_dir, NetioPaths, LOCK_EXTENSION};
pub use proxy::{ConsoleOptions, ConsoleProxy, TOO_MANY_VIEWERS};
