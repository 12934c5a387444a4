//! Command-line interface definitions for netsim-compute.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Compute-side tooling for network simulation hosts.
///
/// netsim-compute manages emulated network devices on one host: it allocates
/// console and tunnel ports, wires device adapters through the bridge helper
/// and proxies device consoles to a terminal or telnet viewers.
#[derive(Parser, Debug)]
#[command(name = "netsim-compute")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Address ports are allocated on (overrides `server.host`).
    #[arg(long = "host", value_name = "ADDR", global = true)]
    pub host: Option<String>,

    /// Treat the controller as local (absolute image paths allowed verbatim).
    #[arg(long = "local", global = true)]
    pub local: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for netsim-compute.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Attach to a device console.
    ///
    /// Without `--telnet` the console is bridged to this terminal in raw mode;
    /// type the escape prefix followed by `q` to detach. With `--telnet` the
    /// console is shared with any number of telnet viewers (up to the
    /// configured limit).
    Console {
        /// Console instance number (selects `/tmp/netio<uid>/ttyS<N>`).
        #[arg(long = "instance", short = 'i')]
        instance: u32,

        /// Serve the console to telnet viewers on this TCP port.
        #[arg(long = "telnet", value_name = "PORT")]
        telnet: Option<u16>,

        /// Override the two-character escape prefix.
        #[arg(long = "escape", value_name = "PREFIX")]
        escape: Option<String>,
    },

    /// List images available to a backend.
    Images {
        /// Backend whose image directories are listed.
        #[arg(long = "backend", default_value = "vpcs")]
        backend: String,
    },

    /// Check whether an executable may create TAP/Ethernet links.
    Privileges {
        /// Executable to inspect (usually the bridge helper).
        executable: PathBuf,
    },

    /// Remove stale console locks and sockets left by dead proxies.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long = "dry-run")]
        dry_run: bool,
    },

    /// Print the effective merged configuration.
    Config,
}
