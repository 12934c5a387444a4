//! netsim-compute: compute-side tooling for network simulation hosts.
//!
//! This is the entry point for the netsim-compute binary. It parses the CLI,
//! loads the merged configuration, initializes telemetry and hands off to the
//! subcommand handler.
//!
//! # I/O Architecture
//!
//! - **Audit logging**: goes to syslog (not stdout/stderr), so it never
//!   interferes with a console session in raw mode
//! - **Debug logging**: goes to stderr, filtered by `-v` or `RUST_LOG`
//! - **Command output**: stdout

use anyhow::{Context, Result};
use clap::Parser;
use netsim_compute::{cli::Cli, cli_handler, config::ConfigLoader, telemetry};
use tracing::{debug, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;
    debug!("Parsed CLI arguments: {:?}", cli);

    // A host without syslog still gets to use the console.
    if let Err(e) = telemetry::init_logger() {
        warn!("Audit logging disabled: {}", e);
    }

    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;
    debug!("Loaded configuration: {:?}", config);

    cli_handler::handle_command(cli.command, &config)
}

/// Initialize the tracing subscriber for debug/development logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG` or warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
