//! Subcommand handling for netsim-compute.
//!
//! Each subcommand gets the merged configuration and runs to completion.
//! The console proxy drives its own epoll loop; a telnet session runs it on
//! a blocking thread so Ctrl-C can be awaited next to it.

use anyhow::{Context, Result, bail};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::backends::{Docker, EthernetSwitch, Vpcs};
use crate::cleanup;
use crate::cli::Commands;
use crate::config::Config;
use crate::console::{ConsoleOptions, ConsoleProxy, NetioPaths, parse_escape};
use crate::manager::{self, Backend};

/// Run one subcommand against the loaded configuration.
pub fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Console {
            instance,
            telnet,
            escape,
        } => run_console(config, instance, telnet, escape.as_deref()),
        Commands::Images { backend } => run_images(config, &backend),
        Commands::Privileges { executable } => {
            run_privileges(&executable);
            Ok(())
        }
        Commands::Cleanup { dry_run } => {
            run_cleanup(dry_run);
            Ok(())
        }
        Commands::Config => {
            let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
            print!("{}", rendered);
            Ok(())
        }
    }
}

fn console_options(config: &Config, escape: Option<&str>) -> Result<ConsoleOptions> {
    let mut options =
        ConsoleOptions::from_config(&config.console).context("Invalid [console] configuration")?;
    if let Some(escape) = escape {
        options.escape = parse_escape(escape)?;
    }
    Ok(options)
}

/// Attach to a console on the terminal or serve it over telnet.
fn run_console(config: &Config, instance: u32, telnet: Option<u16>, escape: Option<&str>) -> Result<()> {
    let options = console_options(config, escape)?;
    let proxy = ConsoleProxy::attach(instance, NetioPaths::for_instance(instance), options)?;

    let Some(port) = telnet else {
        return proxy.run_tty().map_err(Into::into);
    };

    let addr = (config.console.telnet_host.as_str(), port);
    let listener = TcpListener::bind(addr)
        .with_context(|| format!("Failed to listen on {}:{}", config.console.telnet_host, port))?;
    info!("Console {} served on {}:{}", instance, config.console.telnet_host, port);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async move {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let mut server = tokio::task::spawn_blocking(move || proxy.run_telnet(listener, &flag));

        let result = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to wait for Ctrl-C")?;
                info!("Console {} shutting down", instance);
                shutdown.store(true, Ordering::SeqCst);
                (&mut server).await
            }
            result = &mut server => result,
        };
        result.context("Console proxy thread panicked")??;
        Ok(())
    })
}

/// Print the images a backend may use.
fn run_images(config: &Config, backend: &str) -> Result<()> {
    if ![Vpcs::NAME, Docker::NAME, EthernetSwitch::NAME].contains(&backend) {
        bail!("Unknown backend '{}'", backend);
    }
    let dirs = manager::images_directories(&config.server, &backend.to_uppercase());
    if dirs.is_empty() {
        warn!("No image directories exist for {}", backend);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    let images = rt.block_on(manager::list_images(dirs))?;

    for image in images {
        println!(
            "{}\t{}\t{}\t{}",
            image.filename,
            image.size,
            image.checksum,
            image.path.display()
        );
    }
    Ok(())
}

fn run_privileges(executable: &Path) {
    if manager::has_privileged_access(executable) {
        println!("{}: privileged", executable.display());
    } else {
        println!(
            "{}: not privileged (needs root, setuid root or CAP_NET_RAW)",
            executable.display()
        );
    }
}

fn run_cleanup(dry_run: bool) {
    if dry_run {
        let stale = cleanup::list_stale_resources();
        for lock in &stale.locks {
            match lock.pid {
                Some(pid) => println!("{} (PID {})", lock.path.display(), pid),
                None => println!("{}", lock.path.display()),
            }
        }
        println!("{} stale console lock(s)", stale.count());
    } else {
        let cleared = cleanup::cleanup_stale_resources();
        println!("Cleared {} stale console lock(s)", cleared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;

    #[test]
    fn test_escape_override() {
        let config = ConfigLoader::defaults().unwrap();
        assert_eq!(console_options(&config, None).unwrap().escape, 0x1e);
        assert_eq!(console_options(&config, Some("^]")).unwrap().escape, 0x1d);
        assert!(console_options(&config, Some("^^^")).is_err());
    }

    #[test]
    fn test_unknown_backend_images() {
        let config = ConfigLoader::defaults().unwrap();
        assert!(run_images(&config, "qemu").is_err());
    }

    #[test]
    fn test_config_renders() {
        let config = ConfigLoader::defaults().unwrap();
        assert!(handle_command(Commands::Config, &config).is_ok());
    }
}
