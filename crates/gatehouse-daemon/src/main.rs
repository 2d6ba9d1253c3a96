//! gatehoused - gatehouse control plane daemon
//!
//! One binary, two roles. Run bare it becomes the master: it owns the
//! admin and gateway listeners, supervises the worker pool, and watches
//! the config store. Spawned with `GATEHOUSE_PROCESS=worker` it becomes
//! a pool worker serving the push protocol on a private Unix socket.
//!
//! # Descriptor inheritance
//!
//! A successor master must claim the listener descriptors encoded on
//! its standard input BEFORE the Tokio runtime starts. The runtime
//! opens descriptors of its own (epoll, eventfd, thread parking) at the
//! lowest free slots, and those would land inside the inherited range
//! if the claim ran later. `main` therefore stays synchronous: it
//! parses arguments, loads configuration, claims inheritance, and only
//! then constructs the runtime and enters `async_main`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use gatehouse_core::config::NodeConfig;
use gatehouse_daemon::env::{self, ProcessRole, WorkerEnv};
use gatehouse_daemon::{master, worker};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// gatehouse control plane daemon
#[derive(Parser, Debug)]
#[command(name = "gatehoused")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to node configuration file
    #[arg(short, long, default_value = "gatehouse.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Pid file path override
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Validate the configuration file and exit
    #[arg(long)]
    check_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(path) = &args.pid_file {
        config.pid_file = path.clone();
    }

    if args.check_config {
        println!("configuration {} is valid", args.config.display());
        return Ok(());
    }

    let role = ProcessRole::from_env()?;
    let generation = env::generation();

    // Claim inherited descriptors while the process is still single
    // threaded; see the module docs.
    let inheritance = match role {
        ProcessRole::Master if env::is_successor() => Some(master::read_inheritance()?),
        _ => None,
    };

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args, config, role, generation, inheritance))
}

async fn async_main(
    args: Args,
    config: NodeConfig,
    role: ProcessRole,
    generation: u64,
    inheritance: Option<master::Inheritance>,
) -> Result<()> {
    init_logging(&config, args.log_level.as_deref())?;

    match role {
        ProcessRole::Master => master::run(config, args.config, generation, inheritance).await,
        ProcessRole::Worker => {
            let worker = WorkerEnv::from_env().context("worker environment incomplete")?;
            worker::run(config, worker).await
        },
    }
}

/// A `--log-level` flag beats `RUST_LOG`, which beats the configured
/// level. Workers log to stdout either way; the master forwards their
/// lines into its own output.
fn init_logging(config: &NodeConfig, cli_level: Option<&str>) -> Result<()> {
    let filter = if let Some(level) = cli_level {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if let Some(path) = &config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_config_path() {
        let args = Args::try_parse_from(["gatehoused"]).unwrap();
        assert_eq!(args.config, PathBuf::from("gatehouse.toml"));
        assert!(args.log_level.is_none());
        assert!(args.pid_file.is_none());
        assert!(!args.check_config);
    }

    #[test]
    fn test_args_parse_overrides() {
        let args = Args::try_parse_from([
            "gatehoused",
            "--config",
            "/etc/gatehouse/node.toml",
            "--log-level",
            "debug",
            "--pid-file",
            "/run/gatehouse.pid",
            "--check-config",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/gatehouse/node.toml"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.pid_file, Some(PathBuf::from("/run/gatehouse.pid")));
        assert!(args.check_config);
    }
}
