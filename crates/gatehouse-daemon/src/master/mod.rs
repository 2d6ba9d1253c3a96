//! Master role: listener pools, worker pool, store bridge, succession.
//!
//! The master owns every public socket in two [`TrafficRegistry`] pools
//! (admin and gateway), spawns the worker processes that carry the data
//! plane, and applies config store events to them. On the fork signal
//! it hands both pools to a successor process and drains once the
//! successor reports ready.

use std::collections::HashSet;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::Signal;
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use gatehouse_core::config::NodeConfig;
use gatehouse_core::store::{ConfigStore, LeaderHandler, MemoryStore, WatchHandler};
use gatehouse_core::traffic::{
    accept_any, listener_name, read_frame, TrafficError, TrafficFrame, TrafficRegistry,
    INHERITED_FD_START,
};

use crate::pidfile::PidFile;

pub mod admin;
pub mod data;
pub mod relay;
pub mod supervisor;
pub mod workers;

use admin::AdminState;
use data::DataController;
use relay::GatewayRelay;
use supervisor::{HandoffOutcome, Supervisor, SupervisorEvent};
use workers::WorkerPool;

/// Listener pools handed down by a predecessor, frames paired with the
/// already-claimed descriptors.
pub struct Inheritance {
    admin: (TrafficFrame, Vec<OwnedFd>),
    gateway: (TrafficFrame, Vec<OwnedFd>),
}

/// Reads both traffic frames from stdin and claims the descriptor slots
/// they describe, admin pool first.
///
/// Must run before the async runtime starts: the runtime allocates its
/// own descriptors at the lowest free slots, and the inherited slots
/// have to be claimed while they are still exactly where the
/// predecessor put them.
pub fn read_inheritance() -> anyhow::Result<Inheritance> {
    let stdin = std::io::stdin();
    let mut reader = stdin.lock();
    let admin_frame =
        read_frame(&mut reader).context("failed to read admin traffic frame from stdin")?;
    let gateway_frame =
        read_frame(&mut reader).context("failed to read gateway traffic frame from stdin")?;

    let mut next = INHERITED_FD_START;
    let admin_handles = claim_entries(&admin_frame, &mut next)?;
    let gateway_handles = claim_entries(&gateway_frame, &mut next)?;
    Ok(Inheritance {
        admin: (admin_frame, admin_handles),
        gateway: (gateway_frame, gateway_handles),
    })
}

/// Claims ownership of each entry's descriptor slot, enforcing that the
/// slots are contiguous from [`INHERITED_FD_START`] across both frames.
/// A gap would mean some other part of the process already owns the
/// slot, and claiming it anyway would double-close.
fn claim_entries(frame: &TrafficFrame, next: &mut u64) -> anyhow::Result<Vec<OwnedFd>> {
    let mut handles = Vec::with_capacity(frame.entries.len());
    for entry in &frame.entries {
        if entry.fd_index != *next {
            anyhow::bail!(
                "inherited descriptor slots must be contiguous from {INHERITED_FD_START}: \
                 listener {} claims slot {}, expected {}",
                entry.address,
                entry.fd_index,
                next
            );
        }
        let fd = entry.fd_index as RawFd;
        fcntl(fd, FcntlArg::F_GETFD).with_context(|| {
            format!(
                "inherited descriptor slot {} for listener {} is not open",
                entry.fd_index, entry.address
            )
        })?;
        // SAFETY: the slot is open, the contiguity check keeps any slot
        // from being claimed twice, and the predecessor transferred
        // ownership of it at spawn.
        handles.push(unsafe { OwnedFd::from_raw_fd(fd) });
        *next += 1;
    }
    Ok(handles)
}

/// Accepts one connection from whatever listeners the registry holds
/// right now.
///
/// The snapshot is retaken on every pass: during a handoff the pool is
/// briefly empty, and after an abandoned handoff it is rehydrated with
/// restored listeners that an older snapshot would not contain.
pub(crate) async fn accept_from(registry: &TrafficRegistry) -> (TcpStream, std::net::SocketAddr) {
    loop {
        let listeners = registry.listeners();
        if listeners.is_empty() {
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        }
        match tokio::time::timeout(Duration::from_secs(1), accept_any(&listeners)).await {
            Ok(Ok(pair)) => return pair,
            Ok(Err(err)) => {
                debug!(error = %err, "accept failed, re-snapshotting listener pool");
                tokio::time::sleep(Duration::from_millis(50)).await;
            },
            // A listener closed mid-wait never wakes its accept future;
            // the deadline forces a fresh snapshot.
            Err(_) => {},
        }
    }
}

fn bind_configured(registry: &TrafficRegistry, addresses: &[String]) -> Result<(), TrafficError> {
    for address in addresses {
        registry.listen("tcp", address)?;
    }
    Ok(())
}

/// Closes inherited listeners whose address is no longer configured.
/// Accept loops stop seeing a closed listener on their next snapshot;
/// established connections run on.
fn close_unconfigured(registry: &TrafficRegistry, addresses: &[String]) {
    let configured: HashSet<String> = addresses
        .iter()
        .map(|address| listener_name("tcp", address))
        .collect();
    for listener in registry.listeners() {
        if !configured.contains(listener.name()) {
            warn!(listener = listener.name(), "closing inherited listener absent from config");
            listener.close();
        }
    }
}

/// Sends SIGQUIT to the predecessor once this process is serving.
fn signal_predecessor() {
    let parent = nix::unistd::getppid();
    // A parent of pid 1 means the predecessor already exited and we were
    // reparented; nothing to signal.
    if parent.as_raw() <= 1 {
        warn!("predecessor already gone before readiness signal");
        return;
    }
    match nix::sys::signal::kill(parent, Signal::SIGQUIT) {
        Ok(()) => info!(predecessor = parent.as_raw(), "signaled predecessor to drain"),
        Err(err) => {
            warn!(predecessor = parent.as_raw(), error = %err, "failed to signal predecessor");
        },
    }
}

/// Runs the master until shutdown or drain.
pub async fn run(
    config: NodeConfig,
    config_path: PathBuf,
    generation: u64,
    inheritance: Option<Inheritance>,
) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let is_successor = inheritance.is_some();

    let admin = TrafficRegistry::new();
    let gateway = TrafficRegistry::new();

    // Adopt inherited listeners before binding anything new, so the
    // config bind below sees them as already present.
    if let Some(inheritance) = inheritance {
        let (frame, handles) = inheritance.admin;
        let adopted_admin = admin
            .decode(frame, handles)
            .context("failed to adopt inherited admin listeners")?;
        let (frame, handles) = inheritance.gateway;
        let adopted_gateway = gateway
            .decode(frame, handles)
            .context("failed to adopt inherited gateway listeners")?;
        info!(
            admin = adopted_admin,
            gateway = adopted_gateway,
            generation,
            "adopted inherited listener pools"
        );
    }

    bind_configured(&admin, &config.admin.listen).context("failed to bind admin listeners")?;
    bind_configured(&gateway, &config.gateway.listen)
        .context("failed to bind gateway listeners")?;
    close_unconfigured(&admin, &config.admin.listen);
    close_unconfigured(&gateway, &config.gateway.listen);

    let mut pidfile = if is_successor {
        PidFile::take_over(&config.pid_file)?
    } else {
        PidFile::acquire(&config.pid_file)?
    };

    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&config),
        config_path.clone(),
        generation,
    ));
    pool.start().await.context("worker pool failed to start")?;

    let store = MemoryStore::new();
    let controller = Arc::new(DataController::new(Arc::clone(&pool)));
    store
        .watch("", Arc::clone(&controller) as Arc<dyn WatchHandler>)
        .await
        .context("failed to establish config watch")?;
    store
        .handle_leader(Arc::clone(&controller) as Arc<dyn LeaderHandler>)
        .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(AdminState {
        node_name: config.node_name.clone(),
        generation,
        pid: std::process::id(),
        started: Instant::now(),
        admin: admin.clone(),
        gateway: gateway.clone(),
        pool: Arc::clone(&pool),
        controller: Arc::clone(&controller),
    });
    let admin_task = tokio::spawn(admin::serve(
        state,
        admin.clone(),
        shutdown_rx.clone(),
        config.admin.shutdown_grace,
    ));
    let relay = GatewayRelay::new(gateway.clone(), Arc::clone(&pool));
    let relay_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { relay.run(shutdown).await }
    });
    let reconcile_task = tokio::spawn({
        let pool = Arc::clone(&pool);
        let shutdown = shutdown_rx;
        async move { pool.run_reconcile(shutdown).await }
    });

    // Pools adopted and workers serving: tell the predecessor to drain.
    if is_successor {
        signal_predecessor();
    }

    info!(
        node = %config.node_name,
        generation,
        pid = std::process::id(),
        workers = config.workers.count,
        "gatehouse master serving"
    );

    let mut supervisor = Supervisor::new(
        admin.clone(),
        gateway.clone(),
        config_path,
        generation,
    );

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    let mut sigusr2 =
        signal(SignalKind::user_defined2()).context("failed to install SIGUSR2 handler")?;

    let draining = loop {
        let event = tokio::select! {
            _ = sigterm.recv() => SupervisorEvent::ShutdownRequested,
            _ = sigint.recv() => SupervisorEvent::ShutdownRequested,
            _ = sigquit.recv() => SupervisorEvent::QuitReceived,
            _ = sigusr1.recv() => SupervisorEvent::ForkRequested,
            _ = sigusr2.recv() => SupervisorEvent::ForkRequested,
            status = supervisor.child_exited() => {
                if let Some(status) = status {
                    warn!(%status, "successor exited");
                }
                SupervisorEvent::SuccessorExited
            },
        };
        match supervisor.handle_event(event).await {
            HandoffOutcome::Continue => {},
            HandoffOutcome::Resumed => {
                // The dead successor may have overwritten the pid file.
                pidfile = PidFile::take_over(&config.pid_file)?;
                info!("resumed serving as the active generation");
            },
            HandoffOutcome::DrainAndExit => break true,
            HandoffOutcome::ShutdownAndExit => break false,
        }
    };

    if draining {
        info!("successor is serving, draining this generation");
    } else {
        info!("shutting down");
    }

    let _ = shutdown_tx.send(true);
    let _ = admin_task.await;
    let _ = relay_task.await;
    let _ = reconcile_task.await;
    admin.close();
    gateway.close();
    pool.stop().await;
    pidfile.release();

    Ok(())
}
