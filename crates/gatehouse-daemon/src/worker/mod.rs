//! Worker role: data listeners plus a Unix control socket speaking the
//! push protocol.
//!
//! Workers never bind public addresses; the master relays gateway
//! traffic to them on loopback. The control socket is reachable only by
//! the owning uid, and each connection serves any number of requests in
//! sequence until the peer hangs up.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use futures::SinkExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use gatehouse_core::config::NodeConfig;
use gatehouse_core::push::{push_codec, recv_request, PushError};

use crate::env::WorkerEnv;

pub mod service;

use service::WorkerService;

const MAX_CONTROL_CONNECTIONS: usize = 64;

/// Runs the worker until SIGTERM or SIGINT.
pub async fn run(config: NodeConfig, worker: WorkerEnv) -> anyhow::Result<()> {
    let service = Arc::new(WorkerService::new(
        worker.id,
        &config.professions,
        std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    ));

    let assigned = config.worker_ports(worker.id);
    service
        .apply_ports(&assigned)
        .await
        .with_context(|| format!("failed to bind data ports {assigned:?}"))?;

    let listener = bind_control_socket(&worker.socket).with_context(|| {
        format!("failed to bind control socket {}", worker.socket.display())
    })?;
    info!(
        worker = worker.id,
        socket = %worker.socket.display(),
        ports = ?assigned,
        "gatehouse worker serving"
    );

    let limiter = Arc::new(Semaphore::new(MAX_CONTROL_CONNECTIONS));
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(worker = worker.id, "worker stopping on SIGTERM");
                break;
            },
            _ = sigint.recv() => {
                info!(worker = worker.id, "worker stopping on SIGINT");
                break;
            },
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(worker = worker.id, error = %err, "control accept failed");
                        continue;
                    },
                };
                if !peer_is_trusted(&stream) {
                    warn!(worker = worker.id, "rejecting control connection from foreign uid");
                    continue;
                }
                let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() else {
                    warn!(worker = worker.id, "control connection limit reached, dropping");
                    continue;
                };
                let service = Arc::clone(&service);
                let id = worker.id;
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_connection(id, stream, service).await;
                });
            },
        }
    }

    service.close();
    if let Err(err) = std::fs::remove_file(&worker.socket) {
        debug!(worker = worker.id, error = %err, "control socket already removed");
    }
    Ok(())
}

/// Binds the control socket: private directory, no stale socket file,
/// owner-only permissions on the result.
fn bind_control_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(dir) = path.parent() {
        ensure_socket_dir(dir)?;
    }
    match std::fs::symlink_metadata(path) {
        Ok(_) => {
            // A connectable socket has a live owner; only a dead one may
            // be swept aside.
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                anyhow::bail!("control socket {} is already in use", path.display());
            }
            std::fs::remove_file(path).with_context(|| {
                format!("failed to remove stale socket {}", path.display())
            })?;
            debug!(socket = %path.display(), "removed stale control socket");
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to stat socket {}", path.display()));
        },
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;

    let mut permissions = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    permissions.set_mode(0o600);
    std::fs::set_permissions(path, permissions)
        .with_context(|| format!("failed to restrict {}", path.display()))?;
    Ok(listener)
}

fn ensure_socket_dir(dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create socket directory {}", dir.display()))?;
    let metadata = std::fs::symlink_metadata(dir)
        .with_context(|| format!("failed to stat socket directory {}", dir.display()))?;
    if metadata.file_type().is_symlink() {
        anyhow::bail!("socket directory {} is a symlink, refusing", dir.display());
    }
    if !metadata.is_dir() {
        anyhow::bail!("socket directory {} is not a directory", dir.display());
    }
    let mut permissions = metadata.permissions();
    permissions.set_mode(0o700);
    std::fs::set_permissions(dir, permissions)
        .with_context(|| format!("failed to restrict socket directory {}", dir.display()))?;
    Ok(())
}

/// Only the uid that owns this process may drive the control socket.
fn peer_is_trusted(stream: &UnixStream) -> bool {
    match stream.peer_cred() {
        Ok(cred) => cred.uid() == nix::unistd::getuid().as_raw(),
        Err(err) => {
            warn!(error = %err, "failed to read peer credentials");
            false
        },
    }
}

async fn handle_connection(id: u32, stream: UnixStream, service: Arc<WorkerService>) {
    let mut framed = Framed::new(stream, push_codec());
    loop {
        let (kind, payload) = match recv_request(&mut framed).await {
            Ok(request) => request,
            Err(PushError::ConnectionClosed) => break,
            Err(err) => {
                debug!(worker = id, error = %err, "control connection error");
                break;
            },
        };
        let response = match service.dispatch(kind, payload).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(worker = id, ?kind, error = %err, "failed to serve control request");
                break;
            },
        };
        if let Err(err) = framed.send(response).await {
            debug!(worker = id, error = %err, "failed to write control response");
            break;
        }
    }
}
