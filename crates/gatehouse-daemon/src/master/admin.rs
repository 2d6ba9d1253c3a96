//! Admin HTTP surface.
//!
//! Serves `/healthz` and `/status` over the admin listener pool. The
//! listeners are owned by the [`TrafficRegistry`], not by axum, so they
//! can be handed to a successor mid-flight: the acceptor re-snapshots
//! the pool on every pass and simply waits while the pool is empty
//! during a handoff window.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{info, warn};

use gatehouse_core::traffic::TrafficRegistry;

use super::data::DataController;
use super::workers::{WorkerPool, WorkerStatus};

/// Everything the admin handlers read.
pub struct AdminState {
    /// Configured node name.
    pub node_name: String,
    /// Succession generation of this process.
    pub generation: u64,
    /// Our pid, so operators know where to aim signals.
    pub pid: u32,
    /// Process start, for uptime.
    pub started: Instant,
    /// Admin listener pool.
    pub admin: TrafficRegistry,
    /// Gateway listener pool.
    pub gateway: TrafficRegistry,
    /// The worker pool, for per-worker status.
    pub pool: Arc<WorkerPool>,
    /// Store bridge, for the leader flag.
    pub controller: Arc<DataController>,
}

#[derive(Serialize)]
struct StatusBody {
    node: String,
    version: &'static str,
    pid: u32,
    generation: u64,
    uptime_seconds: u64,
    leader: bool,
    admin: Vec<String>,
    gateway: Vec<String>,
    workers: Vec<WorkerStatus>,
}

/// Builds the admin router.
pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<Arc<AdminState>>) -> Json<StatusBody> {
    let workers = state.pool.snapshot().await;
    Json(StatusBody {
        node: state.node_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        pid: state.pid,
        generation: state.generation,
        uptime_seconds: state.started.elapsed().as_secs(),
        leader: state.controller.is_leading(),
        admin: listener_addresses(&state.admin),
        gateway: listener_addresses(&state.gateway),
        workers,
    })
}

fn listener_addresses(registry: &TrafficRegistry) -> Vec<String> {
    registry
        .listeners()
        .iter()
        .filter_map(|listener| listener.local_addr())
        .map(|addr| addr.to_string())
        .collect()
}

/// Adapts a [`TrafficRegistry`] to axum's listener interface.
struct RegistryAcceptor {
    registry: TrafficRegistry,
}

impl axum::serve::Listener for RegistryAcceptor {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        super::accept_from(&self.registry).await
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.registry
            .listeners()
            .into_iter()
            .find_map(|listener| listener.local_addr())
            .ok_or_else(|| std::io::Error::other("no admin listeners bound"))
    }
}

/// Serves the admin surface until shutdown flips, then drains in-flight
/// requests for at most `grace` before dropping what remains.
pub async fn serve(
    state: Arc<AdminState>,
    registry: TrafficRegistry,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let app = router(state);
    let acceptor = RegistryAcceptor { registry };
    let graceful = axum::serve(acceptor, app)
        .with_graceful_shutdown(flagged(shutdown.clone()))
        .into_future();

    tokio::select! {
        result = graceful => {
            match result {
                Ok(()) => info!("admin surface drained"),
                Err(err) => warn!(error = %err, "admin surface exited with error"),
            }
        },
        () = async {
            flagged(shutdown).await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_ms = grace.as_millis() as u64, "admin connections still open after grace, dropping");
        },
    }
}

async fn flagged(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
