//! Worker pool lifecycle and configuration push.
//!
//! The master spawns one worker process per configured slot, probes
//! their control sockets until they answer, and from then on pushes
//! every configuration change through a two-phase protocol: a dry-run
//! `check` call to every reachable worker, then the committing call
//! only if validation passed everywhere.
//!
//! The failure rules differ by phase. During validation a `FAIL` answer
//! or a timed-out call aborts the whole change with nothing committed,
//! while an unreachable worker is excluded and marked failing. During
//! commit there is no rollback: a worker that rejects or drops a change
//! it already validated is marked failing and left for the reconcile
//! loop, and the remaining workers keep the new state.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use gatehouse_core::config::NodeConfig;
use gatehouse_core::push::{
    push_codec, recv_response, send_request, DeleteRequest, DeleteResponse, HelloRequest,
    HelloResponse, MessageKind, PushError, RefreshRequest, RefreshResponse, SetRequest,
    SetResponse, StatusCode, WorkerResource,
};

use crate::env;

/// Observed health of one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerHealth {
    /// Spawned but not yet confirmed via ping.
    Unknown,
    /// Answering pings on its control socket.
    Healthy,
    /// Unreachable or inconsistent; excluded from pushes until the
    /// reconcile loop sees it answer again.
    Failing,
}

/// Point-in-time view of one worker, for the status surface.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerStatus {
    /// Slot id, stable across restarts of the worker process.
    pub id: u32,
    /// OS pid of the current process in the slot, if any.
    pub pid: Option<u32>,
    /// Current health classification.
    pub health: WorkerHealth,
    /// Ports this worker is supposed to listen on.
    pub assigned: Vec<u16>,
    /// Ports the worker last reported owning.
    pub observed: Vec<u16>,
    /// Entry ids this worker has acknowledged committing, sorted.
    pub applied: Vec<String>,
    /// Seconds since the worker last answered a ping, if it ever has.
    pub last_seen_seconds: Option<u64>,
}

/// Errors surfaced to callers of the push path.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// More than half the pool is unreachable; applying a change to the
    /// remainder would fork the configuration.
    #[error("only {available} of {total} workers reachable, refusing to apply changes")]
    NoHealthyWorkers {
        /// Workers still answering.
        available: usize,
        /// Pool size.
        total: usize,
    },

    /// A worker answered `FAIL` during validation.
    #[error("worker {id} rejected {operation}: {message}")]
    Rejected {
        /// Worker that rejected the change.
        id: u32,
        /// The call that failed, `set_check` or `delete_check`.
        operation: &'static str,
        /// The worker's rejection message, verbatim.
        message: String,
    },

    /// A worker did not answer a validation call within the push
    /// deadline. A worker too slow to validate cannot be trusted to
    /// commit in time either, so the change is aborted.
    #[error("worker {id} timed out during {operation}")]
    Timeout {
        /// Worker that timed out.
        id: u32,
        /// The call that timed out.
        operation: &'static str,
    },

    /// A worker never became ready within the start deadline.
    #[error("worker {id} failed to start: {reason}")]
    StartFailed {
        /// Worker that never answered.
        id: u32,
        /// What was observed instead of readiness.
        reason: String,
    },

    /// Spawning the worker process failed outright.
    #[error("failed to spawn worker {id}: {source}")]
    Spawn {
        /// Slot the spawn was for.
        id: u32,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// One configuration change to fan out to the pool.
#[derive(Clone, Debug)]
pub enum Change {
    /// Create or update an entry.
    Set(SetRequest),
    /// Remove an entry.
    Delete(DeleteRequest),
}

impl Change {
    /// The entry id the change targets.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Set(request) => &request.id,
            Self::Delete(request) => &request.id,
        }
    }

    const fn check_operation(&self) -> &'static str {
        match self {
            Self::Set(_) => "set_check",
            Self::Delete(_) => "delete_check",
        }
    }

    const fn commit_operation(&self) -> &'static str {
        match self {
            Self::Set(_) => "set",
            Self::Delete(_) => "delete",
        }
    }
}

/// Counts from one completed apply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushSummary {
    /// Workers that committed the change.
    pub applied: usize,
    /// Workers that answered `SKILL` and were left untouched.
    pub skipped: usize,
    /// Workers that validated the change but failed to commit it.
    pub failed: usize,
}

/// One push call per protocol operation, addressed by control socket.
///
/// The pool always talks through this trait so tests can script worker
/// behavior without processes.
#[async_trait]
pub trait PushClient: Send + Sync {
    /// Liveness probe; the response carries the worker's port set.
    async fn ping(&self, socket: &Path, request: HelloRequest) -> Result<HelloResponse, PushError>;
    /// Dry-run validation of a set.
    async fn set_check(&self, socket: &Path, request: SetRequest)
        -> Result<SetResponse, PushError>;
    /// Committing set.
    async fn set(&self, socket: &Path, request: SetRequest) -> Result<SetResponse, PushError>;
    /// Dry-run validation of a delete.
    async fn delete_check(
        &self,
        socket: &Path,
        request: DeleteRequest,
    ) -> Result<DeleteResponse, PushError>;
    /// Committing delete.
    async fn delete(
        &self,
        socket: &Path,
        request: DeleteRequest,
    ) -> Result<DeleteResponse, PushError>;
    /// Reconciles the worker's listener set to exactly the given ports.
    async fn refresh(
        &self,
        socket: &Path,
        request: RefreshRequest,
    ) -> Result<RefreshResponse, PushError>;
}

/// Production client: one short-lived Unix socket connection per call,
/// each call bounded by a deadline.
pub struct UdsPushClient {
    push_timeout: Duration,
    ping_timeout: Duration,
}

impl UdsPushClient {
    /// Builds a client with the deadlines from the worker pool config.
    #[must_use]
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            push_timeout: config.workers.push_timeout,
            ping_timeout: config.workers.ping_timeout,
        }
    }

    async fn call<Req, Resp>(
        &self,
        socket: &Path,
        kind: MessageKind,
        request: &Req,
        deadline: Duration,
    ) -> Result<Resp, PushError>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        let exchange = async {
            let stream =
                UnixStream::connect(socket)
                    .await
                    .map_err(|source| PushError::Connect {
                        path: socket.to_path_buf(),
                        source,
                    })?;
            let mut framed = Framed::new(stream, push_codec());
            send_request(&mut framed, kind, request).await?;
            recv_response(&mut framed).await
        };
        match timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(PushError::Timeout {
                duration_ms: deadline.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl PushClient for UdsPushClient {
    async fn ping(&self, socket: &Path, request: HelloRequest) -> Result<HelloResponse, PushError> {
        self.call(socket, MessageKind::Ping, &request, self.ping_timeout)
            .await
    }

    async fn set_check(
        &self,
        socket: &Path,
        request: SetRequest,
    ) -> Result<SetResponse, PushError> {
        self.call(socket, MessageKind::SetCheck, &request, self.push_timeout)
            .await
    }

    async fn set(&self, socket: &Path, request: SetRequest) -> Result<SetResponse, PushError> {
        self.call(socket, MessageKind::Set, &request, self.push_timeout)
            .await
    }

    async fn delete_check(
        &self,
        socket: &Path,
        request: DeleteRequest,
    ) -> Result<DeleteResponse, PushError> {
        self.call(socket, MessageKind::DeleteCheck, &request, self.push_timeout)
            .await
    }

    async fn delete(
        &self,
        socket: &Path,
        request: DeleteRequest,
    ) -> Result<DeleteResponse, PushError> {
        self.call(socket, MessageKind::Delete, &request, self.push_timeout)
            .await
    }

    async fn refresh(
        &self,
        socket: &Path,
        request: RefreshRequest,
    ) -> Result<RefreshResponse, PushError> {
        self.call(socket, MessageKind::Refresh, &request, self.push_timeout)
            .await
    }
}

struct WorkerSlot {
    id: u32,
    socket: PathBuf,
    assigned: Vec<u16>,
    observed: Vec<u16>,
    // Entry ids acked with SUCCESS on their committing call. Tracks what
    // each worker last applied so the status surface can show drift
    // after a partial commit.
    applied: BTreeSet<String>,
    health: WorkerHealth,
    last_seen: Option<Instant>,
    child: Option<Child>,
    pid: Option<u32>,
}

/// The pool of worker processes owned by this master.
pub struct WorkerPool {
    config: Arc<NodeConfig>,
    config_path: PathBuf,
    generation: u64,
    client: Arc<dyn PushClient>,
    slots: Mutex<Vec<WorkerSlot>>,
    next_backend: AtomicUsize,
}

impl WorkerPool {
    /// Builds the pool with the production Unix socket client.
    #[must_use]
    pub fn new(config: Arc<NodeConfig>, config_path: PathBuf, generation: u64) -> Self {
        let client = Arc::new(UdsPushClient::new(&config));
        Self::with_client(config, config_path, generation, client)
    }

    /// Builds the pool over an explicit client.
    #[must_use]
    pub fn with_client(
        config: Arc<NodeConfig>,
        config_path: PathBuf,
        generation: u64,
        client: Arc<dyn PushClient>,
    ) -> Self {
        let slots = (0..config.workers.count)
            .map(|id| WorkerSlot {
                id,
                socket: config.worker_socket_path(generation, id),
                assigned: config.worker_ports(id),
                observed: Vec::new(),
                applied: BTreeSet::new(),
                health: WorkerHealth::Unknown,
                last_seen: None,
                child: None,
                pid: None,
            })
            .collect();
        Self {
            config,
            config_path,
            generation,
            client,
            slots: Mutex::new(slots),
            next_backend: AtomicUsize::new(0),
        }
    }

    /// Spawns every worker process and waits until each one answers a
    /// ping on its control socket or the start deadline passes.
    pub async fn start(&self) -> Result<(), WorkerError> {
        {
            let mut slots = self.slots.lock().await;
            for slot in slots.iter_mut() {
                self.spawn_worker(slot)?;
            }
        }
        self.wait_ready().await
    }

    fn spawn_worker(&self, slot: &mut WorkerSlot) -> Result<(), WorkerError> {
        let exe = std::env::current_exe().map_err(|source| WorkerError::Spawn {
            id: slot.id,
            source,
        })?;

        let mut child = Command::new(exe)
            .arg("--config")
            .arg(&self.config_path)
            .env(env::PROCESS_ENV, "worker")
            .env(env::WORKER_ID_ENV, slot.id.to_string())
            .env(env::WORKER_SOCKET_ENV, &slot.socket)
            .env(env::GENERATION_ENV, self.generation.to_string())
            .env_remove(env::CONTINUE_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                id: slot.id,
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(slot.id, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(slot.id, "stderr", stderr);
        }

        slot.pid = child.id();
        slot.child = Some(child);
        slot.health = WorkerHealth::Unknown;
        // A fresh process starts with no entries applied.
        slot.applied.clear();
        info!(
            worker = slot.id,
            pid = slot.pid,
            socket = %slot.socket.display(),
            "worker spawned"
        );
        Ok(())
    }

    async fn wait_ready(&self) -> Result<(), WorkerError> {
        let deadline = tokio::time::Instant::now() + self.config.workers.start_deadline;
        loop {
            let pending: Vec<(u32, PathBuf)> = {
                let slots = self.slots.lock().await;
                slots
                    .iter()
                    .filter(|slot| slot.health != WorkerHealth::Healthy)
                    .map(|slot| (slot.id, slot.socket.clone()))
                    .collect()
            };
            if pending.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let (id, socket) = pending[0].clone();
                return Err(WorkerError::StartFailed {
                    id,
                    reason: format!("control socket {} never answered a ping", socket.display()),
                });
            }

            let probes = pending.into_iter().map(|(id, socket)| {
                let client = Arc::clone(&self.client);
                async move {
                    let request = HelloRequest {
                        hello: format!("gatehouse-{id}"),
                    };
                    (id, client.ping(&socket, request).await)
                }
            });
            let mut unanswered = false;
            for (id, outcome) in join_all(probes).await {
                match outcome {
                    Ok(response) => {
                        let mut slots = self.slots.lock().await;
                        if let Some(slot) = slots.iter_mut().find(|slot| slot.id == id) {
                            slot.health = WorkerHealth::Healthy;
                            slot.observed = ports_from(response.resource);
                            slot.last_seen = Some(Instant::now());
                            info!(worker = id, ports = ?slot.observed, "worker ready");
                        }
                    },
                    Err(err) => {
                        debug!(worker = id, error = %err, "worker not ready yet");
                        unanswered = true;
                    },
                }
            }
            if unanswered {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }

    /// Stops every worker: SIGTERM first, then a bounded wait, then a
    /// hard kill for anything still running.
    pub async fn stop(&self) {
        let mut slots = self.slots.lock().await;
        for slot in slots.iter() {
            if let (Some(_), Some(pid)) = (&slot.child, slot.pid) {
                if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!(worker = slot.id, error = %err, "worker already gone at shutdown");
                }
            }
        }

        let deadline = self.config.workers.stop_deadline;
        let waits = slots
            .iter_mut()
            .filter_map(|slot| slot.child.take().map(|child| (slot.id, child)))
            .map(|(id, mut child)| async move {
                match timeout(deadline, child.wait()).await {
                    Ok(Ok(status)) => info!(worker = id, %status, "worker exited"),
                    Ok(Err(err)) => warn!(worker = id, error = %err, "failed to reap worker"),
                    Err(_) => {
                        warn!(worker = id, "worker ignored SIGTERM, killing");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    },
                }
            });
        join_all(waits).await;
    }

    /// Pushes one change through the two-phase protocol.
    ///
    /// Validation fans out to every worker not already failing. Any
    /// `FAIL` or timeout aborts with nothing committed; unreachable
    /// workers are excluded and marked failing; `SKILL` answers drop the
    /// worker from the commit set without counting as failure. If more
    /// than half the pool ends up unreachable the change is refused
    /// outright. The commit fan-out then goes only to workers that
    /// validated, and its failures are recorded, not rolled back.
    pub async fn apply(&self, change: Change) -> Result<PushSummary, WorkerError> {
        let mut slots = self.slots.lock().await;
        let total = slots.len();

        let targets: Vec<(usize, u32, PathBuf)> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.health != WorkerHealth::Failing)
            .map(|(index, slot)| (index, slot.id, slot.socket.clone()))
            .collect();

        let checks = targets.into_iter().map(|(index, id, socket)| {
            let client = Arc::clone(&self.client);
            let change = change.clone();
            async move { (index, id, check_call(client, socket, change).await) }
        });
        let results = join_all(checks).await;

        let mut commit_targets: Vec<usize> = Vec::new();
        let mut skipped = 0usize;
        let mut abort: Option<WorkerError> = None;
        for (index, id, outcome) in results {
            match outcome {
                Ok((StatusCode::Success, _)) => commit_targets.push(index),
                Ok((StatusCode::Skill, message)) => {
                    debug!(worker = id, message, "worker does not own this entry, skipping");
                    skipped += 1;
                },
                Ok((StatusCode::Fail, message)) => {
                    if abort.is_none() {
                        abort = Some(WorkerError::Rejected {
                            id,
                            operation: change.check_operation(),
                            message,
                        });
                    }
                },
                Err(PushError::Timeout { .. }) => {
                    if abort.is_none() {
                        abort = Some(WorkerError::Timeout {
                            id,
                            operation: change.check_operation(),
                        });
                    }
                },
                Err(err) => {
                    warn!(worker = id, error = %err, "worker unreachable during validation, excluding");
                    slots[index].health = WorkerHealth::Failing;
                },
            }
        }

        if let Some(err) = abort {
            return Err(err);
        }

        let down = slots
            .iter()
            .filter(|slot| slot.health == WorkerHealth::Failing)
            .count();
        if down * 2 > total {
            return Err(WorkerError::NoHealthyWorkers {
                available: total - down,
                total,
            });
        }

        if commit_targets.is_empty() {
            debug!(id = change.id(), "no worker owns this entry, nothing to commit");
            return Ok(PushSummary {
                applied: 0,
                skipped,
                failed: 0,
            });
        }

        let commits: Vec<_> = commit_targets
            .iter()
            .map(|&index| {
                let slot = &slots[index];
                let client = Arc::clone(&self.client);
                let socket = slot.socket.clone();
                let id = slot.id;
                let change = change.clone();
                async move { (index, id, commit_call(client, socket, change).await) }
            })
            .collect();
        let results = join_all(commits).await;

        let mut summary = PushSummary {
            applied: 0,
            skipped,
            failed: 0,
        };
        for (index, id, outcome) in results {
            match outcome {
                Ok((StatusCode::Success, _)) => {
                    match &change {
                        Change::Set(request) => {
                            slots[index].applied.insert(request.id.clone());
                        },
                        Change::Delete(request) => {
                            slots[index].applied.remove(&request.id);
                        },
                    }
                    summary.applied += 1;
                },
                Ok((_, message)) => {
                    error!(
                        worker = id,
                        operation = change.commit_operation(),
                        message,
                        "worker rejected a change it validated, marking failing"
                    );
                    slots[index].health = WorkerHealth::Failing;
                    summary.failed += 1;
                },
                Err(err) => {
                    error!(
                        worker = id,
                        operation = change.commit_operation(),
                        error = %err,
                        "worker lost during commit, marking failing"
                    );
                    slots[index].health = WorkerHealth::Failing;
                    summary.failed += 1;
                },
            }
        }
        Ok(summary)
    }

    /// One reconcile pass: ping every worker, update health, and push a
    /// refresh to any worker whose reported ports drifted from its
    /// assignment.
    pub async fn reconcile(&self) {
        let mut slots = self.slots.lock().await;
        let probes: Vec<(usize, u32, PathBuf)> = slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (index, slot.id, slot.socket.clone()))
            .collect();

        let pings = probes.into_iter().map(|(index, id, socket)| {
            let client = Arc::clone(&self.client);
            async move {
                let request = HelloRequest {
                    hello: format!("gatehouse-{id}"),
                };
                (index, id, client.ping(&socket, request).await)
            }
        });
        let results = join_all(pings).await;

        for (index, id, outcome) in results {
            let slot = &mut slots[index];
            match outcome {
                Ok(response) => {
                    if slot.health == WorkerHealth::Failing {
                        info!(worker = id, "worker answering again");
                    }
                    slot.health = WorkerHealth::Healthy;
                    slot.last_seen = Some(Instant::now());
                    slot.observed = ports_from(response.resource);
                    if slot.observed != slot.assigned {
                        warn!(
                            worker = id,
                            observed = ?slot.observed,
                            assigned = ?slot.assigned,
                            "worker port drift, refreshing"
                        );
                        let request = RefreshRequest {
                            ports: slot.assigned.iter().map(|&port| u32::from(port)).collect(),
                        };
                        match self.client.refresh(&slot.socket, request).await {
                            Ok(response) if response.status() == StatusCode::Success => {
                                slot.observed = slot.assigned.clone();
                                info!(worker = id, ports = ?slot.assigned, "worker listener set reconciled");
                            },
                            Ok(response) => {
                                warn!(worker = id, message = response.message, "worker refused refresh");
                            },
                            Err(err) => {
                                warn!(worker = id, error = %err, "refresh push failed");
                                slot.health = WorkerHealth::Failing;
                            },
                        }
                    }
                },
                Err(err) => {
                    if slot.health != WorkerHealth::Failing {
                        warn!(worker = id, error = %err, "worker unresponsive, marking failing");
                    }
                    slot.health = WorkerHealth::Failing;
                },
            }
        }
    }

    /// Runs [`reconcile`](Self::reconcile) on the configured interval
    /// until shutdown flips.
    pub async fn run_reconcile(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.workers.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },
            }
        }
    }

    /// Current view of every slot.
    pub async fn snapshot(&self) -> Vec<WorkerStatus> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .map(|slot| WorkerStatus {
                id: slot.id,
                pid: slot.pid,
                health: slot.health,
                assigned: slot.assigned.clone(),
                observed: slot.observed.clone(),
                applied: slot.applied.iter().cloned().collect(),
                last_seen_seconds: slot.last_seen.map(|seen| seen.elapsed().as_secs()),
            })
            .collect()
    }

    /// Round-robin pick of a healthy worker's data address, for the
    /// gateway relay. `None` when no worker is healthy.
    pub async fn pick_backend(&self) -> Option<SocketAddr> {
        let slots = self.slots.lock().await;
        let healthy: Vec<u16> = slots
            .iter()
            .filter(|slot| slot.health == WorkerHealth::Healthy)
            .filter_map(|slot| slot.assigned.first().copied())
            .collect();
        if healthy.is_empty() {
            return None;
        }
        let turn = self.next_backend.fetch_add(1, Ordering::Relaxed);
        Some(SocketAddr::from(([127, 0, 0, 1], healthy[turn % healthy.len()])))
    }
}

async fn check_call(
    client: Arc<dyn PushClient>,
    socket: PathBuf,
    change: Change,
) -> Result<(StatusCode, String), PushError> {
    match change {
        Change::Set(request) => client
            .set_check(&socket, request)
            .await
            .map(|response| (response.status(), response.message)),
        Change::Delete(request) => client
            .delete_check(&socket, request)
            .await
            .map(|response| (response.status(), response.message)),
    }
}

async fn commit_call(
    client: Arc<dyn PushClient>,
    socket: PathBuf,
    change: Change,
) -> Result<(StatusCode, String), PushError> {
    match change {
        Change::Set(request) => client
            .set(&socket, request)
            .await
            .map(|response| (response.status(), response.message)),
        Change::Delete(request) => client
            .delete(&socket, request)
            .await
            .map(|response| (response.status(), response.message)),
    }
}

fn ports_from(resource: Option<WorkerResource>) -> Vec<u16> {
    let mut ports: Vec<u16> = resource
        .map(|resource| {
            resource
                .ports
                .into_iter()
                .filter_map(|port| u16::try_from(port).ok())
                .collect()
        })
        .unwrap_or_default();
    ports.sort_unstable();
    ports
}

fn forward_output(id: u32, stream: &'static str, reader: impl AsyncRead + Unpin + Send + 'static) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(worker = id, stream, "{line}");
        }
    });
}
