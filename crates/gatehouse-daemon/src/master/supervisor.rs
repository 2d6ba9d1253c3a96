//! Process generation succession.
//!
//! The master replaces itself on the fork signal: it encodes both
//! listener pools, spawns a successor of the same binary with the
//! duplicated sockets attached as inherited descriptors and the traffic
//! frames piped to its standard input, and keeps running until the
//! successor signals readiness with SIGQUIT. Only then does the
//! predecessor drain and exit.
//!
//! Signal handling is expressed as a pure decision function over typed
//! events ([`decide`]), so the state machine is testable without real
//! signals. The event loop in the master feeds it one event at a time;
//! a second fork request while a handoff is in flight is ignored, which
//! is what keeps two successions from duplicating the listener handles.
//!
//! The parent retains its own copies of the duplicated handles until the
//! successor is ready. If the spawn fails, or the successor dies before
//! signaling, the retained handles are decoded straight back into the
//! pools and the parent resumes serving on the same sockets.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use bytes::Bytes;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::dup2;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use gatehouse_core::traffic::{
    read_frame, TrafficError, TrafficFrame, TrafficRegistry, INHERITED_FD_START,
};

use crate::env;

/// Where the master stands in the succession protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuccessionState {
    /// Normal operation; no handoff in flight.
    Running,
    /// Pools encoded, successor spawn in progress.
    SpawningSuccessor,
    /// Successor alive, waiting for its readiness signal.
    AwaitingReady,
    /// Successor is serving; this generation is draining out.
    Draining,
    /// Full shutdown in progress.
    Stopping,
}

/// One typed event consumed by the succession state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The fork signal (SIGUSR2) arrived.
    ForkRequested,
    /// A successor process was spawned and fed its frames.
    SpawnSucceeded,
    /// Spawning the successor failed; pools were restored.
    SpawnFailed,
    /// SIGQUIT arrived: the readiness rendezvous during a handoff, a
    /// plain graceful-shutdown request otherwise.
    QuitReceived,
    /// The spawned successor exited.
    SuccessorExited,
    /// SIGTERM or SIGINT arrived.
    ShutdownRequested,
}

/// What the event loop must do after a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Nothing; keep serving.
    Ignore,
    /// Encode the pools and spawn a successor.
    SpawnSuccessor,
    /// Log the abandoned handoff; pools are already restored.
    AbandonHandoff,
    /// Successor died before readiness: restore pools, keep serving.
    ResumeServing,
    /// Successor is ready: drain this generation and exit.
    Drain,
    /// Graceful full shutdown: workers included.
    Shutdown,
}

/// Pure transition function: `(state, event) -> (state, action)`.
///
/// Fork requests are only honored from `Running`; every other state
/// ignores them, so concurrent handoffs cannot happen.
#[must_use]
pub const fn decide(
    state: SuccessionState,
    event: SupervisorEvent,
) -> (SuccessionState, SupervisorAction) {
    use SuccessionState::{AwaitingReady, Draining, Running, SpawningSuccessor, Stopping};
    use SupervisorAction as Action;
    use SupervisorEvent as Event;

    match (state, event) {
        (Running, Event::ForkRequested) => (SpawningSuccessor, Action::SpawnSuccessor),
        (Running, Event::QuitReceived | Event::ShutdownRequested) => (Stopping, Action::Shutdown),
        (Running, _) => (Running, Action::Ignore),

        (SpawningSuccessor, Event::SpawnSucceeded) => (AwaitingReady, Action::Ignore),
        (SpawningSuccessor, Event::SpawnFailed) => (Running, Action::AbandonHandoff),
        (SpawningSuccessor, Event::QuitReceived | Event::ShutdownRequested) => {
            (Stopping, Action::Shutdown)
        },
        (SpawningSuccessor, _) => (SpawningSuccessor, Action::Ignore),

        (AwaitingReady, Event::QuitReceived) => (Draining, Action::Drain),
        (AwaitingReady, Event::SuccessorExited) => (Running, Action::ResumeServing),
        (AwaitingReady, Event::ShutdownRequested) => (Stopping, Action::Shutdown),
        (AwaitingReady, _) => (AwaitingReady, Action::Ignore),

        (Draining, _) => (Draining, Action::Ignore),
        (Stopping, _) => (Stopping, Action::Ignore),
    }
}

/// Terminal outcome of handling one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoffOutcome {
    /// Keep serving.
    Continue,
    /// A handoff was abandoned and the pools were restored; the caller
    /// should re-assert ownership markers such as the pid file.
    Resumed,
    /// The successor is serving; drain this generation and exit.
    DrainAndExit,
    /// Graceful full shutdown.
    ShutdownAndExit,
}

/// Errors while spawning a successor. All of them leave the parent
/// serving; pools are restored before the error is reported.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Encoding a listener pool for handoff failed.
    #[error("failed to encode listener pools for handoff: {0}")]
    Encode(#[from] TrafficError),

    /// The path of the running binary could not be resolved.
    #[error("failed to resolve current executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    /// fork/exec of the successor failed.
    #[error("failed to spawn successor process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The successor was spawned but its stdin could not be fed the
    /// traffic frames; it has been killed.
    #[error("failed to feed traffic frames to successor: {0}")]
    FeedFrames(#[source] std::io::Error),
}

/// One listener pool serialized for handoff, kept restorable.
struct EncodedPool {
    frame: TrafficFrame,
    bytes: Bytes,
    handles: Vec<OwnedFd>,
}

/// Parent-side copies of both pools, held until the successor either
/// signals readiness (drop) or dies (restore).
struct RetainedHandoff {
    admin: EncodedPool,
    gateway: EncodedPool,
}

/// Drives the succession state machine and owns the successor child.
pub struct Supervisor {
    state: SuccessionState,
    admin: TrafficRegistry,
    gateway: TrafficRegistry,
    config_path: PathBuf,
    generation: u64,
    child: Option<Child>,
    retained: Option<RetainedHandoff>,
}

impl Supervisor {
    /// Creates a supervisor over the master's two listener pools.
    #[must_use]
    pub fn new(
        admin: TrafficRegistry,
        gateway: TrafficRegistry,
        config_path: PathBuf,
        generation: u64,
    ) -> Self {
        Self {
            state: SuccessionState::Running,
            admin,
            gateway,
            config_path,
            generation,
            child: None,
            retained: None,
        }
    }

    /// Current succession state, for the status surface.
    #[must_use]
    pub fn state(&self) -> SuccessionState {
        self.state
    }

    /// Resolves once the spawned successor exits; pends forever while no
    /// successor is outstanding. Safe to poll from a select loop.
    pub async fn child_exited(&mut self) -> Option<ExitStatus> {
        match self.child.as_mut() {
            Some(child) => child.wait().await.ok(),
            None => std::future::pending().await,
        }
    }

    /// Feeds one event through [`decide`] and executes the resulting
    /// action. Spawn outcomes are fed back in as events until the
    /// machine settles.
    pub async fn handle_event(&mut self, event: SupervisorEvent) -> HandoffOutcome {
        let mut event = event;
        loop {
            let (next, action) = decide(self.state, event);
            if next != self.state {
                info!(from = ?self.state, to = ?next, ?event, "succession transition");
            } else {
                debug!(state = ?self.state, ?event, ?action, "succession event");
            }
            self.state = next;

            match action {
                SupervisorAction::Ignore => return HandoffOutcome::Continue,
                SupervisorAction::SpawnSuccessor => {
                    event = match self.spawn_successor().await {
                        Ok(pid) => {
                            info!(
                                successor = pid,
                                generation = self.generation + 1,
                                "successor spawned, awaiting readiness"
                            );
                            SupervisorEvent::SpawnSucceeded
                        },
                        Err(err) => {
                            error!(error = %err, "successor spawn failed");
                            SupervisorEvent::SpawnFailed
                        },
                    };
                },
                SupervisorAction::AbandonHandoff => {
                    warn!("handoff abandoned, continuing to serve this generation");
                    return HandoffOutcome::Continue;
                },
                SupervisorAction::ResumeServing => {
                    warn!("successor exited before signaling readiness");
                    self.child = None;
                    self.restore_pools();
                    return HandoffOutcome::Resumed;
                },
                SupervisorAction::Drain => {
                    // Dropping the retained handles closes the parent's
                    // copies; the successor's descriptors keep every
                    // socket open.
                    self.retained = None;
                    return HandoffOutcome::DrainAndExit;
                },
                SupervisorAction::Shutdown => {
                    self.retained = None;
                    return HandoffOutcome::ShutdownAndExit;
                },
            }
        }
    }

    /// Encodes both pools and spawns the successor. On any failure the
    /// pools are restored before returning.
    async fn spawn_successor(&mut self) -> Result<u32, SpawnError> {
        let admin = encode_pool(&self.admin, INHERITED_FD_START)?;
        let gateway = match encode_pool(
            &self.gateway,
            INHERITED_FD_START + admin.handles.len() as u64,
        ) {
            Ok(pool) => pool,
            Err(err) => {
                restore_into(&self.admin, admin);
                return Err(err);
            },
        };

        let retained = RetainedHandoff { admin, gateway };
        match self.exec_successor(&retained).await {
            Ok((child, pid)) => {
                self.child = Some(child);
                self.retained = Some(retained);
                Ok(pid)
            },
            Err(err) => {
                restore_into(&self.admin, retained.admin);
                restore_into(&self.gateway, retained.gateway);
                Err(err)
            },
        }
    }

    /// Spawns the successor process with the inherited descriptors
    /// mapped to the slots the frames describe, then pipes both frames
    /// to its stdin, admin pool first.
    async fn exec_successor(&self, retained: &RetainedHandoff) -> Result<(Child, u32), SpawnError> {
        let exe = std::env::current_exe().map_err(SpawnError::CurrentExe)?;

        let sources: Vec<RawFd> = retained
            .admin
            .handles
            .iter()
            .chain(&retained.gateway.handles)
            .map(AsRawFd::as_raw_fd)
            .collect();
        let scratch = vec![-1 as RawFd; sources.len()];
        let park_floor = INHERITED_FD_START as RawFd + sources.len() as RawFd;

        let mut command = Command::new(exe);
        command
            .arg("--config")
            .arg(&self.config_path)
            .env(env::CONTINUE_ENV, "1")
            .env(env::GENERATION_ENV, (self.generation + 1).to_string())
            .env_remove(env::PROCESS_ENV)
            .stdin(Stdio::piped())
            .kill_on_drop(false);
        // SAFETY: remap_inherited_fds only issues fcntl/dup2 syscalls on
        // descriptors owned by this spawn, with no allocation after the
        // fork; the scratch buffer is preallocated above.
        unsafe {
            let mut scratch = scratch;
            command.pre_exec(move || remap_inherited_fds(&sources, &mut scratch, park_floor));
        }

        let mut child = command.spawn().map_err(SpawnError::Spawn)?;
        let pid = child.id().unwrap_or_default();

        let feed = async {
            let stdin = child.stdin.as_mut().ok_or_else(|| {
                std::io::Error::other("successor spawned without a stdin pipe")
            })?;
            stdin.write_all(&retained.admin.bytes).await?;
            stdin.write_all(&retained.gateway.bytes).await?;
            stdin.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        if let Err(err) = feed.await {
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Err(SpawnError::FeedFrames(err));
        }
        // The successor has read what it needs once it sees both frames;
        // closing our end is the cleanest EOF.
        drop(child.stdin.take());

        Ok((child, pid))
    }

    fn restore_pools(&mut self) {
        if let Some(retained) = self.retained.take() {
            restore_into(&self.admin, retained.admin);
            restore_into(&self.gateway, retained.gateway);
        }
    }
}

fn encode_pool(registry: &TrafficRegistry, start_index: u64) -> Result<EncodedPool, SpawnError> {
    let (bytes, handles) = registry.encode(start_index)?;
    let mut raw: &[u8] = &bytes;
    let frame = read_frame(&mut raw).map_err(TrafficError::from)?;
    Ok(EncodedPool {
        frame,
        bytes,
        handles,
    })
}

/// Decodes a retained pool back into its registry after an abandoned
/// handoff. The sockets never closed, so service resumes on them as-is.
fn restore_into(registry: &TrafficRegistry, pool: EncodedPool) {
    let count = pool.handles.len();
    match registry.decode(pool.frame, pool.handles) {
        Ok(restored) => {
            warn!(listeners = restored, "restored listener pool after abandoned handoff");
        },
        Err(err) => {
            error!(
                error = %err,
                listeners = count,
                "failed to restore listener pool after abandoned handoff"
            );
        },
    }
}

/// Maps the duplicated listener descriptors into the contiguous slots
/// starting at [`INHERITED_FD_START`], in frame order.
///
/// Runs between fork and exec. Two passes: every source is first parked
/// above the target window with `F_DUPFD_CLOEXEC`, then `dup2`'d into
/// its slot. A source already sitting inside the target window would
/// otherwise be clobbered before it was copied. The parked duplicates
/// carry close-on-exec and vanish at exec; the `dup2` targets do not,
/// which is what lets them survive into the successor.
fn remap_inherited_fds(
    sources: &[RawFd],
    scratch: &mut [RawFd],
    park_floor: RawFd,
) -> std::io::Result<()> {
    for (index, &source) in sources.iter().enumerate() {
        let parked = fcntl(source, FcntlArg::F_DUPFD_CLOEXEC(park_floor))
            .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
        scratch[index] = parked;
    }
    for (index, &parked) in scratch.iter().enumerate() {
        let target = INHERITED_FD_START as RawFd + index as RawFd;
        dup2(parked, target)
            .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const ALL_EVENTS: [SupervisorEvent; 6] = [
        SupervisorEvent::ForkRequested,
        SupervisorEvent::SpawnSucceeded,
        SupervisorEvent::SpawnFailed,
        SupervisorEvent::QuitReceived,
        SupervisorEvent::SuccessorExited,
        SupervisorEvent::ShutdownRequested,
    ];

    #[test]
    fn test_fork_request_starts_exactly_one_spawn() {
        let (state, action) = decide(SuccessionState::Running, SupervisorEvent::ForkRequested);
        assert_eq!(state, SuccessionState::SpawningSuccessor);
        assert_eq!(action, SupervisorAction::SpawnSuccessor);
    }

    #[test]
    fn test_fork_storm_spawns_exactly_once() {
        // A second fork request before the child signals readiness must
        // not duplicate the handoff.
        let events = [
            SupervisorEvent::ForkRequested,
            SupervisorEvent::ForkRequested,
            SupervisorEvent::SpawnSucceeded,
            SupervisorEvent::ForkRequested,
            SupervisorEvent::ForkRequested,
        ];

        let mut state = SuccessionState::Running;
        let mut spawns = 0;
        for event in events {
            let (next, action) = decide(state, event);
            if action == SupervisorAction::SpawnSuccessor {
                spawns += 1;
            }
            state = next;
        }

        assert_eq!(spawns, 1);
        assert_eq!(state, SuccessionState::AwaitingReady);
    }

    #[test]
    fn test_readiness_signal_drains_predecessor() {
        let (state, action) = decide(SuccessionState::AwaitingReady, SupervisorEvent::QuitReceived);
        assert_eq!(state, SuccessionState::Draining);
        assert_eq!(action, SupervisorAction::Drain);
    }

    #[test]
    fn test_successor_death_resumes_serving() {
        let (state, action) = decide(
            SuccessionState::AwaitingReady,
            SupervisorEvent::SuccessorExited,
        );
        assert_eq!(state, SuccessionState::Running);
        assert_eq!(action, SupervisorAction::ResumeServing);
    }

    #[test]
    fn test_spawn_failure_returns_to_running() {
        let (state, action) = decide(
            SuccessionState::SpawningSuccessor,
            SupervisorEvent::SpawnFailed,
        );
        assert_eq!(state, SuccessionState::Running);
        assert_eq!(action, SupervisorAction::AbandonHandoff);
    }

    #[test]
    fn test_quit_without_handoff_is_graceful_shutdown() {
        let (state, action) = decide(SuccessionState::Running, SupervisorEvent::QuitReceived);
        assert_eq!(state, SuccessionState::Stopping);
        assert_eq!(action, SupervisorAction::Shutdown);
    }

    #[test]
    fn test_shutdown_wins_over_pending_handoff() {
        let (state, action) = decide(
            SuccessionState::AwaitingReady,
            SupervisorEvent::ShutdownRequested,
        );
        assert_eq!(state, SuccessionState::Stopping);
        assert_eq!(action, SupervisorAction::Shutdown);
    }

    #[test]
    fn test_terminal_states_are_inert() {
        for state in [SuccessionState::Draining, SuccessionState::Stopping] {
            for event in ALL_EVENTS {
                let (next, action) = decide(state, event);
                assert_eq!(next, state);
                assert_eq!(action, SupervisorAction::Ignore);
            }
        }
    }

    #[tokio::test]
    async fn test_encode_then_restore_round_trips_the_pool() {
        let registry = TrafficRegistry::new();
        registry.listen("tcp", "127.0.0.1:0").unwrap();
        registry.listen("tcp", "127.0.0.2:0").unwrap();
        let names: HashSet<String> = registry.names().into_iter().collect();

        let pool = encode_pool(&registry, INHERITED_FD_START).unwrap();
        assert!(registry.is_empty());
        assert_eq!(pool.frame.entries.len(), 2);
        assert_eq!(pool.handles.len(), 2);

        restore_into(&registry, pool);
        assert_eq!(registry.names().into_iter().collect::<HashSet<_>>(), names);

        // The restored sockets still accept.
        let listener = registry.listeners().into_iter().next().unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { tokio::net::TcpStream::connect(addr).await });
        listener.accept().await.unwrap();
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_encode_offsets_follow_admin_pool_size() {
        let admin = TrafficRegistry::new();
        admin.listen("tcp", "127.0.0.1:0").unwrap();
        let gateway = TrafficRegistry::new();
        gateway.listen("tcp", "127.0.0.1:0").unwrap();
        gateway.listen("tcp", "127.0.0.2:0").unwrap();

        let admin_pool = encode_pool(&admin, INHERITED_FD_START).unwrap();
        let gateway_pool = encode_pool(
            &gateway,
            INHERITED_FD_START + admin_pool.handles.len() as u64,
        )
        .unwrap();

        assert_eq!(admin_pool.frame.entries[0].fd_index, 3);
        assert_eq!(gateway_pool.frame.entries[0].fd_index, 4);
        assert_eq!(gateway_pool.frame.entries[1].fd_index, 5);
    }
}
