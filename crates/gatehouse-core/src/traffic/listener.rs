//! A single tracked listening socket.
//!
//! A [`Listener`] is owned by the registry that created it. Closing is
//! idempotent (one-shot gate) and deregisters the listener from its owning
//! registry before the OS handle is released, so a registry never hands out
//! a listener whose socket is already gone.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};
use std::task::Poll;

use nix::fcntl::{fcntl, FcntlArg};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::registry::RegistryShared;
use super::TrafficError;

/// Lowest descriptor slot an inheritable duplicate may occupy. Slots 0-2
/// are the child's standard streams.
pub const INHERITED_FD_START: u64 = 3;

/// Derives the stable registry name for a (network, address) pair.
#[must_use]
pub fn listener_name(network: &str, address: &str) -> String {
    format!("{network}://{address}")
}

/// One open listening socket tracked by a traffic registry.
pub struct Listener {
    name: String,
    network: String,
    address: String,
    inner: Mutex<Option<TcpListener>>,
    closed: AtomicBool,
    registry: Weak<RegistryShared>,
}

impl Listener {
    pub(super) fn new(
        network: String,
        address: String,
        inner: TcpListener,
        registry: Weak<RegistryShared>,
    ) -> Self {
        Self {
            name: listener_name(&network, &address),
            network,
            address,
            inner: Mutex::new(Some(inner)),
            closed: AtomicBool::new(false),
            registry,
        }
    }

    /// Stable name, `"<network>://<address>"`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Listener network: `tcp`, `tcp4`, or `tcp6`.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Listen address exactly as requested at bind time or carried by the
    /// handoff frame. The OS-resolved form is [`Self::local_addr`].
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Address reported by the OS, or `None` once closed.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().and_then(|l| l.local_addr().ok()))
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Accepts one inbound connection.
    ///
    /// Returns [`TrafficError::Closed`] once the listener has been closed;
    /// connections accepted before the close are unaffected.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TrafficError> {
        std::future::poll_fn(|cx| {
            let guard = match self.inner.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    return Poll::Ready(Err(TrafficError::Closed {
                        name: self.name.clone(),
                    }))
                },
            };
            match guard.as_ref() {
                Some(inner) => inner.poll_accept(cx).map_err(TrafficError::Io),
                None => Poll::Ready(Err(TrafficError::Closed {
                    name: self.name.clone(),
                })),
            }
        })
        .await
    }

    /// Duplicates the underlying OS handle as an inheritable file handle.
    ///
    /// The duplicate is created with close-on-exec set so it cannot leak
    /// into unrelated child processes; the handoff spawn path clears the
    /// flag while mapping descriptors into the successor. The registry's
    /// own handle is untouched.
    pub fn dup_inheritable(&self) -> Result<OwnedFd, TrafficError> {
        let guard = self.inner.lock().map_err(|_| TrafficError::Closed {
            name: self.name.clone(),
        })?;
        let inner = guard.as_ref().ok_or_else(|| TrafficError::Closed {
            name: self.name.clone(),
        })?;

        let dup = fcntl(
            inner.as_raw_fd(),
            FcntlArg::F_DUPFD_CLOEXEC(INHERITED_FD_START as i32),
        )
        .map_err(|source| TrafficError::Dup {
            name: self.name.clone(),
            source,
        })?;

        // SAFETY: F_DUPFD_CLOEXEC returned a freshly allocated descriptor
        // that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(dup) })
    }

    /// Closes the listener.
    ///
    /// Idempotent: any number of calls, from any number of threads, perform
    /// exactly one OS close. The listener deregisters itself from its owning
    /// registry before the handle is released.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(shared) = self.registry.upgrade() {
            shared.deregister(&self.name, self);
        }

        let taken = self.inner.lock().ok().and_then(|mut guard| guard.take());
        drop(taken);
        debug!(listener = %self.name, "closed listener");
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Accepts one connection from whichever listener is ready first.
///
/// The first result wins, success or error, so a closed listener in the
/// set surfaces as [`TrafficError::Closed`] and the caller can
/// re-snapshot its pool. `listeners` must be non-empty.
pub async fn accept_any(
    listeners: &[std::sync::Arc<Listener>],
) -> Result<(TcpStream, SocketAddr), TrafficError> {
    let pending: Vec<_> = listeners
        .iter()
        .map(|listener| {
            let listener = std::sync::Arc::clone(listener);
            Box::pin(async move { listener.accept().await })
        })
        .collect();
    let (result, _, _) = futures::future::select_all(pending).await;
    result
}
