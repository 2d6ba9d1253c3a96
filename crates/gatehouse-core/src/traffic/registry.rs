//! Concurrency-safe set of tracked listeners with handoff encode/decode.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tracing::{debug, warn};

use super::frame::{encode_frame, TrafficEntry, TrafficFrame};
use super::listener::{listener_name, Listener};
use super::TrafficError;

const SUPPORTED_NETWORKS: &[&str] = &["tcp", "tcp4", "tcp6"];

/// Shared backing state, held weakly by each [`Listener`] so a close can
/// deregister itself.
pub(super) struct RegistryShared {
    listeners: RwLock<HashMap<String, Arc<Listener>>>,
}

impl RegistryShared {
    /// Removes `name` only if it still maps to `who`. A listener drained
    /// before its close, or replaced by a newer bind, must not evict its
    /// successor.
    pub(super) fn deregister(&self, name: &str, who: &Listener) {
        let Ok(mut map) = self.listeners.write() else {
            return;
        };
        if map
            .get(name)
            .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), who))
        {
            map.remove(name);
        }
    }
}

/// Registry of every open network listener owned by the current process
/// generation.
///
/// Cheap to clone; clones share the same backing set.
#[derive(Clone)]
pub struct TrafficRegistry {
    shared: Arc<RegistryShared>,
}

impl Default for TrafficRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                listeners: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Returns the existing listener for `(network, address)` or binds a
    /// new one.
    ///
    /// The registry keys on the requested address text, not the resolved
    /// socket address, so the config string that bound a listener in one
    /// generation finds the adopted listener in the next. Two spellings
    /// of the same address are two entries; the second bind fails at the
    /// OS. Must be called from within the runtime.
    pub fn listen(&self, network: &str, address: &str) -> Result<Arc<Listener>, TrafficError> {
        if !SUPPORTED_NETWORKS.contains(&network) {
            return Err(TrafficError::UnsupportedNetwork {
                network: network.to_string(),
            });
        }

        let requested = listener_name(network, address);
        let mut map = self
            .shared
            .listeners
            .write()
            .map_err(|_| TrafficError::Poisoned)?;

        if let Some(existing) = map.get(&requested) {
            return Ok(Arc::clone(existing));
        }

        let std_listener =
            std::net::TcpListener::bind(address).map_err(|source| TrafficError::Bind {
                name: requested.clone(),
                source,
            })?;
        std_listener
            .set_nonblocking(true)
            .map_err(|source| TrafficError::Bind {
                name: requested.clone(),
                source,
            })?;
        let inner =
            tokio::net::TcpListener::from_std(std_listener).map_err(|source| TrafficError::Bind {
                name: requested.clone(),
                source,
            })?;

        let listener = Arc::new(Listener::new(
            network.to_string(),
            address.to_string(),
            inner,
            Arc::downgrade(&self.shared),
        ));
        debug!(listener = %listener.name(), resolved = ?listener.local_addr(), "bound listener");
        map.insert(listener.name().to_string(), Arc::clone(&listener));
        Ok(listener)
    }

    /// Atomically drains the registry, returning the previous contents.
    ///
    /// The backing map is swapped for an empty one under the write lock in
    /// O(1), so a drain never blocks concurrent `listen` calls behind a
    /// deep copy. Every listener ends up in exactly one of {returned
    /// snapshot, registry} even when the two race.
    #[must_use]
    pub fn drain(&self) -> Vec<Arc<Listener>> {
        let Ok(mut map) = self.shared.listeners.write() else {
            return Vec::new();
        };
        std::mem::take(&mut *map).into_values().collect()
    }

    /// Serializes a drained snapshot into a handoff frame plus the parallel
    /// inheritable handles.
    ///
    /// Each listener is duplicated, recorded as `{fd_index: start_index + i,
    /// address, network}`, and then the registry's own reference is closed —
    /// the duplicate is owned by the handoff transport from here on. A
    /// listener whose handle cannot be duplicated is skipped with a warning;
    /// the frame stays positionally consistent because indices are assigned
    /// after the skip.
    pub fn encode(&self, start_index: u64) -> Result<(Bytes, Vec<OwnedFd>), TrafficError> {
        let snapshot = self.drain();
        let mut entries = Vec::with_capacity(snapshot.len());
        let mut handles = Vec::with_capacity(snapshot.len());

        for listener in snapshot {
            match listener.dup_inheritable() {
                Ok(fd) => {
                    entries.push(TrafficEntry {
                        fd_index: start_index + handles.len() as u64,
                        address: listener.address().to_string(),
                        network: listener.network().to_string(),
                    });
                    handles.push(fd);
                },
                Err(err) => {
                    warn!(listener = %listener.name(), error = %err,
                          "skipping listener that cannot be duplicated for handoff");
                },
            }
            listener.close();
        }

        let bytes = encode_frame(&TrafficFrame { entries })?;
        Ok((bytes, handles))
    }

    /// Rehydrates listeners from a previously encoded frame.
    ///
    /// `handles` correlates positionally with `frame.entries`: the handle at
    /// position `i` is the live socket described by entry `i`. Must run
    /// before any new `listen` call so rehydrated addresses are found
    /// instead of re-bound, and must be called from within the runtime.
    pub fn decode(
        &self,
        frame: TrafficFrame,
        handles: Vec<OwnedFd>,
    ) -> Result<usize, TrafficError> {
        if frame.entries.len() != handles.len() {
            return Err(TrafficError::HandleMismatch {
                entries: frame.entries.len(),
                handles: handles.len(),
            });
        }

        let mut rehydrated = 0;
        for (entry, fd) in frame.entries.into_iter().zip(handles) {
            if !SUPPORTED_NETWORKS.contains(&entry.network.as_str()) {
                return Err(TrafficError::UnsupportedNetwork {
                    network: entry.network,
                });
            }

            let name = listener_name(&entry.network, &entry.address);
            let std_listener = std::net::TcpListener::from(fd);
            std_listener
                .set_nonblocking(true)
                .map_err(|source| TrafficError::Inherit {
                    name: name.clone(),
                    source,
                })?;
            let inner = tokio::net::TcpListener::from_std(std_listener).map_err(|source| {
                TrafficError::Inherit {
                    name: name.clone(),
                    source,
                }
            })?;

            let listener = Arc::new(Listener::new(
                entry.network,
                entry.address,
                inner,
                Arc::downgrade(&self.shared),
            ));

            let mut map = self
                .shared
                .listeners
                .write()
                .map_err(|_| TrafficError::Poisoned)?;
            if map
                .insert(listener.name().to_string(), listener)
                .is_some()
            {
                warn!(listener = %name, "duplicate listener in handoff frame replaced an earlier entry");
            }
            rehydrated += 1;
        }

        debug!(count = rehydrated, "rehydrated listeners from handoff frame");
        Ok(rehydrated)
    }

    /// Closes every tracked listener. Idempotent; safe to invoke from
    /// multiple shutdown paths.
    pub fn close(&self) {
        for listener in self.drain() {
            listener.close();
        }
    }

    /// Number of tracked listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.listeners.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether the registry currently tracks no listeners.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of all tracked listeners, unordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.shared
            .listeners
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of all tracked listeners without draining them.
    ///
    /// Accept loops re-snapshot on every pass so they pick up listeners
    /// rehydrated after an abandoned handoff.
    #[must_use]
    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.shared
            .listeners
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for TrafficRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficRegistry")
            .field("listeners", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::io::Cursor;

    use tokio::net::TcpStream;

    use super::super::frame::read_frame;
    use super::*;

    #[tokio::test]
    async fn test_listen_reuses_existing() {
        let registry = TrafficRegistry::new();
        let first = registry.listen("tcp", "127.0.0.1:0").unwrap();
        let second = registry
            .listen("tcp", first.address())
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_listen_rejects_unknown_network() {
        let registry = TrafficRegistry::new();
        let err = registry.listen("udp", "127.0.0.1:0").unwrap_err();
        assert!(matches!(err, TrafficError::UnsupportedNetwork { .. }));
    }

    #[tokio::test]
    async fn test_listen_surfaces_bind_errors() {
        let registry = TrafficRegistry::new();
        let err = registry.listen("tcp", "256.0.0.1:0").unwrap_err();
        assert!(matches!(err, TrafficError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_drain_empties_registry() {
        let registry = TrafficRegistry::new();
        registry.listen("tcp", "127.0.0.1:0").unwrap();
        registry.listen("tcp", "127.0.0.2:0").unwrap();

        let snapshot = registry.drain();
        assert_eq!(snapshot.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.drain().is_empty());
    }

    #[tokio::test]
    async fn test_drain_races_with_listen_without_tearing() {
        let registry = TrafficRegistry::new();
        let total = 32;

        let mut listeners = Vec::new();
        for i in 0..total {
            let registry = registry.clone();
            // Distinct loopback aliases so every task creates its own
            // entry instead of reusing a sibling's.
            let address = format!("127.0.0.{}:0", i + 1);
            listeners.push(tokio::spawn(async move {
                registry.listen("tcp", &address).unwrap().name().to_string()
            }));
        }

        let drainer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut drained = Vec::new();
                for _ in 0..8 {
                    drained.extend(registry.drain().iter().map(|l| l.name().to_string()));
                    tokio::task::yield_now().await;
                }
                drained
            })
        };

        let mut expected = HashSet::new();
        for handle in listeners {
            expected.insert(handle.await.unwrap());
        }

        let mut seen: Vec<String> = drainer.await.unwrap();
        seen.extend(registry.names());

        assert_eq!(seen.len(), total, "every listener lands exactly once");
        assert_eq!(seen.into_iter().collect::<HashSet<_>>(), expected);
    }

    #[tokio::test]
    async fn test_encode_assigns_contiguous_indices_from_offset() {
        let registry = TrafficRegistry::new();
        let first = registry.listen("tcp", "127.0.0.1:0").unwrap();
        let second = registry.listen("tcp", "127.0.0.2:0").unwrap();
        let addresses: HashSet<String> = [first.address().to_string(), second.address().to_string()]
            .into_iter()
            .collect();

        let (bytes, handles) = registry.encode(3).unwrap();
        let frame = read_frame(&mut Cursor::new(bytes.as_ref())).unwrap();

        assert_eq!(frame.entries.len(), 2);
        assert_eq!(handles.len(), 2);
        assert_eq!(frame.entries[0].fd_index, 3);
        assert_eq!(frame.entries[1].fd_index, 4);

        // Positional correlation: entry i describes the socket behind
        // handle i. The requested addresses differ in ip, so a swapped
        // pairing would be caught here.
        for (entry, fd) in frame.entries.iter().zip(&handles) {
            let probe = std::net::TcpListener::from(fd.try_clone().unwrap());
            let requested: std::net::SocketAddr = entry.address.parse().unwrap();
            assert_eq!(probe.local_addr().unwrap().ip(), requested.ip());
        }
        assert_eq!(
            frame
                .entries
                .iter()
                .map(|e| e.address.clone())
                .collect::<HashSet<_>>(),
            addresses
        );

        // The registry's own references are gone.
        assert!(registry.is_empty());
        assert!(first.is_closed());
        assert!(second.is_closed());
    }

    #[tokio::test]
    async fn test_encode_decode_round_trip_keeps_sockets_live() {
        let registry = TrafficRegistry::new();
        registry.listen("tcp", "127.0.0.1:0").unwrap();
        registry.listen("tcp", "127.0.0.2:0").unwrap();
        let names: HashSet<String> = registry.names().into_iter().collect();

        let (bytes, handles) = registry.encode(3).unwrap();
        let frame = read_frame(&mut Cursor::new(bytes.as_ref())).unwrap();

        let successor = TrafficRegistry::new();
        let count = successor.decode(frame, handles).unwrap();

        assert_eq!(count, 2);
        assert_eq!(successor.names().into_iter().collect::<HashSet<_>>(), names);

        // A rehydrated listener is found by listen() instead of re-bound,
        // and it is live: it accepts without a fresh bind.
        let address = names
            .iter()
            .next()
            .and_then(|name| name.strip_prefix("tcp://"))
            .unwrap()
            .to_string();
        let listener = successor.listen("tcp", &address).unwrap();
        assert_eq!(successor.len(), 2, "listen() reused the rehydrated socket");

        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        listener.accept().await.unwrap();
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_decode_rejects_mismatched_handle_count() {
        let registry = TrafficRegistry::new();
        registry.listen("tcp", "127.0.0.1:0").unwrap();
        let (bytes, mut handles) = registry.encode(3).unwrap();
        let frame = read_frame(&mut Cursor::new(bytes.as_ref())).unwrap();
        handles.clear();

        let successor = TrafficRegistry::new();
        let err = successor.decode(frame, handles).unwrap_err();
        assert!(matches!(err, TrafficError::HandleMismatch { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_closes_all() {
        let registry = TrafficRegistry::new();
        let listener = registry.listen("tcp", "127.0.0.1:0").unwrap();

        registry.close();
        registry.close();

        assert!(registry.is_empty());
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn test_closed_listener_leaves_registry() {
        let registry = TrafficRegistry::new();
        let listener = registry.listen("tcp", "127.0.0.1:0").unwrap();
        assert_eq!(registry.len(), 1);

        listener.close();
        assert!(registry.is_empty());
    }
}
