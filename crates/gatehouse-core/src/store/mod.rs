//! Distributed config store abstraction.
//!
//! The control plane consumes the replicated store through this narrow
//! interface: a key-value surface with prefix watches and leader
//! callbacks. The consensus implementation lives outside this crate; an
//! in-memory [`MemoryStore`] ships for single-node operation and tests.
//!
//! Watch semantics: establishing a watch first delivers `on_reset` with
//! every current pair under the prefix (also re-fired by real stores on
//! leader change), then `on_put` / `on_delete` per subsequent event.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store rejected or could not complete the operation.
    #[error("config store backend error: {reason}")]
    Backend {
        /// Implementation-specific failure description.
        reason: String,
    },

    /// The store has shut down.
    #[error("config store is closed")]
    Closed,
}

/// Receives watch events for one prefix.
#[async_trait]
pub trait WatchHandler: Send + Sync {
    /// A key under the watched prefix was created or updated.
    async fn on_put(&self, key: &str, value: &[u8]);

    /// A key under the watched prefix was removed.
    async fn on_delete(&self, key: &str);

    /// Full current state under the prefix, delivered once on watch
    /// establishment and again whenever the store resynchronizes (leader
    /// change). Handlers reconcile against this snapshot rather than
    /// assuming incremental history.
    async fn on_reset(&self, all: &[(String, Vec<u8>)]);
}

/// Runs leader-only logic, invoked once per leadership term.
#[async_trait]
pub trait LeaderHandler: Send + Sync {
    /// This node became leader for a new term.
    async fn on_leader(&self);
}

/// The key-value surface the control plane consumes.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Writes a key, replicating to the cluster and fanning out to
    /// watchers.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Removes a key, fanning out to watchers.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Whether this node currently holds leadership.
    fn is_leader(&self) -> bool;

    /// Registers a watch over `prefix`. Delivers `on_reset` with current
    /// state before returning.
    async fn watch(&self, prefix: &str, handler: Arc<dyn WatchHandler>) -> Result<(), StoreError>;

    /// Registers leader-term logic. Implementations invoke the handler
    /// exactly once per term; a store that is already leader invokes it
    /// before returning.
    async fn handle_leader(&self, handler: Arc<dyn LeaderHandler>);
}
