//! Listener tracking and zero-downtime handoff.
//!
//! This module implements the traffic registry: the set of open listening
//! sockets owned by the current process generation, and the machinery for
//! serializing that set across an exec boundary so a successor process can
//! keep serving without closing or rebinding a single socket.
//!
//! # Architecture
//!
//! The module is organized in three layers:
//!
//! - [`listener`] — one tracked socket: idempotent close, inheritable
//!   duplication, deregistration from the owning registry.
//! - [`registry`] — the concurrency-safe set: reuse-or-create `listen`,
//!   O(1) drain, encode/decode of the handoff artifact.
//! - [`frame`] — the wire format: a length-prefixed protobuf record whose
//!   entries correlate positionally with out-of-band inherited handles.
//!
//! # Ownership
//!
//! A registry exclusively owns its listeners' OS handles until encode time.
//! Encoding duplicates each handle for the handoff transport and closes the
//! registry's own reference; the socket itself stays open (and accepting)
//! because the duplicate keeps it alive while it travels to the child.

pub mod frame;
pub mod listener;
pub mod registry;

pub use frame::{
    encode_frame, read_frame, FrameError, TrafficEntry, TrafficFrame, LENGTH_PREFIX_SIZE,
    MAX_TRAFFIC_FRAME_SIZE,
};
pub use listener::{accept_any, listener_name, Listener, INHERITED_FD_START};
pub use registry::TrafficRegistry;

use thiserror::Error;

/// Errors produced by the traffic registry and its listeners.
#[derive(Debug, Error)]
pub enum TrafficError {
    /// The OS refused to open or reuse a listener. Fatal to the
    /// configuration attempt that requested it, not to the process.
    #[error("failed to bind {name}: {source}")]
    Bind {
        /// Derived listener name.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Listener network was not one of `tcp`, `tcp4`, `tcp6`.
    #[error("unsupported listener network {network:?}")]
    UnsupportedNetwork {
        /// The rejected network string.
        network: String,
    },

    /// The listener has already been closed.
    #[error("listener {name} is closed")]
    Closed {
        /// Derived listener name.
        name: String,
    },

    /// A listener's handle could not be duplicated for handoff. The
    /// listener is skipped from the frame, not fatal to the handoff.
    #[error("failed to duplicate handle for {name}: {source}")]
    Dup {
        /// Derived listener name.
        name: String,
        /// Underlying OS error.
        #[source]
        source: nix::Error,
    },

    /// A handoff frame's entry count does not match the attached handles.
    #[error("handoff frame carries {entries} entries but {handles} handles")]
    HandleMismatch {
        /// Entries described by the frame.
        entries: usize,
        /// Handles actually attached.
        handles: usize,
    },

    /// An inherited handle could not be rehydrated into a listener.
    #[error("failed to rehydrate inherited listener {name}: {source}")]
    Inherit {
        /// Derived listener name.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Frame encoding or decoding failed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A registry lock was poisoned by a panicking holder.
    #[error("traffic registry lock poisoned")]
    Poisoned,

    /// I/O error from the underlying socket.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
