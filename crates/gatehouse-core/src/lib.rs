//! Core library for the gatehouse gateway node.
//!
//! This crate holds the process-independent building blocks: the traffic
//! registry that carries listening sockets across process successions, the
//! framed push protocol between master and workers, the profession catalog
//! that validates configuration entries, the configuration store
//! abstraction, and the node configuration schema.
//!
//! The `gatehouse-daemon` crate wires these pieces into the master and
//! worker processes.

pub mod config;
pub mod profession;
pub mod push;
pub mod store;
pub mod traffic;
