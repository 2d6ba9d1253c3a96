//! Daemon processes for the gatehouse gateway control plane.
//!
//! One binary, two roles selected through the environment: the **master**
//! owns the listening sockets, supervises worker subprocesses, and
//! replays configuration changes from the replicated store into them; a
//! **worker** serves the push protocol over a Unix socket and owns its
//! assigned data-plane ports.
//!
//! The master replaces itself without dropping a connection: on the fork
//! signal it serializes its listener pools into traffic frames, spawns a
//! successor of the same binary with the live sockets attached as
//! inherited descriptors, and exits only once the successor signals it is
//! serving.

pub mod env;
pub mod master;
pub mod pidfile;
pub mod worker;
