//! Process environment contract.
//!
//! The master and its children coordinate through a handful of
//! environment variables: which role a process plays, whether it is a
//! successor that must rehydrate listeners from standard input, and the
//! identity a worker serves under. Everything here parses eagerly so a
//! malformed environment fails at startup instead of mid-flight.

use std::path::PathBuf;

use thiserror::Error;

/// Marks a master spawned as a successor; it must read traffic frames
/// from standard input before binding anything.
pub const CONTINUE_ENV: &str = "GATEHOUSE_CONTINUE";

/// Selects the process role; absent means master.
pub const PROCESS_ENV: &str = "GATEHOUSE_PROCESS";

/// Numeric identity of a worker within the pool.
pub const WORKER_ID_ENV: &str = "GATEHOUSE_WORKER_ID";

/// Path of the Unix socket a worker serves the push protocol on.
pub const WORKER_SOCKET_ENV: &str = "GATEHOUSE_WORKER_SOCKET";

/// Monotonic process generation counter, bumped once per succession.
pub const GENERATION_ENV: &str = "GATEHOUSE_GENERATION";

/// Errors from a malformed process environment.
#[derive(Debug, Error)]
pub enum EnvError {
    /// `GATEHOUSE_PROCESS` named a role this binary does not implement.
    #[error("unknown process role {value:?}")]
    UnknownRole {
        /// The rejected value.
        value: String,
    },

    /// A variable this role requires is absent.
    #[error("missing required environment variable {name}")]
    Missing {
        /// Variable name.
        name: &'static str,
    },

    /// A variable is present but does not parse.
    #[error("invalid value {value:?} for environment variable {name}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Which half of the control plane this process runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessRole {
    /// Owns listeners, supervises workers, watches the store.
    Master,
    /// Serves the push protocol and its assigned data ports.
    Worker,
}

impl ProcessRole {
    /// Reads the role from the process environment.
    pub fn from_env() -> Result<Self, EnvError> {
        Self::parse(std::env::var(PROCESS_ENV).ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Result<Self, EnvError> {
        match value {
            None | Some("") | Some("master") => Ok(Self::Master),
            Some("worker") => Ok(Self::Worker),
            Some(other) => Err(EnvError::UnknownRole {
                value: other.to_string(),
            }),
        }
    }
}

/// Whether this process was spawned as a successor generation.
#[must_use]
pub fn is_successor() -> bool {
    std::env::var_os(CONTINUE_ENV).is_some_and(|value| !value.is_empty())
}

/// The generation counter inherited from the environment; a fresh boot
/// is generation zero.
#[must_use]
pub fn generation() -> u64 {
    std::env::var(GENERATION_ENV)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// Identity a worker process serves under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerEnv {
    /// Worker index within the pool.
    pub id: u32,
    /// Unix socket path for the push protocol.
    pub socket: PathBuf,
}

impl WorkerEnv {
    /// Reads worker identity from the process environment.
    pub fn from_env() -> Result<Self, EnvError> {
        Self::parse(
            std::env::var(WORKER_ID_ENV).ok().as_deref(),
            std::env::var_os(WORKER_SOCKET_ENV).map(PathBuf::from),
        )
    }

    fn parse(id: Option<&str>, socket: Option<PathBuf>) -> Result<Self, EnvError> {
        let raw_id = id.ok_or(EnvError::Missing {
            name: WORKER_ID_ENV,
        })?;
        let id = raw_id.parse().map_err(|_| EnvError::Invalid {
            name: WORKER_ID_ENV,
            value: raw_id.to_string(),
        })?;
        let socket = socket
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or(EnvError::Missing {
                name: WORKER_SOCKET_ENV,
            })?;
        Ok(Self { id, socket })
    }
}
