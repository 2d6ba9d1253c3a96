//! Pid file handling across process generations.
//!
//! A fresh master refuses to start while another live master holds the
//! pid file. A successor instead takes the file over: it overwrites the
//! content with its own pid while the predecessor is still draining, so
//! the file always names the current owner. Release only removes the
//! file when it still holds the releasing process's pid, which keeps the
//! exiting predecessor from deleting its successor's claim.

use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from acquiring or maintaining the pid file.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Another live process already holds the pid file.
    #[error("another instance (pid {pid}) already holds {path}")]
    AlreadyRunning {
        /// Pid recorded in the file.
        pid: i32,
        /// Pid file path.
        path: PathBuf,
    },

    /// Filesystem failure reading or writing the file.
    #[error("pid file {path}: {source}")]
    Io {
        /// Pid file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Ownership of the pid file for this process's lifetime.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: i32,
}

impl PidFile {
    /// Claims the pid file for a fresh boot.
    ///
    /// A readable file naming a live pid means another instance is
    /// running; a stale or unreadable file is overwritten.
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        if let Some(existing) = Self::read(path) {
            if process_alive(existing) {
                return Err(PidFileError::AlreadyRunning {
                    pid: existing,
                    path: path.to_path_buf(),
                });
            }
            debug!(pid = existing, path = %path.display(), "overwriting stale pid file");
        }
        Self::write(path)
    }

    /// Claims the pid file as a successor, overwriting the predecessor's
    /// entry unconditionally.
    pub fn take_over(path: &Path) -> Result<Self, PidFileError> {
        Self::write(path)
    }

    /// Pid currently recorded in `path`, if the file parses.
    #[must_use]
    pub fn read(path: &Path) -> Option<i32> {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    }

    /// The pid this handle wrote.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Removes the pid file if it still names this process.
    pub fn release(self) {
        match Self::read(&self.path) {
            Some(recorded) if recorded == self.pid => {
                if let Err(err) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %err, "failed to remove pid file");
                }
            },
            Some(recorded) => {
                debug!(
                    path = %self.path.display(),
                    owner = recorded,
                    "pid file taken over by another process, leaving it"
                );
            },
            None => {},
        }
    }

    fn write(path: &Path) -> Result<Self, PidFileError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| PidFileError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }

        let pid = std::process::id() as i32;
        std::fs::write(path, format!("{pid}\n")).map_err(|source| PidFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal zero probes existence without delivering anything. EPERM
    // still means the pid exists.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehoused.pid");

        let pidfile = PidFile::acquire(&path).unwrap();
        assert_eq!(PidFile::read(&path), Some(std::process::id() as i32));
        assert_eq!(pidfile.pid(), std::process::id() as i32);
    }

    #[test]
    fn test_acquire_refuses_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehoused.pid");
        // Our own pid is certainly alive.
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let err = PidFile::acquire(&path).unwrap_err();
        assert!(matches!(err, PidFileError::AlreadyRunning { .. }));
    }

    #[test]
    fn test_acquire_overwrites_stale_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehoused.pid");
        // Far beyond any configured pid_max, so guaranteed dead.
        std::fs::write(&path, "999999999\n").unwrap();

        let pidfile = PidFile::acquire(&path).unwrap();
        assert_eq!(PidFile::read(&path), Some(pidfile.pid()));
    }

    #[test]
    fn test_take_over_replaces_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehoused.pid");
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let pidfile = PidFile::take_over(&path).unwrap();
        assert_eq!(PidFile::read(&path), Some(pidfile.pid()));
    }

    #[test]
    fn test_release_removes_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehoused.pid");

        let pidfile = PidFile::acquire(&path).unwrap();
        pidfile.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_release_leaves_taken_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehoused.pid");

        let pidfile = PidFile::acquire(&path).unwrap();
        // A successor took the file over in the meantime.
        std::fs::write(&path, "424242\n").unwrap();

        pidfile.release();
        assert_eq!(PidFile::read(&path), Some(424242));
    }
}
