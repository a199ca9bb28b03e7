//! Single-instance lock. Two runs mutating the same attribute cache and
//! destination concurrently would race, so a run takes an exclusive lock
//! on a well-known file before doing anything else and aborts immediately
//! when another instance already holds it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CasbakError, Result};

/// Diagnostic content only; the lock itself is the OS-level exclusivity.
fn holder_note() -> String {
    format!("pid={} since={}\n", std::process::id(), chrono::Utc::now().to_rfc3339())
}

#[cfg(unix)]
pub struct InstanceLock {
    // Held for the lifetime of the run; the kernel releases the lock when
    // the descriptor closes, even on abnormal exit.
    _flock: nix::fcntl::Flock<std::fs::File>,
    path: PathBuf,
}

#[cfg(unix)]
impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        use nix::fcntl::{Flock, FlockArg};

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(mut flock) => {
                flock.set_len(0)?;
                flock.write_all(holder_note().as_bytes())?;
                debug!(path = %path.display(), "instance lock acquired");
                Ok(Self {
                    _flock: flock,
                    path: path.to_path_buf(),
                })
            }
            Err((_, _errno)) => Err(CasbakError::Locked(path.display().to_string())),
        }
    }
}

#[cfg(unix)]
impl Drop for InstanceLock {
    fn drop(&mut self) {
        // The lock itself is released by closing the descriptor; the file
        // removal is cosmetic and racing instances tolerate its absence.
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Fallback using exclusive file creation. Weaker than an OS lock (a crash
/// leaves the file behind), so a leftover file from a dead process is
/// overridden only by deleting it manually.
#[cfg(not(unix))]
pub struct InstanceLock {
    path: PathBuf,
}

#[cfg(not(unix))]
impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(holder_note().as_bytes())?;
                debug!(path = %path.display(), "instance lock acquired");
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CasbakError::Locked(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(not(unix))]
impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
