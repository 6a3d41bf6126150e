//! Single-instance guard: a PID file with create-exclusive acquisition,
//! stale-holder reclaim, and release-on-drop.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::error::{EgdError, ErrorCategory};

/// An owned lock file handle. Dropping it releases and removes the file —
/// the only way ownership is relinquished, so a crash always leaves a
/// reclaimable (stale) lock rather than a cleanup hook that might not run.
pub struct LockHandle {
    path: PathBuf,
    released: bool,
}

impl LockHandle {
    /// Acquires the lock at `path`. If a live process holds it, fails with
    /// `DAEMON_ALREADY_RUNNING` unless `force` is set, in which case the
    /// "alive" check is bypassed entirely and the file is overwritten.
    pub fn acquire(path: &Path, force: bool) -> Result<Self, EgdError> {
        if !force {
            if let Some(existing_pid) = read_pid(path)? {
                if is_alive(existing_pid) {
                    return Err(EgdError::fatal(
                        "lock",
                        "DAEMON_ALREADY_RUNNING",
                        format!("pid {existing_pid} holds {}", path.display()),
                    ));
                }
                std::fs::remove_file(path).map_err(|e| {
                    EgdError::new(ErrorCategory::Fatal, "lock", "LOCK_STALE_REMOVE_FAILED", e.to_string()).with_cause(e)
                })?;
            }
        } else if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                EgdError::new(ErrorCategory::Fatal, "lock", "LOCK_FORCE_REMOVE_FAILED", e.to_string()).with_cause(e)
            })?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| classify_acquire_error(path, e))?;

        let pid = std::process::id();
        write!(file, "{pid}\n").map_err(|e| {
            EgdError::new(ErrorCategory::Fatal, "lock", "LOCK_WRITE_FAILED", e.to_string()).with_cause(e)
        })?;
        file.flush().map_err(|e| {
            EgdError::new(ErrorCategory::Fatal, "lock", "LOCK_WRITE_FAILED", e.to_string()).with_cause(e)
        })?;

        Ok(Self { path: path.to_path_buf(), released: false })
    }

    /// Releases and removes the lock file early, before drop. Idempotent.
    pub fn release(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn classify_acquire_error(path: &Path, e: std::io::Error) -> EgdError {
    if e.kind() == std::io::ErrorKind::AlreadyExists {
        EgdError::fatal(
            "lock",
            "DAEMON_ALREADY_RUNNING",
            format!("{} was created concurrently by another process", path.display()),
        )
    } else {
        EgdError::new(ErrorCategory::Fatal, "lock", "LOCK_ACQUIRE_FAILED", e.to_string()).with_cause(e)
    }
}

fn read_pid(path: &Path) -> Result<Option<i32>, EgdError> {
    let mut text = String::new();
    match std::fs::File::open(path) {
        Ok(mut f) => {
            f.read_to_string(&mut text)
                .map_err(|e| EgdError::new(ErrorCategory::Fatal, "lock", "LOCK_READ_FAILED", e.to_string()).with_cause(e))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(EgdError::new(ErrorCategory::Fatal, "lock", "LOCK_READ_FAILED", e.to_string()).with_cause(e))
        }
    }
    let pid: i32 = text
        .trim()
        .parse()
        .map_err(|_| EgdError::fatal("lock", "LOCK_CORRUPT", format!("{} does not contain a decimal pid", path.display())))?;
    Ok(Some(pid))
}

fn is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok()
}
