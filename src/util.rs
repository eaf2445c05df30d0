//! Shared utility functions.

use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

pub async fn blocking_with_timeout<F, T>(duration: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(duration, spawn_blocking(f)).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Check whether a process still exists.
///
/// A process owned by another user still counts as alive (`EPERM`).
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    // Without a liveness probe we rely purely on the age threshold.
    pid != 0
}

/// Signals the engine sends to worker process groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Polite request to exit (SIGTERM).
    Terminate,
    /// Immediate kill (SIGKILL).
    Kill,
}

/// Deliver a signal to every process in a group.
///
/// Returns false when the group no longer exists.
#[cfg(unix)]
pub fn signal_process_group(pgid: u32, signal: StopSignal) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    let sig = match signal {
        StopSignal::Terminate => libc::SIGTERM,
        StopSignal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg has no memory-safety preconditions.
    unsafe { libc::killpg(pgid, sig) == 0 }
}

#[cfg(not(unix))]
pub fn signal_process_group(_pgid: u32, _signal: StopSignal) -> bool {
    false
}

/// Reduce an arbitrary name to `[a-z0-9-]`, collapsing runs of other characters.
pub fn sanitize_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let re = regex::Regex::new(r"[^a-z0-9]+").ok();
    let replaced = match re {
        Some(re) => re.replace_all(&lowered, "-").into_owned(),
        None => lowered,
    };
    let trimmed = replaced.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "run".to_string()
    } else {
        trimmed
    }
}
