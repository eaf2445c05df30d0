//! Named mutual exclusion across cooperating processes.
//!
//! A lock is a named record holding the holder's identity (pid + random
//! token) and the time it was taken. Backends differ only in where the
//! record lives: [`FileLockManager`] keeps one file per name so that
//! separate processes see each other, [`InProcessLockManager`] keeps a
//! map for single-process deployments and tests.
//!
//! Staleness is a property of the record, not the backend: a lock is
//! stale once its holder process is gone *and* the record is older than
//! the configured threshold. Only a stale lock may be reclaimed.

mod file;
mod memory;

pub use file::FileLockManager;
pub use memory::InProcessLockManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::is_process_alive;
use crate::{tlog_warn, Result};

/// Identity of a lock holder.
///
/// The token tells apart holders inside one process; the pid is what the
/// liveness probe checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub token: String,
}

impl LockHolder {
    /// A fresh holder for the calling process.
    pub fn current() -> Self {
        Self::for_pid(std::process::id())
    }

    pub fn for_pid(pid: u32) -> Self {
        Self {
            pid,
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short: String = self.token.chars().take(8).collect();
        write!(f, "pid {} ({})", self.pid, short)
    }
}

/// The persisted lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    pub holder: LockHolder,
    pub acquired_at: DateTime<Utc>,
    /// Earliest moment the lock may be reclaimed if the holder dies.
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(name: &str, holder: &LockHolder, stale_after: Duration) -> Self {
        let acquired_at = Utc::now();
        let expires_at = acquired_at
            + chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            name: name.to_string(),
            holder: holder.clone(),
            acquired_at,
            expires_at,
        }
    }

    pub fn is_held_by(&self, holder: &LockHolder) -> bool {
        self.holder == *holder
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Dead holder and past the threshold.
    pub fn is_stale(&self) -> bool {
        Utc::now() >= self.expires_at && !is_process_alive(self.holder.pid)
    }
}

/// Cross-process mutex over named resources.
///
/// Implementations must guarantee at most one holder per name and must
/// only reclaim a record that [`LockRecord::is_stale`] confirms.
pub trait LockManager: Send + Sync {
    /// Single non-blocking attempt. Reclaims a stale record first.
    fn try_acquire(&self, name: &str, holder: &LockHolder) -> Result<bool>;

    /// Remove the lock if `holder` owns it; `LockNotHeld` otherwise.
    fn release(&self, name: &str, holder: &LockHolder) -> Result<()>;

    /// Whether the current record (if any) is reclaimable.
    fn is_stale(&self, name: &str) -> Result<bool>;

    /// The current record, for status reporting.
    fn holder(&self, name: &str) -> Result<Option<LockRecord>>;

    /// Poll until acquired or `timeout` elapses (`LockTimeout`).
    fn acquire(&self, name: &str, holder: &LockHolder, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        let mut backoff = Duration::from_millis(5);
        loop {
            if self.try_acquire(name, holder)? {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= timeout {
                tlog_warn!("Lock '{}' not acquired after {:?}", name, waited);
                return Err(crate::Error::LockTimeout {
                    name: name.to_string(),
                    waited,
                });
            }
            std::thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(Duration::from_millis(100));
        }
    }
}

/// Scoped ownership of a lock; released on drop.
pub struct LockGuard<'a> {
    manager: &'a dyn LockManager,
    name: String,
    holder: LockHolder,
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(manager: &'a dyn LockManager, name: &str, timeout: Duration) -> Result<Self> {
        let holder = LockHolder::current();
        manager.acquire(name, &holder, timeout)?;
        Ok(Self {
            manager,
            name: name.to_string(),
            holder,
            released: false,
        })
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Release now and surface any error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.name, &self.holder)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.manager.release(&self.name, &self.holder) {
                tlog_warn!("Failed to release lock '{}': {}", self.name, e);
            }
        }
    }
}
