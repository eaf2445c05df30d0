use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{LockHolder, LockManager, LockRecord};
use crate::{tlog_warn, Error, Result};

/// Lock manager for a single process.
///
/// Records live in a map; waiters park on a condvar instead of polling.
pub struct InProcessLockManager {
    records: Mutex<HashMap<String, LockRecord>>,
    released: Condvar,
    stale_after: Duration,
}

impl InProcessLockManager {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            stale_after,
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, LockRecord>> {
        // A panic while holding the map cannot leave a record half-written.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_insert(
        &self,
        records: &mut HashMap<String, LockRecord>,
        name: &str,
        holder: &LockHolder,
    ) -> bool {
        match records.get(name) {
            Some(existing) if existing.is_held_by(holder) => true,
            Some(existing) if existing.is_stale() => {
                tlog_warn!("Reclaiming stale lock '{}' from {}", name, existing.holder);
                records.insert(name.to_string(), LockRecord::new(name, holder, self.stale_after));
                true
            }
            Some(_) => false,
            None => {
                records.insert(name.to_string(), LockRecord::new(name, holder, self.stale_after));
                true
            }
        }
    }
}

impl LockManager for InProcessLockManager {
    fn try_acquire(&self, name: &str, holder: &LockHolder) -> Result<bool> {
        let mut records = self.records();
        Ok(self.try_insert(&mut records, name, holder))
    }

    fn release(&self, name: &str, holder: &LockHolder) -> Result<()> {
        let mut records = self.records();
        match records.get(name) {
            Some(record) if record.is_held_by(holder) => {
                records.remove(name);
                self.released.notify_all();
                Ok(())
            }
            _ => Err(Error::LockNotHeld {
                name: name.to_string(),
            }),
        }
    }

    fn is_stale(&self, name: &str) -> Result<bool> {
        Ok(self.records().get(name).is_some_and(LockRecord::is_stale))
    }

    fn holder(&self, name: &str) -> Result<Option<LockRecord>> {
        Ok(self.records().get(name).cloned())
    }

    fn acquire(&self, name: &str, holder: &LockHolder, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut records = self.records();
        loop {
            if self.try_insert(&mut records, name, holder) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    name: name.to_string(),
                    waited: timeout,
                });
            }
            // Wake periodically so a holder that dies without releasing is
            // noticed once its record turns stale.
            let wait = (deadline - now).min(Duration::from_millis(100));
            records = match self.released.wait_timeout(records, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
