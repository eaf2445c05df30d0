//! Durable JSON records with a single, lock-guarded write path.
//!
//! Callers never see a raw read-then-write API. Every change goes through
//! [`StateStore::mutate`], which holds the store's lock across the whole
//! read, transform, write and rename sequence, so concurrent mutations
//! from any number of processes are linearized.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::lock::{LockGuard, LockManager};
use crate::util::blocking;
use crate::{tlog_debug, tlog_warn, Error, Result};

/// A corrupt file that was set aside and replaced with an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateWarning {
    pub path: PathBuf,
    /// Where the corrupt bytes were moved; `None` if the backup failed.
    pub backup: Option<PathBuf>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl std::fmt::Display for StateWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let err = Error::StateCorruption {
            path: self.path.display().to_string(),
            reason: self.reason.clone(),
        };
        match &self.backup {
            Some(backup) => write!(f, "{} (backed up to {})", err, backup.display()),
            None => write!(f, "{} (backup failed)", err),
        }
    }
}

pub struct StateStore<T> {
    path: PathBuf,
    lock_name: String,
    locks: Arc<dyn LockManager>,
    lock_timeout: Duration,
    warnings: Mutex<Vec<StateWarning>>,
    _record: PhantomData<fn() -> T>,
}

impl<T> StateStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// A store persisted at `path`, serialized through `locks`.
    ///
    /// The lock name is derived from the file name, so two stores over the
    /// same path in different processes contend on the same lock.
    pub fn new(path: &Path, locks: Arc<dyn LockManager>, lock_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_name = format!("state:{}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            lock_name,
            locks,
            lock_timeout,
            warnings: Mutex::new(Vec::new()),
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `transform` atomically and return its result.
    ///
    /// Fails with `LockTimeout` if the lock cannot be taken; the file is
    /// untouched in that case. A corrupt file is backed up and replaced
    /// by `T::default()` before `transform` runs.
    pub fn mutate<R>(&self, transform: impl FnOnce(&mut T) -> R) -> Result<R> {
        let guard = LockGuard::acquire(self.locks.as_ref(), &self.lock_name, self.lock_timeout)?;
        let mut value = self.load_or_recover()?;
        let out = transform(&mut value);
        self.write_atomic(&value)?;
        guard.release()?;
        Ok(out)
    }

    /// Current persisted value, read under the lock.
    pub fn read(&self) -> Result<T> {
        let _guard = LockGuard::acquire(self.locks.as_ref(), &self.lock_name, self.lock_timeout)?;
        self.load_or_recover()
    }

    /// Drain corruption warnings recorded so far.
    pub fn take_warnings(&self) -> Vec<StateWarning> {
        match self.warnings.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    fn load_or_recover(&self) -> Result<T> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<T>(&contents) {
            Ok(value) => Ok(value),
            Err(e) => {
                let backup = self.backup_corrupt();
                let warning = StateWarning {
                    path: self.path.clone(),
                    backup,
                    reason: e.to_string(),
                    at: Utc::now(),
                };
                tlog_warn!("{}", warning);
                match self.warnings.lock() {
                    Ok(mut w) => w.push(warning),
                    Err(poisoned) => poisoned.into_inner().push(warning),
                }
                let value = T::default();
                self.write_atomic(&value)?;
                Ok(value)
            }
        }
    }

    fn backup_corrupt(&self) -> Option<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let file_name = self.path.file_name()?.to_string_lossy().to_string();
        let backup = self.path.with_file_name(format!("{}.corrupt-{}", file_name, stamp));
        match fs::rename(&self.path, &backup) {
            Ok(()) => Some(backup),
            Err(e) => {
                tlog_warn!("Could not back up corrupt {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn write_atomic(&self, value: &T) -> Result<()> {
        let contents = serde_json::to_vec_pretty(value)?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "state".to_string());
        let temp_path = self.path.with_file_name(format!(".{}.tmp", file_name));
        {
            use std::io::Write;
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&contents)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        tlog_debug!("State written: {}", self.path.display());
        Ok(())
    }
}

impl<T> StateStore<T>
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
{
    /// [`StateStore::mutate`] on the blocking pool.
    pub async fn update<R, F>(self: &Arc<Self>, transform: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        let store = Arc::clone(self);
        blocking(move || store.mutate(transform)).await
    }

    /// [`StateStore::read`] on the blocking pool.
    pub async fn snapshot(self: &Arc<Self>) -> Result<T> {
        let store = Arc::clone(self);
        blocking(move || store.read()).await
    }
}
