//! Lock records as files in a shared directory.
//!
//! Acquisition is an exclusive create (`O_EXCL`) of `<name>.lock`, so two
//! processes can never both succeed. Reclaiming a stale record and
//! releasing a held one both run under an fs2 advisory lock on
//! `<name>.guard`, which keeps a reclaimer from deleting a record that was
//! replaced after it was judged stale.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fs2::FileExt;

use super::{LockHolder, LockManager, LockRecord};
use crate::{tlog_debug, tlog_warn, Error, Result};

/// An unreadable record younger than this may still be mid-write.
const MIN_UNREADABLE_AGE: Duration = Duration::from_secs(1);

/// What a lock file currently says.
enum Observed {
    Free,
    Held(LockRecord),
    /// Present but unreadable; carries the file's age.
    Unreadable(Duration),
}

pub struct FileLockManager {
    dir: PathBuf,
    stale_after: Duration,
}

impl FileLockManager {
    pub fn new(dir: &Path, stale_after: Duration) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            stale_after,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(name)))
    }

    fn guard_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.guard", file_stem(name)))
    }

    fn observe(&self, path: &Path) -> Result<Observed> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Observed::Free),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<LockRecord>(&content) {
            Ok(record) => Ok(Observed::Held(record)),
            Err(_) => {
                // Either mid-write by a live acquirer or left by a crash.
                let age = match fs::metadata(path).and_then(|m| m.modified()) {
                    Ok(modified) => SystemTime::now()
                        .duration_since(modified)
                        .unwrap_or(Duration::ZERO),
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Observed::Free),
                    Err(e) => return Err(e.into()),
                };
                Ok(Observed::Unreadable(age))
            }
        }
    }

    fn observed_stale(&self, observed: &Observed) -> bool {
        match observed {
            Observed::Free => false,
            Observed::Held(record) => record.is_stale(),
            Observed::Unreadable(age) => *age >= self.stale_after.max(MIN_UNREADABLE_AGE),
        }
    }

    /// Run `f` while holding the per-name guard.
    fn with_guard<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let guard = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.guard_path(name))?;
        guard.lock_exclusive()?;
        let result = f();
        if let Err(e) = guard.unlock() {
            tlog_warn!("Failed to unlock guard for '{}': {}", name, e);
        }
        result
    }

    /// Remove the record if it is still the stale one we saw.
    fn reclaim(&self, name: &str, path: &Path) -> Result<bool> {
        self.with_guard(name, || {
            let observed = self.observe(path)?;
            if !self.observed_stale(&observed) {
                return Ok(false);
            }
            if let Observed::Held(ref record) = observed {
                tlog_warn!(
                    "Reclaiming stale lock '{}' from {} (held {:?})",
                    name,
                    record.holder,
                    record.age()
                );
            } else {
                tlog_warn!("Reclaiming unreadable lock record '{}'", name);
            }
            match fs::remove_file(path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn create_record(&self, path: &Path, record: &LockRecord) -> Result<bool> {
        let mut file: File = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let written = serde_json::to_vec(record)
            .map_err(Error::from)
            .and_then(|bytes| file.write_all(&bytes).map_err(Error::from))
            .and_then(|()| file.sync_all().map_err(Error::from));
        if let Err(e) = written {
            // Never leave a half-written record behind us.
            let _ = fs::remove_file(path);
            return Err(e);
        }
        Ok(true)
    }

    /// Every record in the directory, for status output.
    pub fn list(&self) -> Result<Vec<LockRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            if let Observed::Held(record) = self.observe(&path)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

impl LockManager for FileLockManager {
    fn try_acquire(&self, name: &str, holder: &LockHolder) -> Result<bool> {
        let path = self.record_path(name);
        let record = LockRecord::new(name, holder, self.stale_after);
        if self.create_record(&path, &record)? {
            tlog_debug!("Lock '{}' acquired by {}", name, holder);
            return Ok(true);
        }
        let observed = self.observe(&path)?;
        if let Observed::Held(ref existing) = observed {
            if existing.is_held_by(holder) {
                return Ok(true);
            }
        }
        if self.observed_stale(&observed) && self.reclaim(name, &path)? {
            let acquired = self.create_record(&path, &record)?;
            if acquired {
                tlog_debug!("Lock '{}' acquired by {} after reclaim", name, holder);
            }
            return Ok(acquired);
        }
        Ok(false)
    }

    fn release(&self, name: &str, holder: &LockHolder) -> Result<()> {
        let path = self.record_path(name);
        self.with_guard(name, || match self.observe(&path)? {
            Observed::Held(record) if record.is_held_by(holder) => {
                fs::remove_file(&path)?;
                tlog_debug!("Lock '{}' released by {}", name, holder);
                Ok(())
            }
            _ => Err(Error::LockNotHeld {
                name: name.to_string(),
            }),
        })
    }

    fn is_stale(&self, name: &str) -> Result<bool> {
        let observed = self.observe(&self.record_path(name))?;
        Ok(self.observed_stale(&observed))
    }

    fn holder(&self, name: &str) -> Result<Option<LockRecord>> {
        match self.observe(&self.record_path(name))? {
            Observed::Held(record) => Ok(Some(record)),
            _ => Ok(None),
        }
    }
}

/// Map a resource name onto a portable file stem.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
