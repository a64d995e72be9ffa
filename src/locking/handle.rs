// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The public lock handle.
//!
//! A handle moves through `UNHELD -> HELD -> RELEASED` exactly once; a
//! released handle is spent. While held it owns the lockfile path and the
//! staging path it was linked from; `unlock` guarantees neither name
//! exists afterwards. Drop releases best-effort so panics and early
//! returns do not strand the lock.

use crate::config::LockConfig;
use crate::error::{LinklockError, Result};
use crate::locking::acquire;
use crate::locking::cleanup::{self, CleanupSlot};
use crate::locking::contents::LockRecord;
use crate::locking::identity::{self, FileIdentity};
use crate::locking::refresher::Refresher;
use crate::locking::staging;
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// An advisory lock expressed as the existence of a file, safe on NFS.
#[derive(Debug)]
pub struct Lockfile {
    target: PathBuf,
    config: LockConfig,
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Unheld,
    Held(Box<HeldLock>),
    Released,
}

#[derive(Debug)]
struct HeldLock {
    staging_path: PathBuf,
    identity: FileIdentity,
    record: LockRecord,
    thief: bool,
    stolen: Arc<AtomicBool>,
    refresher: Option<Refresher>,
    cleanup: Option<CleanupSlot>,
}

impl Lockfile {
    /// Creates an unheld handle for `target` after validating `config`.
    pub fn new<P: Into<PathBuf>>(target: P, config: LockConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            target: target.into(),
            config,
            state: HandleState::Unheld,
        })
    }

    pub fn path(&self) -> &Path {
        &self.target
    }

    pub fn is_held(&self) -> bool {
        matches!(self.state, HandleState::Held(_))
    }

    /// Reports whether the current hold was taken by stealing a stale
    /// lockfile. `false` when not held.
    pub fn is_thief(&self) -> bool {
        match &self.state {
            HandleState::Held(held) => held.thief,
            _ => false,
        }
    }

    /// The metadata record written into the lockfile, while held.
    pub fn record(&self) -> Option<&LockRecord> {
        match &self.state {
            HandleState::Held(held) => Some(&held.record),
            _ => None,
        }
    }

    /// Acquires the lock. Fails on a handle that is already holding or
    /// has already released; each handle runs the lifecycle once.
    pub fn lock(&mut self) -> Result<()> {
        match self.state {
            HandleState::Held(_) => {
                return Err(LinklockError::AlreadyHeld {
                    path: self.target.display().to_string(),
                });
            }
            HandleState::Released => {
                return Err(LinklockError::HandleReleased {
                    path: self.target.display().to_string(),
                });
            }
            HandleState::Unheld => {}
        }

        let outcome = acquire::acquire(&self.target, &self.config)?;
        let stolen = Arc::new(AtomicBool::new(false));

        let refresher = match self.config.refresh {
            Some(every) => {
                match Refresher::spawn(
                    self.target.clone(),
                    outcome.identity,
                    every,
                    stolen.clone(),
                ) {
                    Ok(refresher) => Some(refresher),
                    Err(err) => {
                        // A lock whose liveness cannot be proven must not
                        // be held at all.
                        let _ = fs::remove_file(&self.target);
                        let _ = fs::remove_file(&outcome.staging_path);
                        return Err(err.into());
                    }
                }
            }
            None => None,
        };

        let cleanup = if self.config.dont_clean {
            None
        } else {
            cleanup::register(&self.target, &outcome.staging_path)
        };

        debug!(
            "Holding {} after {} attempt(s){}",
            self.target.display(),
            outcome.attempts,
            if outcome.thief { " as thief" } else { "" }
        );
        self.state = HandleState::Held(Box::new(HeldLock {
            staging_path: outcome.staging_path,
            identity: outcome.identity,
            record: outcome.record,
            thief: outcome.thief,
            stolen,
            refresher,
            cleanup,
        }));
        Ok(())
    }

    /// Releases the lock: stops the refresher, waits for it, then unlinks
    /// the lockfile. The staging name, normally removed during acquire,
    /// is removed again idempotently. Calling `unlock` again after a
    /// release is a no-op.
    pub fn unlock(&mut self) -> Result<()> {
        let held = match std::mem::replace(&mut self.state, HandleState::Released) {
            HandleState::Held(held) => held,
            HandleState::Unheld => {
                self.state = HandleState::Unheld;
                debug!("unlock on a handle that never held {}", self.target.display());
                return Ok(());
            }
            HandleState::Released => return Ok(()),
        };
        self.release(*held)
    }

    /// Surfaces theft observed by the refresher, or detects it directly
    /// when no refresher is running. `Ok(())` while the hold is intact.
    pub fn check(&self) -> Result<()> {
        let HandleState::Held(held) = &self.state else {
            return Ok(());
        };
        if held.stolen.load(Ordering::SeqCst) {
            return Err(LinklockError::Stolen {
                path: self.target.display().to_string(),
            });
        }
        if held.refresher.is_none() && !self.names_held_inode(held) {
            return Err(LinklockError::Stolen {
                path: self.target.display().to_string(),
            });
        }
        Ok(())
    }

    /// Refreshes the lockfile mtime immediately. For holders that run
    /// without a background refresher but still face age-based thieves.
    pub fn touch(&self) -> Result<()> {
        let HandleState::Held(held) = &self.state else {
            debug!("touch on unheld handle for {}", self.target.display());
            return Ok(());
        };
        if !self.names_held_inode(held) {
            return Err(LinklockError::Stolen {
                path: self.target.display().to_string(),
            });
        }
        identity::touch(&self.target)?;
        Ok(())
    }

    /// Runs `work` while holding the lock, releasing on every exit path.
    /// A failure of `work` is surfaced after release (release errors are
    /// then only logged); if `work` succeeds and the release is the sole
    /// failure, the release error surfaces.
    pub fn with<R, F>(&mut self, work: F) -> Result<R>
    where
        F: FnOnce() -> Result<R>,
    {
        self.lock()?;
        let outcome = work();
        let released = self.unlock();
        match (outcome, released) {
            (outcome, Ok(())) => outcome,
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(work_err), Err(release_err)) => {
                warn!(
                    "Suppressing release failure after failed critical section: {release_err}"
                );
                Err(work_err)
            }
        }
    }

    fn release(&mut self, held: HeldLock) -> Result<()> {
        let HeldLock {
            staging_path,
            identity: held_identity,
            stolen,
            refresher,
            cleanup,
            ..
        } = held;

        // The refresher must acknowledge the stop before the lockfile goes
        // away, or its final touch could land on a successor's lock.
        if let Some(refresher) = refresher {
            refresher.stop();
        }

        let was_stolen = stolen.load(Ordering::SeqCst) || {
            match FileIdentity::of(&self.target) {
                Ok(current) => current != held_identity,
                Err(_) => true,
            }
        };

        let mut result = Ok(());
        if was_stolen {
            result = Err(LinklockError::Stolen {
                path: self.target.display().to_string(),
            });
        } else if let Err(err) = fs::remove_file(&self.target) {
            if err.kind() != io::ErrorKind::NotFound {
                result = Err(LinklockError::Unlock {
                    path: self.target.display().to_string(),
                    source: err,
                });
            }
        }

        if let Err(err) = fs::remove_file(&staging_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove staging file {}: {err}",
                    staging_path.display()
                );
            }
        }

        // Deregister last; until here a crash would still unlink by name.
        drop(cleanup);

        debug!("Released lock {}", self.target.display());
        result
    }

    fn names_held_inode(&self, held: &HeldLock) -> bool {
        matches!(FileIdentity::of(&self.target), Ok(current) if current == held.identity)
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if let HandleState::Held(held) = std::mem::replace(&mut self.state, HandleState::Released)
        {
            if let Err(err) = self.release(*held) {
                warn!(
                    "Failed to release lock {} during drop: {err}",
                    self.target.display()
                );
            }
        }
    }
}

/// Atomically creates and opens a regular file at `target`, failing if it
/// already exists. The file is staged empty, hard-linked into place, and
/// verified by identity, the same step the lock acquire trusts.
pub fn create<P: AsRef<Path>>(target: P) -> Result<File> {
    let target = target.as_ref();
    let record = LockRecord::for_current_process(None);
    let staging_path = staging::create_staging_with(target, "", &record.host, record.pid)?;

    let result = (|| {
        let _ = fs::hard_link(&staging_path, target);
        if identity::same_file(&staging_path, target).unwrap_or(false) {
            let file = OpenOptions::new().read(true).write(true).open(target)?;
            Ok(file)
        } else {
            Err(LinklockError::TargetExists {
                path: target.display().to_string(),
            })
        }
    })();

    if let Err(err) = fs::remove_file(&staging_path) {
        warn!(
            "Failed to remove staging file {}: {err}",
            staging_path.display()
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config() -> LockConfig {
        LockConfig::default()
            .with_sleep(
                Duration::from_millis(5),
                Duration::from_millis(5),
                Duration::from_millis(10),
            )
            .with_polling(4, Duration::from_millis(5))
            .with_refresh(None)
            .with_max_age(None)
    }

    #[test]
    fn lock_unlock_leaves_a_clean_directory() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        let mut lockfile = Lockfile::new(&target, fast_config()).unwrap();

        lockfile.lock().unwrap();
        assert!(lockfile.is_held());
        assert!(target.exists());

        lockfile.unlock().unwrap();
        assert!(!lockfile.is_held());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn handles_run_the_lifecycle_once() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        let mut lockfile = Lockfile::new(&target, fast_config()).unwrap();

        lockfile.lock().unwrap();
        assert!(matches!(
            lockfile.lock(),
            Err(LinklockError::AlreadyHeld { .. })
        ));

        lockfile.unlock().unwrap();
        lockfile.unlock().unwrap(); // idempotent
        assert!(matches!(
            lockfile.lock(),
            Err(LinklockError::HandleReleased { .. })
        ));
    }

    #[test]
    fn unlock_before_lock_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let mut lockfile = Lockfile::new(temp.path().join("x.lock"), fast_config()).unwrap();
        lockfile.unlock().unwrap();
        assert!(!lockfile.is_held());
        lockfile.lock().unwrap();
        lockfile.unlock().unwrap();
    }

    #[test]
    fn drop_releases_the_lock() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        {
            let mut lockfile = Lockfile::new(&target, fast_config()).unwrap();
            lockfile.lock().unwrap();
            assert!(target.exists());
        }
        assert!(!target.exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn with_releases_after_failed_work() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        let mut lockfile = Lockfile::new(&target, fast_config()).unwrap();

        let err = lockfile
            .with(|| -> Result<()> {
                assert!(target.exists());
                Err(LinklockError::InvalidConfig("simulated".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, LinklockError::InvalidConfig(_)));
        assert!(!target.exists());
    }

    #[test]
    fn with_returns_the_work_value() {
        let temp = TempDir::new().unwrap();
        let mut lockfile = Lockfile::new(temp.path().join("x.lock"), fast_config()).unwrap();
        let value = lockfile.with(|| Ok(41 + 1)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn check_detects_external_removal_without_refresher() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        let mut lockfile = Lockfile::new(&target, fast_config()).unwrap();
        lockfile.lock().unwrap();
        lockfile.check().unwrap();

        fs::remove_file(&target).unwrap();
        assert!(matches!(
            lockfile.check(),
            Err(LinklockError::Stolen { .. })
        ));
        assert!(matches!(
            lockfile.unlock(),
            Err(LinklockError::Stolen { .. })
        ));
    }

    #[test]
    fn touch_keeps_a_stale_prone_lock_young() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        let mut lockfile = Lockfile::new(&target, fast_config()).unwrap();
        lockfile.lock().unwrap();

        let before = fs::metadata(&target).unwrap().modified().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        lockfile.touch().unwrap();
        let after = fs::metadata(&target).unwrap().modified().unwrap();
        assert!(after > before);
        lockfile.unlock().unwrap();
    }

    #[test]
    fn create_produces_an_empty_writable_file() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("data.txt");

        let mut file = create(&target).unwrap();
        assert_eq!(fs::metadata(&target).unwrap().len(), 0);
        file.write_all(b"payload").unwrap();
        drop(file);

        assert_eq!(fs::read_to_string(&target).unwrap(), "payload");
        // No staging siblings left behind.
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn create_refuses_an_existing_target() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("data.txt");
        fs::write(&target, b"original").unwrap();

        let err = create(&target).unwrap_err();
        assert!(matches!(err, LinklockError::TargetExists { .. }));
        assert_eq!(fs::read_to_string(&target).unwrap(), "original");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }
}
