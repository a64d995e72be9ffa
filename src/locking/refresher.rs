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

//! Background refresh of a held lockfile's mtime.
//!
//! The refresher proves liveness to peers that judge staleness by age, and
//! it is the holder's only early warning that the lock was stolen out from
//! under it. Each cycle it re-checks that the lockfile still names the
//! inode recorded at acquire time before touching; a mismatch sets the
//! shared stolen flag and ends the task. Detection latency is bounded
//! below by the refresh interval.

use crate::locking::identity::{self, FileIdentity};
use log::{debug, warn};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A running refresher bound to one held lock.
#[derive(Debug)]
pub(crate) struct Refresher {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl Refresher {
    /// Spawns the refresh thread for `target`, which must currently name
    /// `expected`. The `stolen` flag is shared with the owning handle.
    pub(crate) fn spawn(
        target: PathBuf,
        expected: FileIdentity,
        every: Duration,
        stolen: Arc<AtomicBool>,
    ) -> io::Result<Refresher> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("linklock-refresh".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(every) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => {}
                    }

                    match FileIdentity::of(&target) {
                        Ok(current) if current == expected => {}
                        Ok(_) => {
                            warn!(
                                "Lockfile {} was replaced by another owner",
                                target.display()
                            );
                            stolen.store(true, Ordering::SeqCst);
                            return;
                        }
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {
                            warn!("Lockfile {} was removed externally", target.display());
                            stolen.store(true, Ordering::SeqCst);
                            return;
                        }
                        Err(err) => {
                            // Transient stat failure; try again next cycle.
                            warn!("Failed to stat lockfile {}: {err}", target.display());
                            continue;
                        }
                    }

                    match identity::touch(&target) {
                        Ok(()) => debug!("Refreshed lockfile {}", target.display()),
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {
                            warn!(
                                "Lockfile {} vanished before it could be refreshed",
                                target.display()
                            );
                            stolen.store(true, Ordering::SeqCst);
                            return;
                        }
                        Err(err) => {
                            warn!("Failed to refresh lockfile {}: {err}", target.display());
                        }
                    }
                }
            })?;

        Ok(Refresher { stop_tx, thread })
    }

    /// Tells the thread to stop and waits for it to acknowledge by
    /// exiting. The caller must not unlink the lockfile before this
    /// returns, or a final touch could race the removal.
    pub(crate) fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.thread.join().is_err() {
            warn!("Refresher thread panicked");
        }
    }
}
