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

//! The link-and-verify acquisition loop.
//!
//! A lock attempt stages a unique sibling file, hard-links it onto the
//! target, and then decides ownership purely by comparing `(device,
//! inode)` pairs. The return value of `link(2)` is ignored in both
//! directions; over NFS it can report success for a link that was never
//! made and failure for one that was. Filesystem errors inside the polling
//! loop are expected race noise and are swallowed; only the identity
//! check decides.

use crate::config::LockConfig;
use crate::error::{LinklockError, Result};
use crate::locking::backoff::TriangularBackoff;
use crate::locking::contents::LockRecord;
use crate::locking::identity::{self, FileIdentity};
use crate::locking::staging;
use crate::locking::sweeper;
use log::{debug, info, warn};
use rand::Rng;
use std::cmp;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Consecutive polling phases in which every `link` call claimed success
/// while the identity check never matched, before the acquire gives up on
/// the filesystem entirely.
const MAX_INCONSISTENT_PHASES: u32 = 2;

/// A successful acquisition, to be wrapped in a handle by the caller.
#[derive(Debug)]
pub(crate) struct AcquireOutcome {
    pub staging_path: PathBuf,
    pub identity: FileIdentity,
    pub record: LockRecord,
    pub thief: bool,
    pub attempts: usize,
}

enum PhaseOutcome {
    Acquired { identity: FileIdentity },
    Exhausted { inconsistent: bool },
}

/// Runs the full acquire protocol for `target`.
pub(crate) fn acquire(target: &Path, config: &LockConfig) -> Result<AcquireOutcome> {
    let started = Instant::now();
    // An unrepresentable deadline is as good as no deadline.
    let deadline = config.timeout.and_then(|timeout| started.checked_add(timeout));

    if !config.dont_sweep {
        let report = sweeper::sweep_stale_peers(target);
        if report.removed > 0 || report.errors > 0 {
            debug!(
                "Sweep for {} removed {} staging file(s), {} error(s)",
                target.display(),
                report.removed,
                report.errors
            );
        }
    }

    // A fresh schedule every acquire; carrying one over would resume
    // mid-cycle.
    let mut backoff =
        TriangularBackoff::new(config.min_sleep, config.sleep_inc, config.max_sleep);
    let mut stole = false;
    let mut inconsistent_phases = 0u32;
    let mut attempt = 0usize;

    loop {
        let record = LockRecord::for_current_process(config.refresh);
        let staging_path = staging::create_staging(target, &record)?;
        let staging_identity = FileIdentity::of(&staging_path)?;

        let phase = polling_phase(target, &staging_path, staging_identity, config, &mut stole);

        match phase {
            PhaseOutcome::Acquired { identity } => {
                // The lock lives at the target name now; the staging name
                // has served its purpose. Unlock removes it again,
                // idempotently, in case this removal is lost.
                if let Err(err) = fs::remove_file(&staging_path) {
                    if err.kind() != io::ErrorKind::NotFound {
                        warn!(
                            "Failed to remove staging file {}: {err}",
                            staging_path.display()
                        );
                    }
                }
                debug!(
                    "Acquired lock {} after {} attempt(s) in {:.3}s{}",
                    target.display(),
                    attempt + 1,
                    started.elapsed().as_secs_f64(),
                    if stole { " (stolen)" } else { "" }
                );
                return Ok(AcquireOutcome {
                    staging_path,
                    identity,
                    record,
                    thief: stole,
                    attempts: attempt + 1,
                });
            }
            PhaseOutcome::Exhausted { inconsistent } => {
                // The staging file is not the lock; a dead copy here would
                // only feed future sweeps.
                if let Err(err) = fs::remove_file(&staging_path) {
                    warn!(
                        "Failed to remove staging file {}: {err}",
                        staging_path.display()
                    );
                }

                if inconsistent && config.poll_retries > 0 {
                    inconsistent_phases += 1;
                    if inconsistent_phases >= MAX_INCONSISTENT_PHASES {
                        return Err(LinklockError::LinkInconsistency {
                            path: target.display().to_string(),
                        });
                    }
                } else {
                    inconsistent_phases = 0;
                }

                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return Err(LinklockError::Timeout {
                            path: target.display().to_string(),
                            waited_secs: started.elapsed().as_secs_f64(),
                        });
                    }
                }
                if let Some(retries) = config.retries {
                    if attempt >= retries as usize {
                        return Err(LinklockError::MaxTries {
                            path: target.display().to_string(),
                            attempts: attempt + 1,
                        });
                    }
                }

                let mut delay = backoff.next_delay();
                if let Some(deadline) = deadline {
                    delay = cmp::min(delay, deadline.saturating_duration_since(Instant::now()));
                }
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// One polling phase: up to `poll_retries` link-and-verify attempts with
/// short random sleeps, stealing the target when it has grown older than
/// `max_age`.
fn polling_phase(
    target: &Path,
    staging_path: &Path,
    staging_identity: FileIdentity,
    config: &LockConfig,
    stole: &mut bool,
) -> PhaseOutcome {
    let mut polls = 0u32;
    let mut lying_links = 0u32;

    for _ in 0..config.poll_retries {
        polls += 1;
        let linked = fs::hard_link(staging_path, target).is_ok();

        match FileIdentity::of(target) {
            Ok(current) if current == staging_identity => {
                return PhaseOutcome::Acquired { identity: current };
            }
            Ok(_) if linked => lying_links += 1,
            _ => {}
        }

        if let Some(max_age) = config.max_age {
            if let Ok(age) = identity::age_of(target) {
                if age > max_age {
                    info!(
                        "Stealing lock {} (age {:.1}s exceeds {:.1}s)",
                        target.display(),
                        age.as_secs_f64(),
                        max_age.as_secs_f64()
                    );
                    if let Err(err) = fs::remove_file(target) {
                        debug!(
                            "Failed to unlink stale lock {} (racing thief?): {err}",
                            target.display()
                        );
                    }
                    *stole = true;
                    // Give the previous owner's refresher a chance to see
                    // the loss before we settle in.
                    thread::sleep(config.suspend);
                    continue;
                }
            }
        }

        thread::sleep(random_poll_sleep(config.poll_max_sleep));
    }

    PhaseOutcome::Exhausted {
        inconsistent: polls > 0 && lying_links == polls,
    }
}

fn random_poll_sleep(max: Duration) -> Duration {
    let cap = cmp::max(max.as_nanos() as u64, 1);
    Duration::from_nanos(rand::rng().random_range(0..=cap))
}
