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

//! Removal of staging debris left behind by crashed same-host peers.
//!
//! A process killed mid-acquire leaves its staging file in the lock
//! directory forever. Only peers on the same host can prove the owner is
//! gone (a pid probe means nothing across hosts), so the sweep is limited
//! to entries whose embedded hostname matches ours. Everything ambiguous
//! is left alone; the sweep is advisory and never touches the lockfile
//! itself.

use crate::locking::contents::{self, LockRecord};
use crate::locking::staging;
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::Path;
use std::process;

/// Summary of one sweep over a lock directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub kept: usize,
    pub errors: usize,
}

/// Removes staging files for `target` whose same-host owner is provably
/// dead. Failures are counted and logged, never raised.
pub fn sweep_stale_peers(target: &Path) -> SweepReport {
    sweep_with_probe(target, process_is_gone)
}

pub(crate) fn sweep_with_probe(target: &Path, probe: impl Fn(u32) -> bool) -> SweepReport {
    let mut report = SweepReport::default();

    let Ok(basename) = staging::target_basename(target) else {
        report.errors += 1;
        return report;
    };
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let own_host = contents::current_host();
    let own_pid = process::id();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("Failed to read lock directory {}: {err}", dir.display());
            report.errors += 1;
            return report;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Failed to read entry in {}: {err}", dir.display());
                report.errors += 1;
                continue;
            }
        };
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Some(parsed) = staging::parse_staging_name(&name, basename) else {
            continue;
        };
        let path = entry.path();

        if parsed.host != own_host || parsed.pid == own_pid {
            report.kept += 1;
            continue;
        }

        // The name alone is not proof of ownership; require the record
        // inside to agree. An unreadable record means the file belongs to
        // somebody we cannot reason about.
        match read_record(&path) {
            Some(record) if record.host == parsed.host && record.pid == parsed.pid => {}
            _ => {
                report.kept += 1;
                continue;
            }
        }

        if !probe(parsed.pid) {
            report.kept += 1;
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Swept staging file {} (pid {} is gone)", name, parsed.pid);
                report.removed += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!("Failed to sweep staging file {}: {err}", path.display());
                report.errors += 1;
            }
        }
    }

    report
}

/// Probes pid liveness with signal 0. Only `ESRCH` proves the process is
/// gone; `EPERM` means it exists under another uid and must be kept.
fn process_is_gone(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return false;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let text = fs::read_to_string(path).ok()?;
    LockRecord::parse(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::contents::LockRecord;
    use chrono::Utc;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_staging(dir: &Path, name: &str, record: Option<&LockRecord>) {
        let mut file = File::create(dir.join(name)).unwrap();
        if let Some(record) = record {
            file.write_all(record.encode().as_bytes()).unwrap();
        } else {
            file.write_all(b"not a record").unwrap();
        }
    }

    fn peer_record(host: &str, pid: u32) -> LockRecord {
        LockRecord {
            host: host.to_string(),
            pid,
            ppid: 1,
            tid: 0,
            time: Utc::now(),
            refresh: None,
        }
    }

    #[test]
    fn dead_same_host_peer_is_swept() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        let host = contents::current_host();
        let name = format!("x.lock.{host}.4242.0.1.5.abcd");
        write_staging(temp.path(), &name, Some(&peer_record(&host, 4242)));

        let report = sweep_with_probe(&target, |_| true);
        assert_eq!(report.removed, 1);
        assert!(!temp.path().join(&name).exists());
    }

    #[test]
    fn live_peer_is_kept() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        let host = contents::current_host();
        let name = format!("x.lock.{host}.4242.0.1.5.abcd");
        write_staging(temp.path(), &name, Some(&peer_record(&host, 4242)));

        let report = sweep_with_probe(&target, |_| false);
        assert_eq!(report.removed, 0);
        assert_eq!(report.kept, 1);
        assert!(temp.path().join(&name).exists());
    }

    #[test]
    fn foreign_host_is_kept() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        let name = "x.lock.elsewhere.example.com.4242.0.1.5.abcd";
        write_staging(
            temp.path(),
            name,
            Some(&peer_record("elsewhere.example.com", 4242)),
        );

        let report = sweep_with_probe(&target, |_| true);
        assert_eq!(report.removed, 0);
        assert!(temp.path().join(name).exists());
    }

    #[test]
    fn unreadable_record_is_kept() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        let host = contents::current_host();
        let name = format!("x.lock.{host}.4242.0.1.5.abcd");
        write_staging(temp.path(), &name, None);

        let report = sweep_with_probe(&target, |_| true);
        assert_eq!(report.removed, 0);
        assert!(temp.path().join(&name).exists());
    }

    #[test]
    fn lockfile_and_unrelated_names_are_untouched() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        File::create(&target).unwrap();
        write_staging(temp.path(), "x.lock.garbage", None);
        write_staging(temp.path(), "unrelated.txt", None);

        let report = sweep_with_probe(&target, |_| true);
        assert_eq!(report, SweepReport::default());
        assert!(target.exists());
        assert!(temp.path().join("x.lock.garbage").exists());
        assert!(temp.path().join("unrelated.txt").exists());
    }

    #[test]
    fn own_staging_files_survive() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("x.lock");
        let record = LockRecord::for_current_process(None);
        let path = staging::create_staging(&target, &record).unwrap();

        // Probe claims every pid is dead; our own entry must still be kept.
        let report = sweep_with_probe(&target, |_| true);
        assert_eq!(report.removed, 0);
        assert!(path.exists());
    }

    #[test]
    fn dead_pid_probe_detects_reaped_child() {
        let child = std::process::Command::new("true").spawn();
        let Ok(mut child) = child else {
            return; // no `true` binary in this environment
        };
        let pid = child.id();
        child.wait().unwrap();
        assert!(process_is_gone(pid));
        assert!(!process_is_gone(process::id()));
    }
}
