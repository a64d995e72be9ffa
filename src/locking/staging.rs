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

//! Unique staging files: the link sources for lock acquisition.
//!
//! A staging file is a sibling of the target lockfile (hard links cannot
//! cross filesystems, so it must share the directory) named
//!
//! `<lockfile_basename>.<hostname>.<pid>.<thread>.<seq>.<time_ns>.<random>`
//!
//! The tail components make collisions across processes, threads, and fast
//! restarts effectively impossible; the leading components let the sweeper
//! recognize same-host candidates and their owning pid from the name alone.

use crate::locking::contents::LockRecord;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// The owner fields recoverable from a staging file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StagingName {
    pub host: String,
    pub pid: u32,
}

/// Creates a staging file next to `target` containing the encoded record,
/// flushed to stable storage. Returns the staging path.
pub(crate) fn create_staging(target: &Path, record: &LockRecord) -> io::Result<PathBuf> {
    create_staging_with(target, &record.encode(), &record.host, record.pid)
}

/// Like [`create_staging`] but with an arbitrary body. Used by the atomic
/// create-and-open operation, whose product must start out empty.
pub(crate) fn create_staging_with(
    target: &Path,
    body: &str,
    host: &str,
    pid: u32,
) -> io::Result<PathBuf> {
    let basename = target_basename(target)?;
    let dir = target.parent().filter(|p| !p.as_os_str().is_empty());
    let name = staging_name(basename, host, pid);
    let path = match dir {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    file.write_all(body.as_bytes())?;
    file.sync_all()?;
    Ok(path)
}

/// Recovers the owning host and pid from a sibling file name, or `None`
/// when the name does not follow the staging pattern for `basename`.
pub(crate) fn parse_staging_name(name: &str, basename: &str) -> Option<StagingName> {
    let rest = name.strip_prefix(basename)?.strip_prefix('.')?;

    // The hostname may itself contain dots, so parse from the right: the
    // last five components are fixed-format, the remainder is the host.
    let mut fields = rest.rsplitn(6, '.');
    let random = fields.next()?;
    let time_ns = fields.next()?;
    let seq = fields.next()?;
    let tid = fields.next()?;
    let pid = fields.next()?;
    let host = fields.next()?;

    if random.is_empty() || host.is_empty() {
        return None;
    }
    time_ns.parse::<u128>().ok()?;
    seq.parse::<u64>().ok()?;
    tid.parse::<u64>().ok()?;
    let pid = pid.parse::<u32>().ok()?;

    Some(StagingName {
        host: host.to_string(),
        pid,
    })
}

pub(crate) fn target_basename(target: &Path) -> io::Result<&str> {
    target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("lock target {} has no usable file name", target.display()),
            )
        })
}

/// A stable numeric token for the current thread. `ThreadId` exposes no
/// numeric accessor, so this leans on its `Debug` form (`ThreadId(n)`).
pub(crate) fn current_thread_token() -> u64 {
    let repr = format!("{:?}", thread::current().id());
    repr.chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

fn staging_name(basename: &str, host: &str, pid: u32) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let time_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!(
        "{basename}.{host}.{pid}.{tid}.{seq}.{time_ns}.{random}",
        tid = current_thread_token(),
        random = Uuid::new_v4().simple()
    )
}
