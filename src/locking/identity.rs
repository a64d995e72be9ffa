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

//! Filesystem identity primitives.
//!
//! Ownership of a lockfile is decided by comparing `(device, inode)` pairs,
//! never by syscall return codes: `link(2)` over NFS may report success for
//! an operation that failed or failure for one that succeeded. Link counts
//! are excluded from the comparison because NFS clients cache stale `nlink`
//! values.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::ptr;
use std::time::{Duration, SystemTime};

/// The `(device, inode)` pair naming a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    /// Reads the identity of `path` without following symlinks.
    pub fn of(path: &Path) -> io::Result<FileIdentity> {
        let meta = fs::symlink_metadata(path)?;
        Ok(FileIdentity {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

/// Reports whether two paths name the same on-disk object.
pub fn same_file(a: &Path, b: &Path) -> io::Result<bool> {
    Ok(FileIdentity::of(a)? == FileIdentity::of(b)?)
}

/// Age of `path` derived from its mtime. A clock that moved backwards
/// between the write and now yields zero rather than an error.
pub fn age_of(path: &Path) -> io::Result<Duration> {
    let meta = fs::symlink_metadata(path)?;
    let modified = meta.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

/// Sets both timestamps of `path` to the current time, like `touch(1)`,
/// without opening the file.
pub fn touch(path: &Path) -> io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), ptr::null(), 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
