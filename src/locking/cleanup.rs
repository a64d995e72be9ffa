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

//! Last-resort cleanup of held lock paths on fatal signals.
//!
//! Normal release paths (explicit unlock, drop, panic unwind) remove the
//! lockfile and its staging sibling directly. This module covers SIGINT,
//! SIGTERM, and SIGHUP: the paths of every held lock are pre-rendered as
//! NUL-terminated strings so the signal handler only loads pointers and
//! calls `unlink(2)`: no allocation, no locks.

use log::warn;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::low_level;
use std::ffi::{CString, c_char};
use std::path::Path;
use std::ptr;
use std::sync::Once;
use std::sync::atomic::{AtomicPtr, Ordering};

const MAX_SLOTS: usize = 64;

struct Slot {
    target: AtomicPtr<c_char>,
    staging: AtomicPtr<c_char>,
}

impl Slot {
    const fn new() -> Self {
        Self {
            target: AtomicPtr::new(ptr::null_mut()),
            staging: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

static SLOTS: [Slot; MAX_SLOTS] = [const { Slot::new() }; MAX_SLOTS];
static INSTALL: Once = Once::new();

/// Registration of one held lock's paths. Dropping it withdraws the paths
/// from the signal handler's view.
#[derive(Debug)]
pub(crate) struct CleanupSlot {
    index: usize,
}

/// Registers `target` and `staging` for unlinking on a fatal signal.
/// Returns `None` when all slots are taken or a path cannot be rendered;
/// the lock still cleans up on every non-signal path.
pub(crate) fn register(target: &Path, staging: &Path) -> Option<CleanupSlot> {
    install_handlers();

    let target_c = to_cstring(target)?;
    let staging_c = to_cstring(staging)?;

    for (index, slot) in SLOTS.iter().enumerate() {
        let target_ptr = target_c.as_ptr() as *mut c_char;
        if slot
            .target
            .compare_exchange(
                ptr::null_mut(),
                target_ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            slot.staging
                .store(staging_c.into_raw(), Ordering::Release);
            std::mem::forget(target_c);
            return Some(CleanupSlot { index });
        }
    }

    warn!(
        "All {MAX_SLOTS} signal-cleanup slots are in use; {} will not be \
         unlinked if the process dies to a signal",
        target.display()
    );
    None
}

impl Drop for CleanupSlot {
    fn drop(&mut self) {
        let slot = &SLOTS[self.index];
        // The strings are withdrawn but never freed: the signal handler
        // may have loaded a pointer at any moment.
        slot.staging.store(ptr::null_mut(), Ordering::Release);
        slot.target.store(ptr::null_mut(), Ordering::Release);
    }
}

fn install_handlers() {
    INSTALL.call_once(|| {
        for signal in [SIGINT, SIGTERM, SIGHUP] {
            // Restricted to async-signal-safe operations: pointer loads
            // and the unlink syscall.
            let result = unsafe {
                low_level::register(signal, move || {
                    unlink_registered();
                    let _ = low_level::emulate_default_handler(signal);
                })
            };
            if let Err(err) = result {
                warn!("Failed to register cleanup handler for signal {signal}: {err}");
            }
        }
    });
}

fn unlink_registered() {
    for slot in &SLOTS {
        let staging = slot.staging.load(Ordering::Acquire);
        if !staging.is_null() {
            let _ = unsafe { libc::unlink(staging) };
        }
        let target = slot.target.load(Ordering::Acquire);
        if !target.is_null() {
            let _ = unsafe { libc::unlink(target) };
        }
    }
}

fn to_cstring(path: &Path) -> Option<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).ok()
}
