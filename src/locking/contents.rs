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

//! The metadata record written into a lockfile when it is claimed.
//!
//! The record is deliberately plain `key=value` text with a hand-rolled
//! reader. Lockfiles on shared filesystems get truncated and scribbled on;
//! a reader that errors on bad input turns somebody else's corruption into
//! our crash. Anything unreadable parses to `None` and the caller treats
//! the file as owned by an unknown peer.

use crate::locking::staging;
use chrono::{DateTime, SecondsFormat, Utc};
use std::process;
use std::time::Duration;

/// Identity of the process that claimed a lockfile.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRecord {
    pub host: String,
    pub pid: u32,
    pub ppid: u32,
    pub tid: u64,
    pub time: DateTime<Utc>,
    pub refresh: Option<Duration>,
}

impl LockRecord {
    /// Builds the record describing the calling process and thread.
    pub fn for_current_process(refresh: Option<Duration>) -> Self {
        Self {
            host: current_host(),
            pid: process::id(),
            ppid: unsafe { libc::getppid() } as u32,
            tid: staging::current_thread_token(),
            time: Utc::now(),
            refresh,
        }
    }

    /// Renders the record as the lockfile body. The trailing free-form
    /// section is ignored by [`LockRecord::parse`].
    pub fn encode(&self) -> String {
        let mut body = String::new();
        body.push_str(&format!("host={}\n", self.host));
        body.push_str(&format!("pid={}\n", self.pid));
        body.push_str(&format!("ppid={}\n", self.ppid));
        body.push_str(&format!("tid={}\n", self.tid));
        body.push_str(&format!(
            "time={}\n",
            self.time.to_rfc3339_opts(SecondsFormat::Nanos, true)
        ));
        match self.refresh {
            Some(refresh) => body.push_str(&format!("refresh={}\n", refresh.as_secs_f64())),
            None => body.push_str("refresh=none\n"),
        }
        body.push('\n');
        body.push_str(&format!(
            "# claimed by linklock {}\n",
            env!("CARGO_PKG_VERSION")
        ));
        body
    }

    /// Reads a record back from lockfile text. Returns `None` for anything
    /// malformed; this function never fails.
    pub fn parse(text: &str) -> Option<LockRecord> {
        let mut host = None;
        let mut pid = None;
        let mut ppid = None;
        let mut tid = None;
        let mut time = None;
        let mut refresh = None;

        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            // First occurrence wins; later duplicates are trailing garbage.
            match key {
                "host" if host.is_none() && !value.is_empty() => host = Some(value.to_string()),
                "pid" if pid.is_none() => pid = value.parse::<u32>().ok(),
                "ppid" if ppid.is_none() => ppid = value.parse::<u32>().ok(),
                "tid" if tid.is_none() => tid = value.parse::<u64>().ok(),
                "time" if time.is_none() => {
                    time = DateTime::parse_from_rfc3339(value)
                        .ok()
                        .map(|t| t.with_timezone(&Utc));
                }
                "refresh" if refresh.is_none() => {
                    refresh = match value {
                        "none" => Some(None),
                        other => other
                            .parse::<f64>()
                            .ok()
                            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                            .map(Some),
                    };
                }
                _ => {}
            }
        }

        Some(LockRecord {
            host: host?,
            pid: pid?,
            ppid: ppid?,
            tid: tid.unwrap_or(0),
            time: time?,
            refresh: refresh.flatten(),
        })
    }
}

/// Hostname as the kernel reports it. Peers that disagree on short names
/// versus FQDNs will never consider each other same-host.
pub(crate) fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
