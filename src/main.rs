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

use clap::Parser;
use linklock::config::LockConfig;
use linklock::error::{LinklockError, Result, get_exit_code};
use linklock::{Lockfile, logging};
use log::{error, warn};
use std::cmp;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{self, Command};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "linklock")]
#[command(author, version, about = "Run a command while holding an NFS-safe lockfile", long_about = None)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path of the lockfile to hold
    lockfile: PathBuf,

    /// Backoff retries before giving up ('nil' retries forever)
    #[arg(long, value_name = "N|nil")]
    retries: Option<String>,

    /// Shortest backoff sleep in seconds
    #[arg(long, value_name = "SECONDS")]
    min_sleep: Option<String>,

    /// Longest backoff sleep in seconds
    #[arg(long, value_name = "SECONDS")]
    max_sleep: Option<String>,

    /// Step between successive backoff sleeps in seconds
    #[arg(long, value_name = "SECONDS")]
    sleep_inc: Option<String>,

    /// Age in seconds past which an existing lockfile may be stolen ('nil' disables theft)
    #[arg(long, value_name = "SECONDS|nil")]
    max_age: Option<String>,

    /// Pause in seconds after stealing before claiming the lock
    #[arg(long, value_name = "SECONDS")]
    suspend: Option<String>,

    /// Interval in seconds between background mtime refreshes ('nil' disables the refresher)
    #[arg(long, value_name = "SECONDS|nil")]
    refresh: Option<String>,

    /// Wall-clock bound in seconds on the whole acquisition ('nil' waits forever)
    #[arg(long, value_name = "SECONDS|nil")]
    timeout: Option<String>,

    /// Link attempts within one polling phase
    #[arg(long, value_name = "N")]
    poll_retries: Option<String>,

    /// Cap in seconds on the random sleep between polling attempts
    #[arg(long, value_name = "SECONDS")]
    poll_max_sleep: Option<String>,

    /// Skip registration of the process-exit cleanup handler
    #[arg(long, value_name = "BOOL")]
    dont_clean: Option<String>,

    /// Skip the sweep for dead-peer staging debris before acquiring
    #[arg(long, value_name = "BOOL")]
    dont_sweep: Option<String>,

    /// Debug tracing (also enabled by LOCKFILE_DEBUG)
    #[arg(long, value_name = "BOOL")]
    debug: Option<String>,

    /// Command to run while the lock is held
    #[arg(last = true, required = true)]
    command: Vec<OsString>,
}

fn main() {
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("linklock: {err}");
            process::exit(get_exit_code(&err));
        }
    };

    let verbose = cmp::max(cli.verbose, if config.debug { 2 } else { 0 });
    logging::setup_logger(verbose);

    match run(&cli, config) {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!("{err}");
            eprintln!("linklock: {err}");
            process::exit(get_exit_code(&err));
        }
    }
}

fn run(cli: &Cli, config: LockConfig) -> Result<i32> {
    let mut lockfile = Lockfile::new(&cli.lockfile, config)?;
    lockfile.lock()?;

    let program = &cli.command[0];
    let status = Command::new(program)
        .args(&cli.command[1..])
        .status()
        .map_err(|err| LinklockError::ChildSpawn {
            command: program.to_string_lossy().into_owned(),
            details: err.to_string(),
        });

    let released = lockfile.unlock();

    let status = match status {
        Ok(status) => status,
        Err(spawn_err) => {
            if let Err(release_err) = released {
                warn!("Failed to release lock after spawn failure: {release_err}");
            }
            return Err(spawn_err);
        }
    };

    let code = exit_code_of(status);
    match released {
        Ok(()) => Ok(code),
        // The child's failure outranks ours; a clean child run with a
        // failed release surfaces the release error.
        Err(release_err) if code == 0 => Err(release_err),
        Err(release_err) => {
            warn!("Failed to release lock: {release_err}");
            Ok(code)
        }
    }
}

fn exit_code_of(status: process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

fn build_config(cli: &Cli) -> Result<LockConfig> {
    let mut config = LockConfig::default();
    if let Some(value) = &cli.retries {
        config.retries = parse_optional_count(value, "--retries")?;
    }
    if let Some(value) = &cli.min_sleep {
        config.min_sleep = parse_seconds(value, "--min-sleep")?;
    }
    if let Some(value) = &cli.max_sleep {
        config.max_sleep = parse_seconds(value, "--max-sleep")?;
    }
    if let Some(value) = &cli.sleep_inc {
        config.sleep_inc = parse_seconds(value, "--sleep-inc")?;
    }
    if let Some(value) = &cli.max_age {
        config.max_age = parse_optional_seconds(value, "--max-age")?;
    }
    if let Some(value) = &cli.suspend {
        config.suspend = parse_seconds(value, "--suspend")?;
    }
    if let Some(value) = &cli.refresh {
        config.refresh = parse_optional_seconds(value, "--refresh")?;
    }
    if let Some(value) = &cli.timeout {
        config.timeout = parse_optional_seconds(value, "--timeout")?;
    }
    if let Some(value) = &cli.poll_retries {
        config.poll_retries = parse_count(value, "--poll-retries")?;
    }
    if let Some(value) = &cli.poll_max_sleep {
        config.poll_max_sleep = parse_seconds(value, "--poll-max-sleep")?;
    }
    if let Some(value) = &cli.dont_clean {
        config.dont_clean = parse_switch(value, "--dont-clean")?;
    }
    if let Some(value) = &cli.dont_sweep {
        config.dont_sweep = parse_switch(value, "--dont-sweep")?;
    }
    if let Some(value) = &cli.debug {
        config.debug = parse_switch(value, "--debug")?;
    }
    config.validate()?;
    Ok(config)
}

fn is_nil(value: &str) -> bool {
    value.eq_ignore_ascii_case("nil") || value.eq_ignore_ascii_case("null")
}

fn parse_seconds(value: &str, flag: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| {
            LinklockError::InvalidConfig(format!(
                "{flag} expects a non-negative number of seconds, got '{value}'"
            ))
        })
}

fn parse_optional_seconds(value: &str, flag: &str) -> Result<Option<Duration>> {
    let trimmed = value.trim();
    if is_nil(trimmed) || trimmed.eq_ignore_ascii_case("false") {
        return Ok(None);
    }
    parse_seconds(trimmed, flag).map(Some)
}

fn parse_count(value: &str, flag: &str) -> Result<u32> {
    value.trim().parse::<u32>().map_err(|_| {
        LinklockError::InvalidConfig(format!(
            "{flag} expects a non-negative integer, got '{value}'"
        ))
    })
}

fn parse_optional_count(value: &str, flag: &str) -> Result<Option<u32>> {
    let trimmed = value.trim();
    if is_nil(trimmed) {
        return Ok(None);
    }
    parse_count(trimmed, flag).map(Some)
}

fn parse_switch(value: &str, flag: &str) -> Result<bool> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if trimmed.eq_ignore_ascii_case("false") || is_nil(trimmed) {
        Ok(false)
    } else {
        Err(LinklockError::InvalidConfig(format!(
            "{flag} expects 'true', 'false', or 'nil', got '{value}'"
        )))
    }
}
