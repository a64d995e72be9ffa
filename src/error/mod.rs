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

mod exit_codes;

pub use exit_codes::get_exit_code;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinklockError {
    #[error("failed to acquire lock {path} after {attempts} attempt(s)")]
    MaxTries { path: String, attempts: usize },

    #[error("timed out acquiring lock {path} after {waited_secs:.2}s")]
    Timeout { path: String, waited_secs: f64 },

    #[error("lock {path} no longer names the inode this process acquired")]
    Stolen { path: String },

    #[error("failed to remove held lock {path}: {source}")]
    Unlock {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "link(2) on {path} keeps reporting success while the identity check never matches; \
         the filesystem is returning inconsistent results"
    )]
    LinkInconsistency { path: String },

    #[error("invalid lock configuration: {0}")]
    InvalidConfig(String),

    #[error("lock handle for {path} is already holding the lock")]
    AlreadyHeld { path: String },

    #[error("lock handle for {path} was already released and cannot be reused")]
    HandleReleased { path: String },

    #[error("target file {path} already exists")]
    TargetExists { path: String },

    #[error("failed to run child command '{command}': {details}")]
    ChildSpawn { command: String, details: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinklockError>;
