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

mod acquire;
mod cleanup;
mod refresher;
mod staging;

pub mod backoff;
pub mod contents;
pub mod handle;
pub mod identity;
pub mod sweeper;

pub use backoff::TriangularBackoff;
pub use contents::LockRecord;
pub use handle::{Lockfile, create};
pub use identity::{FileIdentity, same_file};
pub use sweeper::{SweepReport, sweep_stale_peers};
