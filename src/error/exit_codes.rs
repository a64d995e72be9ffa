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

use crate::error::LinklockError;

pub fn get_exit_code(error: &LinklockError) -> i32 {
    match error {
        LinklockError::InvalidConfig(_) => 2,

        LinklockError::MaxTries { .. } => 3,
        LinklockError::Timeout { .. } => 4,
        LinklockError::Stolen { .. } => 5,
        LinklockError::Unlock { .. } => 6,
        LinklockError::LinkInconsistency { .. } => 7,

        LinklockError::AlreadyHeld { .. } | LinklockError::HandleReleased { .. } => 8,

        LinklockError::TargetExists { .. } => 17,

        LinklockError::ChildSpawn { .. } => 127, // Standard "command not found" exit code

        _ => 1,
    }
}
