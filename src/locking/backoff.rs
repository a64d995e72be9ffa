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

use std::time::Duration;

/// Triangular backoff used between acquisition retries.
///
/// Sleeps climb from `min` to `max` in steps of `inc`, descend back to
/// `min`, and repeat. Each top-level acquire constructs a fresh schedule;
/// a schedule carried over from a previous acquire would start mid-cycle.
#[derive(Debug, Clone)]
pub struct TriangularBackoff {
    min: Duration,
    max: Duration,
    inc: Duration,
    current: Duration,
    rising: bool,
}

impl TriangularBackoff {
    pub fn new(min: Duration, inc: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            inc,
            current: min,
            rising: true,
        }
    }

    /// Returns the current delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if self.rising {
            let next = self.current.saturating_add(self.inc);
            if next >= self.max {
                self.current = self.max;
                self.rising = false;
            } else {
                self.current = next;
            }
        } else {
            let next = self.current.saturating_sub(self.inc);
            if next <= self.min {
                self.current = self.min;
                self.rising = true;
            } else {
                self.current = next;
            }
        }
        delay
    }

    /// Rewinds the schedule to its starting point.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.rising = true;
    }

    pub fn peek(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(backoff: &mut TriangularBackoff, n: usize) -> Vec<u64> {
        (0..n).map(|_| backoff.next_delay().as_secs()).collect()
    }

    #[test]
    fn schedule_rises_and_falls() {
        let mut backoff = TriangularBackoff::new(
            Duration::from_secs(2),
            Duration::from_secs(2),
            Duration::from_secs(8),
        );
        assert_eq!(secs(&mut backoff, 10), [2, 4, 6, 8, 6, 4, 2, 4, 6, 8]);
    }

    #[test]
    fn step_overshooting_max_clamps() {
        let mut backoff = TriangularBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(3),
            Duration::from_secs(5),
        );
        assert_eq!(secs(&mut backoff, 5), [1, 4, 5, 2, 1]);
    }

    #[test]
    fn degenerate_range_stays_at_min() {
        let mut backoff = TriangularBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert_eq!(secs(&mut backoff, 4), [1, 1, 1, 1]);
    }

    #[test]
    fn reset_restarts_from_min() {
        let mut backoff = TriangularBackoff::new(
            Duration::from_secs(2),
            Duration::from_secs(2),
            Duration::from_secs(8),
        );
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.peek(), Duration::from_secs(2));
        assert_eq!(secs(&mut backoff, 4), [2, 4, 6, 8]);
    }
}
