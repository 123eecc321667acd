// Copyright 2025 jonefeewang@gmail.com
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

use tokio::time::{Duration, Instant};

/// Idle timer for keepalive frames.
///
/// The session sleeps until [`deadline`](Self::deadline) and asks
/// [`poll_due`](Self::poll_due) whether a keepalive has to go out. Outbound
/// user writes push the deadline back. Once cancelled it never fires again.
#[derive(Debug)]
pub struct KeepaliveScheduler {
    interval: Option<Duration>,
    deadline: Option<Instant>,
    cancelled: bool,
}

impl KeepaliveScheduler {
    pub fn new(interval: Option<Duration>, now: Instant) -> Self {
        KeepaliveScheduler {
            interval,
            deadline: interval.map(|interval| now + interval),
            cancelled: false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Restarts the idle period, called on every outbound user write.
    pub fn restart(&mut self, now: Instant) {
        if self.cancelled {
            return;
        }
        self.deadline = self.interval.map(|interval| now + interval);
    }

    /// Returns true when a keepalive is due and re-arms for the next period.
    pub fn poll_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if !self.cancelled && deadline <= now => {
                self.restart(now);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.deadline = None;
    }
}
