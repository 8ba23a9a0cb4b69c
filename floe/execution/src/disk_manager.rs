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

//! [`SpillSpaceTracker`]: node-wide budget for spill-disk usage.

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use floe_common::{FloeError, Result};

use crate::memory_pool::MemoryFuture;

/// Node-wide spill-disk budget shared by every query on this node.
///
/// Per-query spill ceilings live in
/// [`crate::query_context::QueryContext`]; this tracker is the second,
/// independent admission gate against the node's total spill capacity.
#[derive(Debug)]
pub struct SpillSpaceTracker {
    max_bytes: u64,
    used: AtomicU64,
}

impl SpillSpaceTracker {
    pub fn new(max_bytes: u64) -> Self {
        debug!("Created new SpillSpaceTracker(max_bytes={max_bytes})");
        Self {
            max_bytes,
            used: AtomicU64::new(0),
        }
    }

    /// Reserve `bytes` of spill space. Fails when the node-wide total
    /// would exceed the configured capacity, leaving the accounting
    /// untouched.
    pub fn reserve(&self, bytes: u64) -> Result<MemoryFuture> {
        self.used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                used.checked_add(bytes)
                    .filter(|new_used| *new_used <= self.max_bytes)
            })
            .map_err(|_| FloeError::ExceededSpillLimit {
                limit: self.max_bytes,
                per_query: false,
            })?;
        Ok(MemoryFuture::ready())
    }

    /// Return `bytes` of spill space. Never fails.
    pub fn free(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_free_track_usage() {
        let tracker = SpillSpaceTracker::new(100);

        assert!(tracker.reserve(60).unwrap().is_ready());
        assert_eq!(tracker.used_bytes(), 60);

        tracker.free(20);
        assert_eq!(tracker.used_bytes(), 40);
    }

    #[test]
    fn reserve_over_capacity_fails_without_mutating() {
        let tracker = SpillSpaceTracker::new(100);
        tracker.reserve(90).unwrap();

        let err = tracker.reserve(20).unwrap_err();
        assert!(matches!(
            err,
            FloeError::ExceededSpillLimit {
                limit: 100,
                per_query: false
            }
        ));
        assert_eq!(tracker.used_bytes(), 90);
    }
}
