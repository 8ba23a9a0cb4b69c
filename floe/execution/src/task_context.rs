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

//! Per-task resource context, child of a
//! [`crate::query_context::QueryContext`].

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::memory_pool::MemoryTrackingContext;

/// Notification delivered to a task when the memory situation may have
/// improved and blocked operators should re-check admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityNotification {
    MoreMemoryAvailable,
}

/// One task attempt's resource context: its slice of the query's
/// accounting trees plus a capacity-notification queue. Notifications
/// are delivered as messages, not callbacks, so consumers observe them
/// in a deterministic order on their own schedule.
pub struct TaskContext {
    task_instance_id: String,
    resume_count: u64,
    memory: MemoryTrackingContext,
    capacity_tx: mpsc::UnboundedSender<CapacityNotification>,
    capacity_rx: Mutex<Option<mpsc::UnboundedReceiver<CapacityNotification>>>,
}

impl TaskContext {
    pub(crate) fn new(
        task_instance_id: String,
        resume_count: u64,
        memory: MemoryTrackingContext,
    ) -> Self {
        let (capacity_tx, capacity_rx) = mpsc::unbounded_channel();
        Self {
            task_instance_id,
            resume_count,
            memory,
            capacity_tx,
            capacity_rx: Mutex::new(Some(capacity_rx)),
        }
    }

    pub fn task_instance_id(&self) -> &str {
        &self.task_instance_id
    }

    /// How many times this task has been re-created after failure
    /// recovery, parsed from the instance id prefix.
    pub fn resume_count(&self) -> u64 {
        self.resume_count
    }

    pub fn memory_context(&self) -> &MemoryTrackingContext {
        &self.memory
    }

    /// Hand out the consumer side of the capacity queue. Yields `Some`
    /// exactly once.
    pub fn take_capacity_events(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<CapacityNotification>> {
        self.capacity_rx.lock().take()
    }

    /// Enqueue a capacity notification. A task that never subscribed or
    /// already went away simply misses it.
    pub(crate) fn notify_capacity_changed(&self) {
        let _ = self
            .capacity_tx
            .send(CapacityNotification::MoreMemoryAvailable);
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_instance_id", &self.task_instance_id)
            .field("resume_count", &self.resume_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_pool::AggregatedMemoryContext;

    fn tracking() -> MemoryTrackingContext {
        MemoryTrackingContext::new(
            AggregatedMemoryContext::new_simple(),
            AggregatedMemoryContext::new_simple(),
            AggregatedMemoryContext::new_simple(),
        )
    }

    #[test]
    fn capacity_events_are_queued_until_read() {
        let task = TaskContext::new("1-abc".to_string(), 1, tracking());
        let mut events = task.take_capacity_events().unwrap();

        task.notify_capacity_changed();
        task.notify_capacity_changed();

        assert_eq!(
            events.try_recv().unwrap(),
            CapacityNotification::MoreMemoryAvailable
        );
        assert_eq!(
            events.try_recv().unwrap(),
            CapacityNotification::MoreMemoryAvailable
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn receiver_can_only_be_taken_once() {
        let task = TaskContext::new("0-abc".to_string(), 0, tracking());
        assert!(task.take_capacity_events().is_some());
        assert!(task.take_capacity_events().is_none());
    }

    #[test]
    fn notifying_without_a_subscriber_is_harmless() {
        let task = TaskContext::new("0-abc".to_string(), 0, tracking());
        drop(task.take_capacity_events());
        task.notify_capacity_changed();
    }
}
