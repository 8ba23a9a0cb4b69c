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

//! [`QueryContext`]: per-query root of the resource hierarchy.
//!
//! The context enforces the query's user/total memory ceilings and its
//! spill-disk ceiling, owns the three accounting trees, and arbitrates
//! pool migration. Lock order is fixed: a user allocation locks its
//! accounting tree first and the query context second. Nothing that
//! runs under the query context lock may depend on tree-lock state;
//! the system-memory path therefore sources its admission total from
//! the memory pool's ledger, which the pool guards independently.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use floe_common::{human_readable_size, FloeError, Result};

use crate::disk_manager::SpillSpaceTracker;
use crate::memory_pool::{
    AggregatedMemoryContext, MemoryFuture, MemoryPool, MemoryReservationHandler,
    MemoryTrackingContext,
};
use crate::query_id::QueryId;
use crate::task_context::TaskContext;

/// Two-phase construction for [`QueryContext`]: limits and dependencies
/// are bound here, then frozen at [`Self::build`]. The only sanctioned
/// post-build limit change is the one-shot
/// [`QueryContext::set_resource_overcommit`].
pub struct QueryContextBuilder {
    query_id: QueryId,
    memory_pool: Arc<MemoryPool>,
    spill_space_tracker: Arc<SpillSpaceTracker>,
    max_user_memory: u64,
    max_total_memory: u64,
    max_spill: u64,
    notification_runtime: Option<Handle>,
}

impl QueryContextBuilder {
    /// Defaults: unlimited memory ceilings, spill disabled (zero-byte
    /// spill budget).
    pub fn new(
        query_id: QueryId,
        memory_pool: Arc<MemoryPool>,
        spill_space_tracker: Arc<SpillSpaceTracker>,
    ) -> Self {
        Self {
            query_id,
            memory_pool,
            spill_space_tracker,
            max_user_memory: u64::MAX,
            max_total_memory: u64::MAX,
            max_spill: 0,
            notification_runtime: None,
        }
    }

    pub fn with_max_user_memory(mut self, bytes: u64) -> Self {
        self.max_user_memory = bytes;
        self
    }

    pub fn with_max_total_memory(mut self, bytes: u64) -> Self {
        self.max_total_memory = bytes;
        self
    }

    pub fn with_max_spill(mut self, bytes: u64) -> Self {
        self.max_spill = bytes;
        self
    }

    /// Runtime used to deliver pool-migration notifications. Defaults
    /// to the runtime the builder runs on.
    pub fn with_notification_runtime(mut self, handle: Handle) -> Self {
        self.notification_runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<Arc<QueryContext>> {
        let notification_runtime = match self.notification_runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| {
                FloeError::Internal(
                    "QueryContext requires a tokio runtime for migration notifications"
                        .to_string(),
                )
            })?,
        };
        Ok(Arc::new_cyclic(|context: &Weak<QueryContext>| {
            let user = AggregatedMemoryContext::new_root(Arc::new(
                QueryMemoryReservationHandler {
                    context: context.clone(),
                    kind: MemoryAllocationKind::User,
                },
            ));
            let revocable = AggregatedMemoryContext::new_root(Arc::new(
                QueryMemoryReservationHandler {
                    context: context.clone(),
                    kind: MemoryAllocationKind::Revocable,
                },
            ));
            let system = AggregatedMemoryContext::new_root(Arc::new(
                QueryMemoryReservationHandler {
                    context: context.clone(),
                    kind: MemoryAllocationKind::System,
                },
            ));
            QueryContext {
                query_id: self.query_id,
                max_spill: self.max_spill,
                spill_space_tracker: self.spill_space_tracker,
                notification_runtime,
                memory: MemoryTrackingContext::new(user, revocable, system),
                state: Mutex::new(QueryContextState {
                    max_user_memory: self.max_user_memory,
                    max_total_memory: self.max_total_memory,
                    memory_pool: self.memory_pool,
                    spill_used: 0,
                    overcommit: false,
                }),
                task_contexts: Mutex::new(HashMap::new()),
            }
        }))
    }
}

/// Per-query root of the memory hierarchy. See the module docs for the
/// locking contract.
pub struct QueryContext {
    query_id: QueryId,
    max_spill: u64,
    spill_space_tracker: Arc<SpillSpaceTracker>,
    notification_runtime: Handle,
    memory: MemoryTrackingContext,
    state: Mutex<QueryContextState>,
    /// Keyed by task instance id ("<resume count>-<disambiguator>"), so
    /// re-created attempts of the same task never collide.
    task_contexts: Mutex<HashMap<String, Arc<TaskContext>>>,
}

struct QueryContextState {
    max_user_memory: u64,
    max_total_memory: u64,
    memory_pool: Arc<MemoryPool>,
    spill_used: u64,
    overcommit: bool,
}

impl QueryContext {
    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    /// The query's accounting trees. Operators derive their local
    /// contexts from a task's child bundle; this root bundle is where
    /// those children accumulate.
    pub fn memory_context(&self) -> &MemoryTrackingContext {
        &self.memory
    }

    pub fn memory_pool(&self) -> Arc<MemoryPool> {
        Arc::clone(&self.state.lock().memory_pool)
    }

    pub fn max_user_memory(&self) -> u64 {
        self.state.lock().max_user_memory
    }

    pub fn max_total_memory(&self) -> u64 {
        self.state.lock().max_total_memory
    }

    pub fn max_spill(&self) -> u64 {
        self.max_spill
    }

    pub fn spill_used(&self) -> u64 {
        self.state.lock().spill_used
    }

    pub fn task_count(&self) -> usize {
        self.task_contexts.lock().len()
    }

    /// One-shot: raise both memory ceilings to the pool's capacity,
    /// accepting that the node kills the query outright on pool
    /// exhaustion instead of applying a softer per-query limit. Only
    /// legal before any task context exists.
    pub fn set_resource_overcommit(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.overcommit {
            return Err(FloeError::Internal(
                "resource overcommit is already enabled for this query".to_string(),
            ));
        }
        if !self.task_contexts.lock().is_empty() {
            return Err(FloeError::Internal(
                "resource overcommit must be enabled before any task context exists"
                    .to_string(),
            ));
        }
        state.max_user_memory = state.memory_pool.max_bytes();
        state.max_total_memory = state.memory_pool.max_bytes();
        state.overcommit = true;
        Ok(())
    }

    pub(crate) fn update_user_memory(
        &self,
        allocation_tag: &str,
        delta: i64,
    ) -> Result<MemoryFuture> {
        let state = self.state.lock();
        if delta >= 0 {
            let allocated = self.memory.user_memory();
            self.enforce_user_memory_limit(&state, allocated, delta)?;
            return Ok(state
                .memory_pool
                .reserve(&self.query_id, allocation_tag, delta as u64));
        }
        state
            .memory_pool
            .free(&self.query_id, allocation_tag, delta.unsigned_abs());
        Ok(MemoryFuture::ready())
    }

    pub(crate) fn update_revocable_memory(
        &self,
        _allocation_tag: &str,
        delta: i64,
    ) -> Result<MemoryFuture> {
        let state = self.state.lock();
        if delta >= 0 {
            // no per-query ceiling on revocable memory; the pool is the
            // only gate
            return Ok(state
                .memory_pool
                .reserve_revocable(&self.query_id, delta as u64));
        }
        state
            .memory_pool
            .free_revocable(&self.query_id, delta.unsigned_abs());
        Ok(MemoryFuture::ready())
    }

    pub(crate) fn update_system_memory(
        &self,
        allocation_tag: &str,
        delta: i64,
    ) -> Result<MemoryFuture> {
        let state = self.state.lock();
        // The admission total comes from the pool's ledger, not from the
        // user tracking tree. The user path locks its tree before this
        // lock; reading tree state from under this lock would invert
        // that order for concurrent user and system allocations. The
        // pool records the same per-query total and has no lock
        // dependency on the trees, so it is the one safe source here.
        let allocated = state.memory_pool.query_memory_reservation(&self.query_id) as i64;
        if delta >= 0 {
            self.enforce_total_memory_limit(&state, allocated, delta)?;
            return Ok(state
                .memory_pool
                .reserve(&self.query_id, allocation_tag, delta as u64));
        }
        state
            .memory_pool
            .free(&self.query_id, allocation_tag, delta.unsigned_abs());
        Ok(MemoryFuture::ready())
    }

    pub(crate) fn try_update_user_memory(
        &self,
        allocation_tag: &str,
        delta: i64,
    ) -> Result<bool> {
        if delta <= 0 {
            let future = self.update_user_memory(allocation_tag, delta)?;
            // releases must never leave the caller blocked; a zero delta
            // against a saturated pool legitimately may
            if delta < 0 && !future.is_ready() {
                return Err(FloeError::Internal(
                    "memory release returned a pending future".to_string(),
                ));
            }
            return Ok(true);
        }
        let state = self.state.lock();
        let allocated = self.memory.user_memory();
        if exceeds_limit(allocated, delta, state.max_user_memory) {
            return Ok(false);
        }
        Ok(state
            .memory_pool
            .try_reserve(&self.query_id, allocation_tag, delta as u64))
    }

    /// Reserve `bytes` of spill disk against the per-query ceiling and
    /// forward the reservation to the node-wide tracker. The local
    /// ledger is only charged once the tracker admits.
    pub fn reserve_spill(&self, bytes: u64) -> Result<MemoryFuture> {
        let mut state = self.state.lock();
        if state
            .spill_used
            .checked_add(bytes)
            .map_or(true, |used| used > self.max_spill)
        {
            return Err(FloeError::ExceededSpillLimit {
                limit: self.max_spill,
                per_query: true,
            });
        }
        let future = self.spill_space_tracker.reserve(bytes)?;
        state.spill_used += bytes;
        Ok(future)
    }

    /// Return `bytes` of spill disk. Fails without mutating state when
    /// it would drive the ledger negative.
    pub fn free_spill(&self, bytes: u64) -> Result<()> {
        let mut state = self.state.lock();
        let Some(remaining) = state.spill_used.checked_sub(bytes) else {
            return Err(FloeError::Internal(
                "tried to free more spill space than is reserved".to_string(),
            ));
        };
        state.spill_used = remaining;
        self.spill_space_tracker.free(bytes);
        Ok(())
    }

    /// Migrate this query to `new_pool`. A no-op when the pool is
    /// unchanged, so waiting tasks are not needlessly unblocked. The
    /// swap becomes visible to concurrent allocations before the old
    /// pool is asked to move the ledger, so racing reservations land in
    /// the new pool. Once the move completes, every registered task is
    /// sent a capacity notification on the notification runtime.
    pub fn set_memory_pool(self: &Arc<Self>, new_pool: Arc<MemoryPool>) {
        let old_pool = {
            let mut state = self.state.lock();
            if Arc::ptr_eq(&state.memory_pool, &new_pool) {
                return;
            }
            mem::replace(&mut state.memory_pool, Arc::clone(&new_pool))
        };
        debug!("moving query {} to a new memory pool", self.query_id);
        let migration = old_pool.move_query(&self.query_id, &new_pool);
        let context = Arc::clone(self);
        self.notification_runtime.spawn(async move {
            migration.await;
            let tasks: Vec<Arc<TaskContext>> =
                context.task_contexts.lock().values().cloned().collect();
            for task in tasks {
                task.notify_capacity_changed();
            }
        });
    }

    /// Register a task attempt. The instance id must have the form
    /// `"<resume count>-<random disambiguator>"`.
    pub fn add_task_context(&self, task_instance_id: &str) -> Result<Arc<TaskContext>> {
        let resume_count = task_instance_id
            .split_once('-')
            .and_then(|(count, _)| count.parse::<u64>().ok())
            .ok_or_else(|| {
                FloeError::Internal(format!(
                    "malformed task instance id `{task_instance_id}`"
                ))
            })?;
        let task = Arc::new(TaskContext::new(
            task_instance_id.to_string(),
            resume_count,
            self.memory.new_child(),
        ));
        let mut tasks = self.task_contexts.lock();
        if tasks.contains_key(task_instance_id) {
            return Err(FloeError::Internal(format!(
                "task instance `{task_instance_id}` is already registered"
            )));
        }
        tasks.insert(task_instance_id.to_string(), Arc::clone(&task));
        Ok(task)
    }

    pub fn get_task_context(&self, task_instance_id: &str) -> Result<Arc<TaskContext>> {
        self.task_contexts
            .lock()
            .get(task_instance_id)
            .cloned()
            .ok_or_else(|| FloeError::UnknownTask(task_instance_id.to_string()))
    }

    pub fn remove_task_context(&self, task_instance_id: &str) -> Result<()> {
        self.task_contexts
            .lock()
            .remove(task_instance_id)
            .map(|_| ())
            .ok_or_else(|| FloeError::UnknownTask(task_instance_id.to_string()))
    }

    fn enforce_user_memory_limit(
        &self,
        state: &QueryContextState,
        allocated: i64,
        delta: i64,
    ) -> Result<()> {
        if exceeds_limit(allocated, delta, state.max_user_memory) {
            return Err(FloeError::ExceededUserMemoryLimit {
                limit: state.max_user_memory,
                details: self.limit_details(&state.memory_pool, allocated, delta),
            });
        }
        Ok(())
    }

    fn enforce_total_memory_limit(
        &self,
        state: &QueryContextState,
        allocated: i64,
        delta: i64,
    ) -> Result<()> {
        if exceeds_limit(allocated, delta, state.max_total_memory) {
            return Err(FloeError::ExceededTotalMemoryLimit {
                limit: state.max_total_memory,
                details: self.limit_details(&state.memory_pool, allocated, delta),
            });
        }
        Ok(())
    }

    /// Failure diagnostics: current allocation, the rejected delta, and
    /// the query's three largest per-tag consumers.
    fn limit_details(&self, pool: &MemoryPool, allocated: i64, delta: i64) -> String {
        let mut details = format!(
            "Allocated: {}, Delta: {}",
            human_readable_size(allocated.max(0) as u64),
            human_readable_size(delta.max(0) as u64),
        );
        let allocations = pool.tagged_memory_allocations(&self.query_id);
        // a query can fail admission before any of its allocations were
        // tagged in the pool
        if allocations.is_empty() {
            return details;
        }
        let mut consumers: Vec<(String, i64)> = allocations
            .into_iter()
            .filter(|(_, bytes)| *bytes >= 0)
            .collect();
        consumers.sort_by(|a, b| b.1.cmp(&a.1));
        consumers.truncate(3);
        let top = consumers
            .iter()
            .map(|(tag, bytes)| format!("{tag}={}", human_readable_size(*bytes as u64)))
            .collect::<Vec<_>>()
            .join(", ");
        details.push_str(&format!(", Top Consumers: {{{top}}}"));
        details
    }
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("query_id", &self.query_id)
            .field("max_spill", &self.max_spill)
            .finish()
    }
}

fn exceeds_limit(allocated: i64, delta: i64, limit: u64) -> bool {
    allocated.max(0) as u128 + delta as u128 > limit as u128
}

enum MemoryAllocationKind {
    User,
    Revocable,
    System,
}

/// Glue between an accounting-tree root and its query context.
struct QueryMemoryReservationHandler {
    context: Weak<QueryContext>,
    kind: MemoryAllocationKind,
}

impl MemoryReservationHandler for QueryMemoryReservationHandler {
    fn reserve_memory(&self, allocation_tag: &str, delta: i64) -> Result<MemoryFuture> {
        let Some(context) = self.context.upgrade() else {
            return Err(FloeError::Internal(
                "query context dropped with reservations outstanding".to_string(),
            ));
        };
        match self.kind {
            MemoryAllocationKind::User => context.update_user_memory(allocation_tag, delta),
            MemoryAllocationKind::Revocable => {
                context.update_revocable_memory(allocation_tag, delta)
            }
            MemoryAllocationKind::System => {
                context.update_system_memory(allocation_tag, delta)
            }
        }
    }

    fn try_reserve_memory(&self, allocation_tag: &str, delta: i64) -> Result<bool> {
        let Some(context) = self.context.upgrade() else {
            return Err(FloeError::Internal(
                "query context dropped with reservations outstanding".to_string(),
            ));
        };
        match self.kind {
            MemoryAllocationKind::User => {
                context.try_update_user_memory(allocation_tag, delta)
            }
            MemoryAllocationKind::Revocable => Err(FloeError::UnsupportedReservationMode(
                "revocable memory does not support try-reserve",
            )),
            MemoryAllocationKind::System => Err(FloeError::UnsupportedReservationMode(
                "system memory does not support try-reserve",
            )),
        }
    }
}
