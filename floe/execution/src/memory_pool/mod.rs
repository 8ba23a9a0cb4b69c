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

//! [`MemoryPool`]: the node-wide memory ledger shared by every query.

pub mod context;

pub use context::{
    AggregatedMemoryContext, LocalMemoryContext, MemoryReservationHandler,
    MemoryTrackingContext,
};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use log::debug;
use parking_lot::Mutex;

use crate::query_id::QueryId;

/// Completion handle for a memory reservation.
///
/// The reservation itself is recorded synchronously; this future only
/// conveys backpressure. It is immediately ready when the pool-wide
/// total fits the pool capacity, and completes once enough bytes are
/// freed otherwise. Release paths always produce a ready future, which
/// [`MemoryFuture::is_ready`] lets callers verify.
#[derive(Debug)]
pub struct MemoryFuture {
    waiter: Option<Arc<Waiter>>,
}

impl MemoryFuture {
    pub(crate) fn ready() -> Self {
        Self { waiter: None }
    }

    fn blocked() -> (Self, Arc<Waiter>) {
        let waiter = Arc::new(Waiter {
            done: AtomicBool::new(false),
            waker: Mutex::new(None),
        });
        (
            Self {
                waiter: Some(Arc::clone(&waiter)),
            },
            waiter,
        )
    }

    pub fn is_ready(&self) -> bool {
        match &self.waiter {
            None => true,
            Some(waiter) => waiter.done.load(Ordering::Acquire),
        }
    }
}

impl Future for MemoryFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let Some(waiter) = &self.waiter else {
            return Poll::Ready(());
        };
        if waiter.done.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        *waiter.waker.lock() = Some(cx.waker().clone());
        // completion may have raced the waker registration
        if waiter.done.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

#[derive(Debug)]
struct Waiter {
    done: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl Waiter {
    fn complete(&self) {
        self.done.store(true, Ordering::Release);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

/// Node-wide memory pool.
///
/// The pool is the single source of truth for how much memory each query
/// has reserved on this node. Per-query admission (user/total ceilings)
/// is the [`crate::query_context::QueryContext`]'s job; the pool only
/// gates on its own capacity, by handing out futures that complete when
/// the pool-wide total fits again. Reservations are recorded eagerly so
/// releases can never be stuck behind a blocked acquisition.
#[derive(Debug)]
pub struct MemoryPool {
    max_bytes: u64,
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Pool-wide total, revocable included
    reserved: u64,
    queries: HashMap<QueryId, QueryLedger>,
    waiters: Vec<Arc<Waiter>>,
}

#[derive(Debug, Default)]
struct QueryLedger {
    reserved: u64,
    revocable: u64,
    /// Per-tag breakdown of `reserved`, kept for limit diagnostics
    tagged: HashMap<String, i64>,
}

impl QueryLedger {
    fn is_empty(&self) -> bool {
        self.reserved == 0 && self.revocable == 0 && self.tagged.is_empty()
    }
}

impl MemoryPool {
    /// Pool with `max_bytes` of capacity.
    pub fn new(max_bytes: u64) -> Self {
        debug!("Created new MemoryPool(max_bytes={max_bytes})");
        Self {
            max_bytes,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Record `bytes` against `query` under `allocation_tag` and return
    /// the admission future. The ledger is updated unconditionally; the
    /// future is pending only while the pool-wide total exceeds capacity.
    pub fn reserve(&self, query: &QueryId, allocation_tag: &str, bytes: u64) -> MemoryFuture {
        let mut state = self.state.lock();
        let ledger = state.queries.entry(query.clone()).or_default();
        ledger.reserved += bytes;
        *ledger.tagged.entry(allocation_tag.to_string()).or_insert(0) += bytes as i64;
        state.reserved += bytes;
        self.admission_future(&mut state)
    }

    /// Non-blocking variant: records the reservation only if the
    /// pool-wide total stays within capacity. No state is left behind
    /// on failure.
    pub fn try_reserve(&self, query: &QueryId, allocation_tag: &str, bytes: u64) -> bool {
        let mut state = self.state.lock();
        if state.reserved.saturating_add(bytes) > self.max_bytes {
            return false;
        }
        let ledger = state.queries.entry(query.clone()).or_default();
        ledger.reserved += bytes;
        *ledger.tagged.entry(allocation_tag.to_string()).or_insert(0) += bytes as i64;
        state.reserved += bytes;
        true
    }

    /// Release `bytes` reserved under `allocation_tag`. Never blocks;
    /// wakes blocked reservations once the pool is back under capacity.
    pub fn free(&self, query: &QueryId, allocation_tag: &str, bytes: u64) {
        let mut state = self.state.lock();
        if let Some(ledger) = state.queries.get_mut(query) {
            ledger.reserved = ledger.reserved.saturating_sub(bytes);
            let tag_emptied = match ledger.tagged.get_mut(allocation_tag) {
                Some(tagged) => {
                    *tagged -= bytes as i64;
                    *tagged == 0
                }
                None => false,
            };
            if tag_emptied {
                ledger.tagged.remove(allocation_tag);
            }
        }
        Self::drop_ledger_if_empty(&mut state, query);
        state.reserved = state.reserved.saturating_sub(bytes);
        self.wake_if_under_capacity(&mut state);
    }

    /// Revocable reservations share the pool capacity but are kept out
    /// of the per-query ledger used for limit enforcement.
    pub fn reserve_revocable(&self, query: &QueryId, bytes: u64) -> MemoryFuture {
        let mut state = self.state.lock();
        state.queries.entry(query.clone()).or_default().revocable += bytes;
        state.reserved += bytes;
        self.admission_future(&mut state)
    }

    pub fn free_revocable(&self, query: &QueryId, bytes: u64) {
        let mut state = self.state.lock();
        if let Some(ledger) = state.queries.get_mut(query) {
            ledger.revocable = ledger.revocable.saturating_sub(bytes);
        }
        Self::drop_ledger_if_empty(&mut state, query);
        state.reserved = state.reserved.saturating_sub(bytes);
        self.wake_if_under_capacity(&mut state);
    }

    /// The query's non-revocable total as recorded by this pool.
    pub fn query_memory_reservation(&self, query: &QueryId) -> u64 {
        self.state
            .lock()
            .queries
            .get(query)
            .map(|ledger| ledger.reserved)
            .unwrap_or(0)
    }

    /// Per-tag breakdown of the query's non-revocable reservation.
    pub fn tagged_memory_allocations(&self, query: &QueryId) -> HashMap<String, i64> {
        self.state
            .lock()
            .queries
            .get(query)
            .map(|ledger| ledger.tagged.clone())
            .unwrap_or_default()
    }

    /// Move the query's entire tracked reservation (revocable included)
    /// into `target`, freeing it locally. Returns the target pool's
    /// admission future.
    pub fn move_query(&self, query: &QueryId, target: &Arc<MemoryPool>) -> MemoryFuture {
        let ledger = {
            let mut state = self.state.lock();
            let Some(ledger) = state.queries.remove(query) else {
                return MemoryFuture::ready();
            };
            state.reserved = state
                .reserved
                .saturating_sub(ledger.reserved + ledger.revocable);
            self.wake_if_under_capacity(&mut state);
            ledger
        };
        debug!(
            "moved {} bytes of query {query} reservation to a new pool",
            ledger.reserved + ledger.revocable
        );
        let mut state = target.state.lock();
        let moved = ledger.reserved + ledger.revocable;
        let entry = state.queries.entry(query.clone()).or_default();
        entry.reserved += ledger.reserved;
        entry.revocable += ledger.revocable;
        for (tag, bytes) in ledger.tagged {
            *entry.tagged.entry(tag).or_insert(0) += bytes;
        }
        state.reserved += moved;
        target.admission_future(&mut state)
    }

    /// Total bytes currently reserved in this pool, across all queries.
    pub fn reserved_bytes(&self) -> u64 {
        self.state.lock().reserved
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn admission_future(&self, state: &mut PoolState) -> MemoryFuture {
        if state.reserved <= self.max_bytes {
            return MemoryFuture::ready();
        }
        let (future, waiter) = MemoryFuture::blocked();
        state.waiters.push(waiter);
        future
    }

    fn wake_if_under_capacity(&self, state: &mut PoolState) {
        if state.reserved <= self.max_bytes {
            for waiter in state.waiters.drain(..) {
                waiter.complete();
            }
        }
    }

    fn drop_ledger_if_empty(state: &mut PoolState, query: &QueryId) {
        let emptied = state
            .queries
            .get(query)
            .map(|ledger| ledger.is_empty())
            .unwrap_or(false);
        if emptied {
            state.queries.remove(query);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(id: &str) -> QueryId {
        QueryId::new(id)
    }

    #[test]
    fn reserve_is_recorded_even_over_capacity() {
        let pool = MemoryPool::new(100);
        let q = query("q1");

        let future = pool.reserve(&q, "sort", 80);
        assert!(future.is_ready());
        assert_eq!(pool.query_memory_reservation(&q), 80);

        // second reservation overshoots the pool: granted in the ledger,
        // but the future applies backpressure
        let future = pool.reserve(&q, "join", 40);
        assert!(!future.is_ready());
        assert_eq!(pool.query_memory_reservation(&q), 120);
        assert_eq!(pool.reserved_bytes(), 120);
    }

    #[test]
    fn try_reserve_leaves_no_state_on_failure() {
        let pool = MemoryPool::new(100);
        let q = query("q1");

        assert!(pool.try_reserve(&q, "sort", 90));
        assert!(!pool.try_reserve(&q, "sort", 20));
        assert_eq!(pool.query_memory_reservation(&q), 90);
        assert_eq!(pool.tagged_memory_allocations(&q).get("sort"), Some(&90));
    }

    #[tokio::test]
    async fn blocked_reservation_completes_after_free() {
        let pool = Arc::new(MemoryPool::new(100));
        let q1 = query("q1");
        let q2 = query("q2");

        assert!(pool.reserve(&q1, "sort", 100).is_ready());
        let blocked = pool.reserve(&q2, "agg", 50);
        assert!(!blocked.is_ready());

        pool.free(&q1, "sort", 100);
        blocked.await;
        assert_eq!(pool.reserved_bytes(), 50);
    }

    #[test]
    fn free_drops_empty_ledger_entries() {
        let pool = MemoryPool::new(100);
        let q = query("q1");

        pool.reserve(&q, "sort", 30);
        pool.free(&q, "sort", 30);
        assert_eq!(pool.query_memory_reservation(&q), 0);
        assert!(pool.tagged_memory_allocations(&q).is_empty());
        assert_eq!(pool.reserved_bytes(), 0);
    }

    #[test]
    fn revocable_is_tracked_apart_from_the_query_ledger() {
        let pool = MemoryPool::new(100);
        let q = query("q1");

        assert!(pool.reserve_revocable(&q, 60).is_ready());
        assert_eq!(pool.query_memory_reservation(&q), 0);
        assert_eq!(pool.reserved_bytes(), 60);

        pool.free_revocable(&q, 60);
        assert_eq!(pool.reserved_bytes(), 0);
    }

    #[test]
    fn move_query_transfers_the_full_ledger() {
        let source = Arc::new(MemoryPool::new(100));
        let target = Arc::new(MemoryPool::new(200));
        let q = query("q1");

        source.reserve(&q, "sort", 40);
        source.reserve(&q, "join", 20);
        source.reserve_revocable(&q, 10);

        let future = source.move_query(&q, &target);
        assert!(future.is_ready());
        assert_eq!(source.reserved_bytes(), 0);
        assert_eq!(source.query_memory_reservation(&q), 0);
        assert_eq!(target.query_memory_reservation(&q), 60);
        assert_eq!(target.reserved_bytes(), 70);
        let tagged = target.tagged_memory_allocations(&q);
        assert_eq!(tagged.get("sort"), Some(&40));
        assert_eq!(tagged.get("join"), Some(&20));
    }

    #[tokio::test]
    async fn move_query_wakes_source_waiters() {
        let source = Arc::new(MemoryPool::new(100));
        let target = Arc::new(MemoryPool::new(1000));
        let q1 = query("q1");
        let q2 = query("q2");

        source.reserve(&q1, "sort", 100);
        let blocked = source.reserve(&q2, "agg", 10);
        assert!(!blocked.is_ready());

        source.move_query(&q1, &target);
        blocked.await;
    }
}
