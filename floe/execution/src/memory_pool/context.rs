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

//! Hierarchical memory-accounting contexts.
//!
//! Every operator allocation flows through a [`LocalMemoryContext`] leaf
//! into a tree of [`AggregatedMemoryContext`] nodes; the root forwards
//! the net delta to a [`MemoryReservationHandler`] (in production, the
//! query context). Each node accumulates its subtree's total. Nodes are
//! locked leaf-to-root while an update is in flight; the accumulated
//! totals are plain atomics so they can be read without joining that
//! lock chain. On a failed reservation no node in the chain has mutated
//! its accounting.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use floe_common::{FloeError, Result};

use super::MemoryFuture;

/// Root delegate for net reservation deltas out of a context tree.
pub trait MemoryReservationHandler: Send + Sync {
    /// Apply a signed delta (positive reserves, negative releases) under
    /// `allocation_tag`, returning the admission future.
    fn reserve_memory(&self, allocation_tag: &str, delta: i64) -> Result<MemoryFuture>;

    /// Non-blocking variant; `Ok(false)` means the delta did not fit.
    fn try_reserve_memory(&self, allocation_tag: &str, delta: i64) -> Result<bool>;
}

struct ContextNode {
    parent: Option<Arc<ContextNode>>,
    /// Set on roots created with [`AggregatedMemoryContext::new_root`]
    handler: Option<Arc<dyn MemoryReservationHandler>>,
    /// Subtree total
    bytes: AtomicI64,
    update_lock: Mutex<()>,
}

impl ContextNode {
    fn update(self: &Arc<Self>, allocation_tag: &str, delta: i64) -> Result<MemoryFuture> {
        if delta == 0 {
            return Ok(MemoryFuture::ready());
        }
        let _guard = self.update_lock.lock();
        let future = match (&self.parent, &self.handler) {
            (Some(parent), _) => parent.update(allocation_tag, delta)?,
            (None, Some(handler)) => handler.reserve_memory(allocation_tag, delta)?,
            (None, None) => MemoryFuture::ready(),
        };
        self.bytes.fetch_add(delta, Ordering::AcqRel);
        Ok(future)
    }

    fn try_update(self: &Arc<Self>, allocation_tag: &str, delta: i64) -> Result<bool> {
        if delta == 0 {
            return Ok(true);
        }
        let _guard = self.update_lock.lock();
        let admitted = match (&self.parent, &self.handler) {
            (Some(parent), _) => parent.try_update(allocation_tag, delta)?,
            (None, Some(handler)) => handler.try_reserve_memory(allocation_tag, delta)?,
            (None, None) => true,
        };
        if admitted {
            self.bytes.fetch_add(delta, Ordering::AcqRel);
        }
        Ok(admitted)
    }
}

/// Aggregating node of a memory-accounting tree.
#[derive(Clone)]
pub struct AggregatedMemoryContext {
    node: Arc<ContextNode>,
}

impl AggregatedMemoryContext {
    /// Root whose net deltas are delegated to `handler`.
    pub fn new_root(handler: Arc<dyn MemoryReservationHandler>) -> Self {
        Self {
            node: Arc::new(ContextNode {
                parent: None,
                handler: Some(handler),
                bytes: AtomicI64::new(0),
                update_lock: Mutex::new(()),
            }),
        }
    }

    /// Standalone root that admits everything. Used where only the
    /// accounting matters, e.g. in tests and tools.
    pub fn new_simple() -> Self {
        Self {
            node: Arc::new(ContextNode {
                parent: None,
                handler: None,
                bytes: AtomicI64::new(0),
                update_lock: Mutex::new(()),
            }),
        }
    }

    pub fn new_child(&self) -> AggregatedMemoryContext {
        Self {
            node: Arc::new(ContextNode {
                parent: Some(Arc::clone(&self.node)),
                handler: None,
                bytes: AtomicI64::new(0),
                update_lock: Mutex::new(()),
            }),
        }
    }

    /// Leaf context charging this node under `allocation_tag`.
    pub fn new_local(&self, allocation_tag: impl Into<String>) -> LocalMemoryContext {
        LocalMemoryContext {
            parent: Arc::clone(&self.node),
            allocation_tag: allocation_tag.into(),
            bytes: AtomicI64::new(0),
            update_lock: Mutex::new(()),
        }
    }

    /// Subtree total in bytes.
    pub fn bytes(&self) -> i64 {
        self.node.bytes.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AggregatedMemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatedMemoryContext")
            .field("bytes", &self.bytes())
            .finish()
    }
}

/// Leaf of a memory-accounting tree. Holders set their absolute usage
/// and the delta propagates to the root handler.
pub struct LocalMemoryContext {
    parent: Arc<ContextNode>,
    allocation_tag: String,
    bytes: AtomicI64,
    update_lock: Mutex<()>,
}

impl LocalMemoryContext {
    /// Set this leaf's usage to `bytes`, forwarding the delta up the
    /// tree. Fails without mutating any accounting if the reservation
    /// is rejected.
    pub fn set_bytes(&self, bytes: i64) -> Result<MemoryFuture> {
        if bytes < 0 {
            return Err(FloeError::Internal(format!(
                "local memory context usage cannot be negative, got {bytes}"
            )));
        }
        let _guard = self.update_lock.lock();
        let delta = bytes - self.bytes.load(Ordering::Acquire);
        if delta == 0 {
            return Ok(MemoryFuture::ready());
        }
        let future = self.parent.update(&self.allocation_tag, delta)?;
        self.bytes.store(bytes, Ordering::Release);
        Ok(future)
    }

    /// Non-blocking variant of [`Self::set_bytes`].
    pub fn try_set_bytes(&self, bytes: i64) -> Result<bool> {
        if bytes < 0 {
            return Err(FloeError::Internal(format!(
                "local memory context usage cannot be negative, got {bytes}"
            )));
        }
        let _guard = self.update_lock.lock();
        let delta = bytes - self.bytes.load(Ordering::Acquire);
        if delta == 0 {
            return Ok(true);
        }
        let admitted = self.parent.try_update(&self.allocation_tag, delta)?;
        if admitted {
            self.bytes.store(bytes, Ordering::Release);
        }
        Ok(admitted)
    }

    pub fn bytes(&self) -> i64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn allocation_tag(&self) -> &str {
        &self.allocation_tag
    }
}

impl std::fmt::Debug for LocalMemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMemoryContext")
            .field("allocation_tag", &self.allocation_tag)
            .field("bytes", &self.bytes())
            .finish()
    }
}

/// The three independent accounting trees of one query or task: user,
/// revocable and system memory.
#[derive(Debug, Clone)]
pub struct MemoryTrackingContext {
    user: AggregatedMemoryContext,
    revocable: AggregatedMemoryContext,
    system: AggregatedMemoryContext,
}

impl MemoryTrackingContext {
    pub fn new(
        user: AggregatedMemoryContext,
        revocable: AggregatedMemoryContext,
        system: AggregatedMemoryContext,
    ) -> Self {
        Self {
            user,
            revocable,
            system,
        }
    }

    /// Child bundle for one task attempt; each part accumulates into
    /// this bundle's respective tree.
    pub fn new_child(&self) -> MemoryTrackingContext {
        Self {
            user: self.user.new_child(),
            revocable: self.revocable.new_child(),
            system: self.system.new_child(),
        }
    }

    pub fn new_local_user(&self, allocation_tag: impl Into<String>) -> LocalMemoryContext {
        self.user.new_local(allocation_tag)
    }

    pub fn new_local_revocable(
        &self,
        allocation_tag: impl Into<String>,
    ) -> LocalMemoryContext {
        self.revocable.new_local(allocation_tag)
    }

    pub fn new_local_system(&self, allocation_tag: impl Into<String>) -> LocalMemoryContext {
        self.system.new_local(allocation_tag)
    }

    pub fn user_memory(&self) -> i64 {
        self.user.bytes()
    }

    pub fn revocable_memory(&self) -> i64 {
        self.revocable.bytes()
    }

    pub fn system_memory(&self) -> i64 {
        self.system.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingHandler {
        calls: AtomicUsize,
        reject_above: i64,
        total: AtomicI64,
    }

    impl RecordingHandler {
        fn new(reject_above: i64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reject_above,
                total: AtomicI64::new(0),
            }
        }
    }

    impl MemoryReservationHandler for RecordingHandler {
        fn reserve_memory(&self, _tag: &str, delta: i64) -> Result<MemoryFuture> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let total = self.total.load(Ordering::Relaxed);
            if total + delta > self.reject_above {
                return Err(FloeError::Internal("over handler limit".to_string()));
            }
            self.total.fetch_add(delta, Ordering::Relaxed);
            Ok(MemoryFuture::ready())
        }

        fn try_reserve_memory(&self, tag: &str, delta: i64) -> Result<bool> {
            match self.reserve_memory(tag, delta) {
                Ok(_) => Ok(true),
                Err(_) => Ok(false),
            }
        }
    }

    #[test]
    fn deltas_aggregate_through_the_tree() {
        let handler = Arc::new(RecordingHandler::new(i64::MAX));
        let root = AggregatedMemoryContext::new_root(Arc::clone(&handler) as _);
        let child = root.new_child();
        let local = child.new_local("sort");

        local.set_bytes(100).unwrap();
        assert_eq!(local.bytes(), 100);
        assert_eq!(child.bytes(), 100);
        assert_eq!(root.bytes(), 100);

        local.set_bytes(40).unwrap();
        assert_eq!(child.bytes(), 40);
        assert_eq!(root.bytes(), 40);
        assert_eq!(handler.total.load(Ordering::Relaxed), 40);
    }

    #[test]
    fn rejected_reservations_leave_accounting_untouched() {
        let handler = Arc::new(RecordingHandler::new(50));
        let root = AggregatedMemoryContext::new_root(handler as _);
        let local = root.new_local("agg");

        local.set_bytes(30).unwrap();
        let err = local.set_bytes(100).unwrap_err();
        assert!(matches!(err, FloeError::Internal(_)));
        assert_eq!(local.bytes(), 30);
        assert_eq!(root.bytes(), 30);
    }

    #[test]
    fn try_set_bytes_reports_rejection_without_state() {
        let handler = Arc::new(RecordingHandler::new(50));
        let root = AggregatedMemoryContext::new_root(handler as _);
        let local = root.new_local("agg");

        assert!(local.try_set_bytes(50).unwrap());
        assert!(!local.try_set_bytes(60).unwrap());
        assert_eq!(local.bytes(), 50);
        assert_eq!(root.bytes(), 50);
        // shrinking always fits
        assert!(local.try_set_bytes(0).unwrap());
        assert_eq!(root.bytes(), 0);
    }

    #[test]
    fn unchanged_usage_skips_the_handler() {
        let handler = Arc::new(RecordingHandler::new(i64::MAX));
        let root = AggregatedMemoryContext::new_root(Arc::clone(&handler) as _);
        let local = root.new_local("scan");

        local.set_bytes(10).unwrap();
        let calls = handler.calls.load(Ordering::Relaxed);
        local.set_bytes(10).unwrap();
        assert_eq!(handler.calls.load(Ordering::Relaxed), calls);
    }

    #[test]
    fn sibling_locals_share_the_root_total() {
        let root = AggregatedMemoryContext::new_simple();
        let a = root.new_local("a");
        let b = root.new_local("b");

        a.set_bytes(10).unwrap();
        b.set_bytes(20).unwrap();
        assert_eq!(root.bytes(), 30);
    }

    #[test]
    fn tracking_context_children_roll_up() {
        let tracking = MemoryTrackingContext::new(
            AggregatedMemoryContext::new_simple(),
            AggregatedMemoryContext::new_simple(),
            AggregatedMemoryContext::new_simple(),
        );
        let task = tracking.new_child();

        task.new_local_user("sort").set_bytes(100).unwrap();
        task.new_local_system("exchange").set_bytes(7).unwrap();

        assert_eq!(tracking.user_memory(), 100);
        assert_eq!(tracking.system_memory(), 7);
        assert_eq!(tracking.revocable_memory(), 0);
    }

    #[test]
    fn negative_usage_is_rejected() {
        let root = AggregatedMemoryContext::new_simple();
        let local = root.new_local("sort");
        assert!(local.set_bytes(-1).is_err());
        assert!(local.try_set_bytes(-1).is_err());
    }
}
