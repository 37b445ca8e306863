//! Registry of in-flight profiling contexts
//!
//! The ordinal counter, the context map and the collected count live behind
//! a single reentrant lock. A thread holding a [`StoreGuard`] may lock the
//! store again, which the completion path relies on: it finalizes a context
//! (and writes its output) while still holding the guard it looked it up
//! with.

use crate::context::ProfilingContext;
use crate::error::{ProfilerError, Result};
use kdprof_shared::DispatchOrdinal;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Default)]
struct StoreState {
    next_ordinal: DispatchOrdinal,
    contexts: BTreeMap<DispatchOrdinal, ProfilingContext>,
    collected: u64,
}

/// Concurrency-safe context registry keyed by dispatch ordinal
#[derive(Default)]
pub struct ContextStore {
    state: ReentrantMutex<RefCell<StoreState>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the store lock. Re-acquiring on the same thread does not block.
    pub fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            state: self.state.lock(),
        }
    }
}

impl fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.lock();
        f.debug_struct("ContextStore")
            .field("next_ordinal", &store.current_ordinal())
            .field("in_flight", &store.len())
            .field("collected", &store.collected())
            .finish()
    }
}

/// Exclusive access to the store for the current thread.
///
/// No `RefCell` borrow is held across calls, so callbacks handed to
/// [`for_each_snapshot`](StoreGuard::for_each_snapshot) and
/// [`update`](StoreGuard::update) must not expect to see intermediate state.
pub struct StoreGuard<'a> {
    state: ReentrantMutexGuard<'a, RefCell<StoreState>>,
}

impl StoreGuard<'_> {
    /// Ordinal the next dispatch will be assigned
    pub fn current_ordinal(&self) -> DispatchOrdinal {
        self.state.borrow().next_ordinal
    }

    /// Read and advance the ordinal counter, returning the value before the increment
    pub fn next_ordinal(&self) -> DispatchOrdinal {
        let mut state = self.state.borrow_mut();
        let ordinal = state.next_ordinal;
        state.next_ordinal += 1;
        ordinal
    }

    /// Register `context` under the current counter value without advancing it
    pub fn allocate(&self, mut context: ProfilingContext) -> Result<DispatchOrdinal> {
        let mut state = self.state.borrow_mut();
        let ordinal = state.next_ordinal;
        if state.contexts.contains_key(&ordinal) {
            return Err(ProfilerError::DuplicateOrdinal(ordinal));
        }
        context.assign_ordinal(ordinal);
        state.contexts.insert(ordinal, context);
        Ok(ordinal)
    }

    pub fn contains(&self, ordinal: DispatchOrdinal) -> bool {
        self.state.borrow().contexts.contains_key(&ordinal)
    }

    pub fn inspect<R>(&self, ordinal: DispatchOrdinal, f: impl FnOnce(&ProfilingContext) -> R) -> Option<R> {
        self.state.borrow().contexts.get(&ordinal).map(f)
    }

    pub fn update<R>(
        &self,
        ordinal: DispatchOrdinal,
        f: impl FnOnce(&mut ProfilingContext) -> R,
    ) -> Result<R> {
        let mut state = self.state.borrow_mut();
        let context = state
            .contexts
            .get_mut(&ordinal)
            .ok_or(ProfilerError::MissingContext(ordinal))?;
        Ok(f(context))
    }

    /// Take a context out of the store
    pub fn remove(&self, ordinal: DispatchOrdinal) -> Result<ProfilingContext> {
        self.state
            .borrow_mut()
            .contexts
            .remove(&ordinal)
            .ok_or(ProfilerError::MissingContext(ordinal))
    }

    /// Ordinals currently stored, in ascending order
    pub fn ordinals(&self) -> Vec<DispatchOrdinal> {
        self.state.borrow().contexts.keys().copied().collect()
    }

    /// Call `f` for every ordinal stored right now, stopping at the first
    /// error. `f` may remove entries, including ones not visited yet.
    pub fn for_each_snapshot(&self, mut f: impl FnMut(DispatchOrdinal) -> Result<()>) -> Result<()> {
        for ordinal in self.ordinals() {
            f(ordinal)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.borrow().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().contexts.is_empty()
    }

    /// Contexts finalized so far
    pub fn collected(&self) -> u64 {
        self.state.borrow().collected
    }

    pub fn mark_collected(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        state.collected += 1;
        state.collected
    }
}
