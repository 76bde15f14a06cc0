// src/dispatch/state.rs

//! Per-dispatch bookkeeping.
//!
//! One `DispatchState` belongs to exactly one `map_unordered` call and is
//! only touched from its control loop. Every map is keyed by [`TaskHandle`];
//! handles point back into the item arena by index.

use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;

use crate::remote::TaskHandle;

#[derive(Debug)]
pub(crate) struct DispatchState<I> {
    items: Vec<I>,
    item_done: Vec<bool>,
    remaining: usize,
    handle_item: HashMap<TaskHandle, usize>,
    pending: BTreeSet<TaskHandle>,
    start_times: HashMap<TaskHandle, Instant>,
    end_times: HashMap<TaskHandle, Instant>,
    /// Original <-> backup, stored in both directions.
    twins: HashMap<TaskHandle, TaskHandle>,
}

impl<I> DispatchState<I> {
    pub(crate) fn new(items: Vec<I>) -> Self {
        let n = items.len();
        Self {
            items,
            item_done: vec![false; n],
            remaining: n,
            handle_item: HashMap::new(),
            pending: BTreeSet::new(),
            start_times: HashMap::new(),
            end_times: HashMap::new(),
            twins: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn item(&self, idx: usize) -> &I {
        &self.items[idx]
    }

    /// Items that have not yet produced a successful result.
    pub(crate) fn remaining(&self) -> usize {
        self.remaining
    }

    pub(crate) fn item_of(&self, handle: TaskHandle) -> Option<usize> {
        self.handle_item.get(&handle).copied()
    }

    pub(crate) fn is_item_done(&self, idx: usize) -> bool {
        self.item_done[idx]
    }

    /// Start tracking a freshly submitted handle for item `idx`.
    pub(crate) fn track(&mut self, handle: TaskHandle, idx: usize, now: Instant) {
        self.handle_item.insert(handle, idx);
        self.start_times.insert(handle, now);
        self.pending.insert(handle);
    }

    /// Returns `false` if the handle was not pending.
    pub(crate) fn remove_pending(&mut self, handle: TaskHandle) -> bool {
        self.pending.remove(&handle)
    }

    pub(crate) fn pending_handles(&self) -> Vec<TaskHandle> {
        self.pending.iter().copied().collect()
    }

    pub(crate) fn drain_pending(&mut self) -> Vec<TaskHandle> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    pub(crate) fn complete_item(&mut self, idx: usize, handle: TaskHandle, now: Instant) {
        self.end_times.insert(handle, now);
        if !self.item_done[idx] {
            self.item_done[idx] = true;
            self.remaining -= 1;
        }
    }

    pub(crate) fn pair(&mut self, original: TaskHandle, backup: TaskHandle) {
        self.twins.insert(original, backup);
        self.twins.insert(backup, original);
    }

    /// Drop the pairing of `handle` in both directions, returning its twin.
    pub(crate) fn unpair(&mut self, handle: TaskHandle) -> Option<TaskHandle> {
        let twin = self.twins.remove(&handle)?;
        self.twins.remove(&twin);
        Some(twin)
    }

    pub(crate) fn has_twin(&self, handle: TaskHandle) -> bool {
        self.twins.contains_key(&handle)
    }

    pub(crate) fn start_times(&self) -> &HashMap<TaskHandle, Instant> {
        &self.start_times
    }

    pub(crate) fn end_times(&self) -> &HashMap<TaskHandle, Instant> {
        &self.end_times
    }
}
