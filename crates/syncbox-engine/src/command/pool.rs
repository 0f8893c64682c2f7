use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use serde::Serialize;

use super::clip::ClipCommand;
use super::timer::TimerRecord;

/// Entries moved from the retire ring back to the free list per `acquire`.
const RECYCLE_BATCH: usize = 64;

pub(crate) trait PoolRecord: Default {
    fn reset(&mut self);
}

impl PoolRecord for ClipCommand {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Exclusive claim on one pool slot. Not `Clone`: whoever holds the handle is
/// the only party that may read or write the record behind it.
#[must_use]
pub(crate) struct Handle<T> {
    index: u32,
    _record: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Handle").field(&self.index).finish()
    }
}

impl<T> Handle<T> {
    pub(crate) fn index(&self) -> u32 {
        self.index
    }
}

pub(crate) type ClipHandle = Handle<ClipCommand>;
pub(crate) type TimerHandle = Handle<TimerRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub free: usize,
    pub retired: usize,
    pub exhausted: u64,
}

/// Fixed arena of reusable records.
///
/// Released records sit in a retire ring until the audio clock passes their
/// grace deadline, then get cleared and returned to the free list on a later
/// `acquire`. Both rings are bounded MPMC queues, so any thread may acquire
/// or release without blocking.
pub(crate) struct CommandPool<T> {
    name: &'static str,
    slots: Box<[UnsafeCell<T>]>,
    free: ArrayQueue<u32>,
    retired: ArrayQueue<(u32, u64)>,
    grace_usecs: u64,
    exhausted: AtomicU64,
}

// Slots are only touched through a unique `Handle`, or while the index is
// held by nobody (between popping it from the retire ring and pushing it to
// the free list).
unsafe impl<T: Send> Send for CommandPool<T> {}
unsafe impl<T: Send> Sync for CommandPool<T> {}

impl<T: PoolRecord> CommandPool<T> {
    pub(crate) fn new(name: &'static str, capacity: usize, grace_usecs: u64) -> Self {
        assert!(capacity > 0, "command pool capacity must be non-zero");
        let capacity = capacity.min(u32::MAX as usize);
        let mut slots = Vec::with_capacity(capacity);
        let free = ArrayQueue::new(capacity);
        for index in 0..capacity {
            slots.push(UnsafeCell::new(T::default()));
            let _ = free.push(index as u32);
        }
        Self {
            name,
            slots: slots.into_boxed_slice(),
            free,
            retired: ArrayQueue::new(capacity),
            grace_usecs,
            exhausted: AtomicU64::new(0),
        }
    }

    /// Hands out a cleared record, or `None` if every slot is in flight.
    pub(crate) fn acquire(&self, now_usecs: u64) -> Option<Handle<T>> {
        self.recycle(now_usecs);
        match self.free.pop() {
            Some(index) => Some(Handle {
                index,
                _record: PhantomData,
            }),
            None => {
                let exhausted = self.exhausted.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(pool = self.name, exhausted, "command pool exhausted");
                None
            }
        }
    }

    /// Queues the record for reuse once `grace_usecs` have passed on the audio clock.
    pub(crate) fn release(&self, handle: Handle<T>, now_usecs: u64) {
        let due = now_usecs.saturating_add(self.grace_usecs);
        if let Err((index, _)) = self.retired.push((handle.index, due)) {
            tracing::error!(pool = self.name, index, "retire ring full, recycling immediately");
            self.reset_slot(index);
            let _ = self.free.push(index);
        }
    }

    pub(crate) fn get(&self, handle: &Handle<T>) -> &T {
        // The handle is the only claim on this slot.
        unsafe { &*self.slots[handle.index as usize].get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn get_mut(&self, handle: &mut Handle<T>) -> &mut T {
        unsafe { &mut *self.slots[handle.index as usize].get() }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let free = self.free.len();
        let retired = self.retired.len();
        PoolStats {
            capacity: self.slots.len(),
            live: self.slots.len().saturating_sub(free + retired),
            free,
            retired,
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    fn recycle(&self, now_usecs: u64) {
        for _ in 0..RECYCLE_BATCH {
            let Some((index, due)) = self.retired.pop() else {
                break;
            };
            if due > now_usecs {
                if self.retired.push((index, due)).is_err() {
                    self.reset_slot(index);
                    let _ = self.free.push(index);
                }
                break;
            }
            self.reset_slot(index);
            let _ = self.free.push(index);
        }
    }

    fn reset_slot(&self, index: u32) {
        // Popped from the retire ring: nobody else holds this index.
        unsafe { (*self.slots[index as usize].get()).reset() }
    }
}
