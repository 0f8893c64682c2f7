//! Allocation tracking for the audio callback.
//!
//! [`AudioEngine::process`](crate::AudioEngine::process) enters an
//! [`RtAllocGuard`] for its whole duration. Binaries and tests that install
//! [`AllocationCounter`] as their global allocator can then check that the
//! callback never reached the heap.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

static GUARDED_ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static GUARDED_DEALLOCATIONS: AtomicU64 = AtomicU64::new(0);

/// Marks the current thread as running real-time code until dropped.
pub struct RtAllocGuard {
    _not_send: PhantomData<*const ()>,
}

impl RtAllocGuard {
    pub fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }

    pub fn is_active() -> bool {
        DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(false)
    }
}

impl Drop for RtAllocGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// System allocator that counts heap traffic made under an [`RtAllocGuard`].
pub struct AllocationCounter;

impl AllocationCounter {
    pub fn guarded_allocations() -> u64 {
        GUARDED_ALLOCATIONS.load(Ordering::Relaxed)
    }

    pub fn guarded_deallocations() -> u64 {
        GUARDED_DEALLOCATIONS.load(Ordering::Relaxed)
    }
}

#[inline(always)]
fn on_alloc() {
    if RtAllocGuard::is_active() {
        GUARDED_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    }
}

unsafe impl GlobalAlloc for AllocationCounter {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        on_alloc();
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if RtAllocGuard::is_active() {
            GUARDED_DEALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        on_alloc();
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        on_alloc();
        System.alloc_zeroed(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_nests_and_unwinds() {
        assert!(!RtAllocGuard::is_active());
        let outer = RtAllocGuard::enter();
        {
            let _inner = RtAllocGuard::enter();
            assert!(RtAllocGuard::is_active());
        }
        assert!(RtAllocGuard::is_active());
        drop(outer);
        assert!(!RtAllocGuard::is_active());
    }
}
