//! Helpers for code running on the tick thread and inside the audio callback.

pub mod alloc;
mod priority;

pub use alloc::{AllocationCounter, RtAllocGuard};
pub(crate) use priority::apply_realtime_priority;
