//! Pooled command records exchanged between control code and the audio callback.

mod clip;
pub(crate) mod pool;
mod timer;

pub use clip::{ClipCommand, CommandKey};
pub use pool::PoolStats;
pub(crate) use pool::{ClipHandle, CommandPool, TimerHandle};
pub use timer::{TimerCommand, TimerOperation, TimerText, TIMER_TEXT_CAPACITY};
pub(crate) use timer::TimerRecord;
