use thiserror::Error;

/// Errors reported synchronously to control-side callers of the scheduler.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("requested delay of {delay} ticks exceeds the step ring capacity of {capacity}")]
    DelayExceedsRing { delay: u64, capacity: usize },
    #[error("{0} pool exhausted")]
    PoolExhausted(&'static str),
}

/// Returned by MIDI output ports that cannot take another event this cycle.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MidiWriteError {
    #[error("midi output buffer is full")]
    BufferFull,
    #[error("event frame {frame} is outside of a {nframes} frame buffer")]
    FrameOutOfRange { frame: u32, nframes: u32 },
}

/// Configuration validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}
