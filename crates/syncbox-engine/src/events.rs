//! Notifications leaving the audio thread, and live MIDI entering it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use crossbeam::queue::ArrayQueue;
use rtrb::{Consumer, Producer, PushError, RingBuffer};

use crate::command::{ClipCommand, TimerCommand};
use crate::midi::MidiMessage;
use crate::source::{Clip, PositionReport};

/// Released clips parked on the audio thread while the event ring is full.
const PARKED_RELEASES: usize = 32;
/// Released clips handed straight to the control side once the parking slots are full.
const GRAVEYARD_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A timer command fired at `frame`, `usecs` on the audio clock.
    Timer {
        command: TimerCommand,
        frame: u64,
        usecs: u64,
    },
    ClipCommandSent { command: ClipCommand, frame: u64 },
    /// The sampler dropped its reference; the last owner should be here.
    ClipReleased(Arc<Clip>),
}

#[derive(Debug, Default)]
struct DropCounters {
    events: AtomicU64,
    positions: AtomicU64,
    leaked_clips: AtomicU64,
}

/// Audio side of the notification rings. Never blocks; full rings count drops.
pub(crate) struct EventBridge {
    events: Producer<EngineEvent>,
    positions: Producer<PositionReport>,
    parked: ArrayVec<Arc<Clip>, PARKED_RELEASES>,
    graveyard: Arc<ArrayQueue<Arc<Clip>>>,
    dropped: Arc<DropCounters>,
}

impl EventBridge {
    #[inline]
    pub(crate) fn push(&mut self, event: EngineEvent) {
        if let Err(PushError::Full(event)) = self.events.push(event) {
            self.dropped.events.fetch_add(1, Ordering::Relaxed);
            if let EngineEvent::ClipReleased(clip) = event {
                // Keep the clip alive until it can be handed over.
                // Sample data is never freed on the audio thread.
                if let Err(err) = self.parked.try_push(clip) {
                    if let Err(clip) = self.graveyard.push(err.element()) {
                        self.dropped.leaked_clips.fetch_add(1, Ordering::Relaxed);
                        std::mem::forget(clip);
                    }
                }
            }
        }
    }

    #[inline]
    pub(crate) fn report(&mut self, report: PositionReport) {
        if self.positions.push(report).is_err() {
            self.dropped.positions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Retries handing parked clips to the control side.
    pub(crate) fn flush_parked(&mut self) {
        while let Some(clip) = self.parked.pop() {
            if let Err(PushError::Full(EngineEvent::ClipReleased(clip))) =
                self.events.push(EngineEvent::ClipReleased(clip))
            {
                self.parked.push(clip);
                break;
            }
        }
    }
}

/// Control side of the notification rings.
pub struct EngineEvents {
    events: Consumer<EngineEvent>,
    positions: Consumer<PositionReport>,
    graveyard: Arc<ArrayQueue<Arc<Clip>>>,
    dropped: Arc<DropCounters>,
}

impl EngineEvents {
    /// Next event. Releases that overflowed the ring come after the ring is empty.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.events
            .pop()
            .ok()
            .or_else(|| self.graveyard.pop().map(EngineEvent::ClipReleased))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = EngineEvent> + '_ {
        std::iter::from_fn(move || self.try_recv())
    }

    pub fn try_recv_position(&mut self) -> Option<PositionReport> {
        self.positions.pop().ok()
    }

    pub fn drain_positions(&mut self) -> impl Iterator<Item = PositionReport> + '_ {
        std::iter::from_fn(move || self.positions.pop().ok())
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.events.load(Ordering::Relaxed)
    }

    pub fn dropped_positions(&self) -> u64 {
        self.dropped.positions.load(Ordering::Relaxed)
    }

    /// Clips the audio thread had to leak because every overflow slot was taken.
    pub fn leaked_clips(&self) -> u64 {
        self.dropped.leaked_clips.load(Ordering::Relaxed)
    }
}

pub(crate) fn event_channel(capacity: usize) -> (EventBridge, EngineEvents) {
    let (event_tx, event_rx) = RingBuffer::new(capacity.max(1));
    let (position_tx, position_rx) = RingBuffer::new(capacity.max(1));
    let dropped = Arc::new(DropCounters::default());
    let graveyard = Arc::new(ArrayQueue::new(GRAVEYARD_CAPACITY));
    (
        EventBridge {
            events: event_tx,
            positions: position_tx,
            parked: ArrayVec::new(),
            graveyard: Arc::clone(&graveyard),
            dropped: Arc::clone(&dropped),
        },
        EngineEvents {
            events: event_rx,
            positions: position_rx,
            graveyard,
            dropped,
        },
    )
}

/// A raw channel-voice message for the sampler, `frame` frames into the next callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiInputEvent {
    pub frame: u32,
    pub message: MidiMessage,
}

/// Producer half of the live MIDI input ring.
pub struct MidiInput {
    producer: Producer<MidiInputEvent>,
    dropped: u64,
}

impl MidiInput {
    /// Queues a message, returning `false` when the ring is full.
    pub fn send(&mut self, frame: u32, message: MidiMessage) -> bool {
        match self.producer.push(MidiInputEvent { frame, message }) {
            Ok(()) => true,
            Err(PushError::Full(_)) => {
                self.dropped = self.dropped.wrapping_add(1);
                tracing::warn!(dropped = self.dropped, "midi input ring full");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

pub(crate) fn midi_input_channel(capacity: usize) -> (MidiInput, Consumer<MidiInputEvent>) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    (
        MidiInput {
            producer,
            dropped: 0,
        },
        consumer,
    )
}
