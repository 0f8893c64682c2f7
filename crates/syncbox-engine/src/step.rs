//! Ring of future ticks written by control code and drained by the audio callback.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam::utils::Backoff;

use crate::command::{ClipCommand, ClipHandle, CommandPool, TimerHandle, TimerRecord};
use crate::config::MIDI_CHANNEL_COUNT;
use crate::midi::MidiMessage;

const PLAYED: u8 = 0;
const PENDING: u8 = 1;
const WRITING: u8 = 2;
const READING: u8 = 3;

const NOTE_COUNT: usize = 128;

/// Everything due on one tick.
#[derive(Debug)]
pub(crate) struct Step {
    pub(crate) tracks: Box<[Vec<MidiMessage>]>,
    pub(crate) clips: Vec<ClipHandle>,
    pub(crate) timers: Vec<TimerHandle>,
}

impl Step {
    fn new(track_count: usize) -> Self {
        Self {
            tracks: (0..track_count).map(|_| Vec::new()).collect(),
            clips: Vec::new(),
            timers: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.clips.is_empty() && self.timers.is_empty() && self.tracks.iter().all(Vec::is_empty)
    }

    /// A played slot must come back empty; anything left over is stale from a
    /// previous lap and gets discarded.
    fn ensure_fresh(
        &mut self,
        clip_pool: &CommandPool<ClipCommand>,
        timer_pool: &CommandPool<TimerRecord>,
        now_usecs: u64,
    ) {
        if self.is_empty() {
            return;
        }
        tracing::error!(
            clips = self.clips.len(),
            timers = self.timers.len(),
            "played step still holds data, discarding it"
        );
        for track in self.tracks.iter_mut() {
            track.clear();
        }
        for handle in self.clips.drain(..) {
            clip_pool.release(handle, now_usecs);
        }
        for mut handle in self.timers.drain(..) {
            if let Some(clip) = timer_pool.get_mut(&mut handle).clip_command.take() {
                clip_pool.release(clip, now_usecs);
            }
            timer_pool.release(handle, now_usecs);
        }
    }
}

struct StepSlot {
    state: AtomicU8,
    step: UnsafeCell<Step>,
}

// The state byte hands out exclusive access: only the thread that moved it to
// WRITING or READING touches `step` until it stores PLAYED or PENDING again.
unsafe impl Sync for StepSlot {}

/// Result of the audio thread trying to take a step.
pub(crate) enum Claim<'a> {
    Empty,
    /// A writer holds the slot right now.
    Busy,
    Ready(StepGuard<'a>),
}

pub(crate) struct StepGuard<'a> {
    slot: &'a StepSlot,
}

impl Deref for StepGuard<'_> {
    type Target = Step;

    fn deref(&self) -> &Step {
        unsafe { &*self.slot.step.get() }
    }
}

impl DerefMut for StepGuard<'_> {
    fn deref_mut(&mut self) -> &mut Step {
        unsafe { &mut *self.slot.step.get() }
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        self.slot.state.store(PLAYED, Ordering::Release);
    }
}

pub(crate) struct StepRing {
    slots: Box<[StepSlot]>,
}

impl StepRing {
    pub(crate) fn new(capacity: usize, track_count: usize) -> Self {
        let slots = (0..capacity.max(1))
            .map(|_| StepSlot {
                state: AtomicU8::new(PLAYED),
                step: UnsafeCell::new(Step::new(track_count)),
            })
            .collect();
        Self { slots }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_pending(&self, index: usize) -> bool {
        self.slots[index % self.slots.len()].state.load(Ordering::Acquire) == PENDING
    }

    /// Takes exclusive write access to the slot `locate` points at. The
    /// location is resolved again after waiting, since the read head may have
    /// moved past the slot in the meantime.
    pub(crate) fn write<R>(
        &self,
        locate: impl Fn() -> usize,
        clip_pool: &CommandPool<ClipCommand>,
        timer_pool: &CommandPool<TimerRecord>,
        now_usecs: u64,
        update: impl FnOnce(&mut Step, usize) -> R,
    ) -> R {
        let backoff = Backoff::new();
        loop {
            let index = locate() % self.slots.len();
            let slot = &self.slots[index];
            let state = slot.state.load(Ordering::Acquire);
            if (state == PLAYED || state == PENDING)
                && slot
                    .state
                    .compare_exchange(state, WRITING, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                let step = unsafe { &mut *slot.step.get() };
                if state == PLAYED {
                    step.ensure_fresh(clip_pool, timer_pool, now_usecs);
                }
                let result = update(step, index);
                let next = if step.is_empty() { PLAYED } else { PENDING };
                slot.state.store(next, Ordering::Release);
                return result;
            }
            backoff.snooze();
        }
    }

    /// Writes into a slot only if it currently holds unplayed data.
    pub(crate) fn write_if_pending<R>(
        &self,
        index: usize,
        update: impl FnOnce(&mut Step) -> R,
    ) -> Option<R> {
        let slot = &self.slots[index % self.slots.len()];
        let backoff = Backoff::new();
        loop {
            match slot.state.load(Ordering::Acquire) {
                PLAYED => return None,
                PENDING => {
                    if slot
                        .state
                        .compare_exchange(PENDING, WRITING, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        let step = unsafe { &mut *slot.step.get() };
                        let result = update(step);
                        let next = if step.is_empty() { PLAYED } else { PENDING };
                        slot.state.store(next, Ordering::Release);
                        return Some(result);
                    }
                }
                _ => backoff.snooze(),
            }
        }
    }

    /// Audio side: never waits.
    pub(crate) fn claim(&self, index: usize) -> Claim<'_> {
        let slot = &self.slots[index % self.slots.len()];
        match slot
            .state
            .compare_exchange(PENDING, READING, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Claim::Ready(StepGuard { slot }),
            Err(WRITING) => Claim::Busy,
            Err(_) => Claim::Empty,
        }
    }
}

/// Per-track record of which MIDI channels are sounding and until when.
#[derive(Clone)]
struct TrackChannels {
    note_activations: Box<[[u64; NOTE_COUNT]; MIDI_CHANNEL_COUNT]>,
    channel_available_after: [u64; MIDI_CHANNEL_COUNT],
}

impl TrackChannels {
    fn new() -> Self {
        Self {
            note_activations: Box::new([[0; NOTE_COUNT]; MIDI_CHANNEL_COUNT]),
            channel_available_after: [0; MIDI_CHANNEL_COUNT],
        }
    }

    fn register_activation(&mut self, channel: usize, note: usize) {
        self.note_activations[channel][note] = u64::MAX;
        self.channel_available_after[channel] = u64::MAX;
    }

    fn register_deactivation(&mut self, channel: usize, note: usize, tick: u64) {
        self.note_activations[channel][note] = tick;
        self.channel_available_after[channel] =
            self.note_activations[channel].iter().copied().max().unwrap_or(0);
    }

    fn clear(&mut self) {
        for notes in self.note_activations.iter_mut() {
            notes.fill(0);
        }
        self.channel_available_after.fill(0);
    }
}

/// Channel availability table used for polyphonic note allocation.
pub(crate) struct ChannelTable {
    tracks: Vec<TrackChannels>,
    master_channel: usize,
}

impl ChannelTable {
    pub(crate) fn new(track_count: usize, master_channel: u8) -> Self {
        Self {
            tracks: vec![TrackChannels::new(); track_count.max(1)],
            master_channel: master_channel as usize,
        }
    }

    /// Tracks note-on and note-off messages on their way into the ring.
    pub(crate) fn observe(&mut self, track: usize, message: &MidiMessage, tick: u64) {
        if message.len != 3 {
            return;
        }
        let Some(channels) = self.tracks.get_mut(track) else {
            return;
        };
        let channel = message.channel() as usize;
        let note = (message.data[1] & 0x7F) as usize;
        match message.data[0] & 0xF0 {
            crate::midi::NOTE_OFF => channels.register_deactivation(channel, note, tick),
            crate::midi::NOTE_ON => channels.register_activation(channel, note),
            _ => {}
        }
    }

    pub(crate) fn register_activation(&mut self, track: usize, channel: u8, note: u8) {
        if let Some(channels) = self.tracks.get_mut(track) {
            channels.register_activation((channel & 0x0F) as usize, (note & 0x7F) as usize);
        }
    }

    pub(crate) fn register_deactivation(&mut self, track: usize, channel: u8, note: u8, tick: u64) {
        if let Some(channels) = self.tracks.get_mut(track) {
            channels.register_deactivation((channel & 0x0F) as usize, (note & 0x7F) as usize, tick);
        }
    }

    pub(crate) fn clear(&mut self) {
        for channels in self.tracks.iter_mut() {
            channels.clear();
        }
    }

    /// Picks a channel that is free from `available_from` on and marks it busy
    /// until note activity on it says otherwise.
    pub(crate) fn next_available_channel(&mut self, track: usize, available_from: u64) -> u8 {
        let master = self.master_channel;
        let Some(channels) = self.tracks.get_mut(track) else {
            return if master == 0 { 1 } else { 0 };
        };
        let free = (0..MIDI_CHANNEL_COUNT)
            .filter(|&channel| channel != master)
            .find(|&channel| channels.channel_available_after[channel] < available_from);
        let channel = free
            .or_else(|| {
                // Every channel is busy: reuse whichever frees up first.
                let mut oldest = None;
                let mut oldest_tick = u64::MAX;
                for (channel, &tick) in channels.channel_available_after.iter().enumerate() {
                    if channel != master && tick < oldest_tick {
                        oldest_tick = tick;
                        oldest = Some(channel);
                    }
                }
                oldest
            })
            .unwrap_or(if master == 0 { 1 } else { 0 });
        channels.channel_available_after[channel] = u64::MAX;
        channel as u8
    }

    #[cfg(test)]
    fn available_after(&self, track: usize, channel: usize) -> u64 {
        self.tracks[track].channel_available_after[channel]
    }
}
