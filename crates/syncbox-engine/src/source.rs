//! Sample sources played by the sampler and the per-slice settings that shape them.

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use crate::command::CommandKey;

pub type ClipId = u32;

/// Clips the audio side can address at once.
pub const MAX_REGISTERED_CLIPS: usize = 256;

/// Envelope timings in seconds, sustain as a level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdsrParameters {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for AdsrParameters {
    fn default() -> Self {
        Self {
            attack: 0.0,
            decay: 0.0,
            sustain: 1.0,
            release: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackStyle {
    /// Plays to the end, ignoring note-off.
    OneShot,
    #[default]
    NonLooping,
    Looping,
    Granular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PickingStyle {
    /// Every matching slice sounds.
    #[default]
    All,
    /// Only the first matching slice sounds.
    First,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GranularSettings {
    /// Grain origin as a fraction of the slice.
    pub position: f32,
    /// Random window as a fraction of the slice.
    pub spray: f32,
    pub scan: f32,
    /// Milliseconds between grains, 0 waits for the whole window.
    pub interval: f32,
    pub interval_additional: f32,
    /// Grain length in milliseconds.
    pub size: f32,
    pub size_additional: f32,
    pub pan_minimum: f32,
    pub pan_maximum: f32,
    pub pitch_minimum1: f32,
    pub pitch_maximum1: f32,
    pub pitch_minimum2: f32,
    pub pitch_maximum2: f32,
    /// Chance of picking from the first pitch range.
    pub pitch_priority: f32,
    /// Fraction of each grain held at full level.
    pub sustain: f32,
    /// Balance between grain attack and release.
    pub tilt: f32,
}

impl Default for GranularSettings {
    fn default() -> Self {
        Self {
            position: 0.0,
            spray: 1.0,
            scan: 0.0,
            interval: 10.0,
            interval_additional: 10.0,
            size: 100.0,
            size_additional: 50.0,
            pan_minimum: -1.0,
            pan_maximum: 1.0,
            pitch_minimum1: 1.0,
            pitch_maximum1: 1.0,
            pitch_minimum2: 1.0,
            pitch_maximum2: 1.0,
            pitch_priority: 0.5,
            sustain: 0.3,
            tilt: 0.5,
        }
    }
}

impl GranularSettings {
    pub fn grain_size(&self) -> f32 {
        self.size.max(1.0)
    }

    pub fn pitch_is_fixed(&self) -> bool {
        self.pitch_minimum1 == 1.0
            && self.pitch_maximum1 == 1.0
            && self.pitch_minimum2 == 1.0
            && self.pitch_maximum2 == 1.0
    }

    /// Envelope applied to every individual grain.
    pub fn envelope(&self) -> AdsrParameters {
        let sustain = self.sustain.clamp(0.0, 1.0);
        let tilt = self.tilt.clamp(0.0, 1.0);
        let ramps = self.grain_size() * (1.0 - sustain) / 1000.0;
        AdsrParameters {
            attack: ramps * tilt,
            decay: 0.0,
            sustain: 1.0,
            release: ramps * (1.0 - tilt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubvoiceSettings {
    pub pan: f32,
    pub pitch_semitones: f32,
    pub gain_db: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceSettings {
    /// `-1` for the root slice.
    pub index: i32,
    pub start_samples: usize,
    pub stop_samples: usize,
    /// Loop point relative to the start.
    pub loop_delta_samples: usize,
    pub root_note: u8,
    pub adsr: AdsrParameters,
    pub style: PlaybackStyle,
    pub pan: f32,
    pub gain_db: f32,
    /// Musical length, used to lock loops to the beat when it is whole.
    pub length_beats: f32,
    pub keyzone_start: u8,
    pub keyzone_end: u8,
    pub velocity_minimum: u8,
    pub velocity_maximum: u8,
    pub exclusivity_group: i32,
    pub granular: GranularSettings,
    pub subvoices: Vec<SubvoiceSettings>,
}

impl Default for SliceSettings {
    fn default() -> Self {
        Self {
            index: -1,
            start_samples: 0,
            stop_samples: 0,
            loop_delta_samples: 0,
            root_note: 60,
            adsr: AdsrParameters::default(),
            style: PlaybackStyle::default(),
            pan: 0.0,
            gain_db: 0.0,
            length_beats: 4.0,
            keyzone_start: 0,
            keyzone_end: 127,
            velocity_minimum: 1,
            velocity_maximum: 127,
            exclusivity_group: -1,
            granular: GranularSettings::default(),
            subvoices: Vec::new(),
        }
    }
}

impl SliceSettings {
    pub fn looping(&self) -> bool {
        self.style == PlaybackStyle::Looping
    }

    pub fn is_granular(&self) -> bool {
        self.style == PlaybackStyle::Granular
    }

    pub fn gain(&self) -> f32 {
        db_to_gain(self.gain_db)
    }

    pub fn envelope(&self) -> AdsrParameters {
        if self.is_granular() {
            self.granular.envelope()
        } else {
            self.adsr
        }
    }

    /// Whole number of beats, for beat-locked looping.
    pub fn snapped_length_beats(&self) -> Option<u64> {
        let beats = self.length_beats;
        (beats > 0.0 && beats.trunc() == beats).then_some(beats as u64)
    }

    pub fn start_seconds(&self, sample_rate: u32) -> f64 {
        self.start_samples as f64 / sample_rate.max(1) as f64
    }

    pub fn stop_seconds(&self, sample_rate: u32) -> f64 {
        self.stop_samples as f64 / sample_rate.max(1) as f64
    }

    pub fn accepts(&self, note: u8, velocity: u8, stopping: bool) -> bool {
        self.keyzone_start <= note
            && note <= self.keyzone_end
            && (stopping || (self.velocity_minimum <= velocity && velocity <= self.velocity_maximum))
    }

    pub fn subvoice(&self, index: i32) -> Option<&SubvoiceSettings> {
        usize::try_from(index).ok().and_then(|i| self.subvoices.get(i))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipSettings {
    pub root: SliceSettings,
    pub slices: Vec<SliceSettings>,
    /// Track whose sampler channel picks this clip for live notes, `-1` global.
    pub track: i8,
    /// Registered for keyzone playback from live MIDI.
    pub polyphonic: bool,
    pub slice_picking: PickingStyle,
    pub pitch_change_semitones: f32,
    pub speed_ratio: f32,
    pub gain_db: f32,
}

impl Default for ClipSettings {
    fn default() -> Self {
        Self {
            root: SliceSettings::default(),
            slices: Vec::new(),
            track: -1,
            polyphonic: false,
            slice_picking: PickingStyle::default(),
            pitch_change_semitones: 0.0,
            speed_ratio: 1.0,
            gain_db: 0.0,
        }
    }
}

impl ClipSettings {
    pub fn slice(&self, index: i32) -> &SliceSettings {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.slices.get(i))
            .unwrap_or(&self.root)
    }

    pub fn pitch_ratio(&self) -> f32 {
        2f32.powf(self.pitch_change_semitones / 12.0)
    }

    pub fn gain(&self) -> f32 {
        db_to_gain(self.gain_db)
    }
}

/// Decoded, immutable sample data plus swappable playback settings.
#[derive(Debug)]
pub struct Clip {
    id: ClipId,
    sample_rate: u32,
    left: Box<[f32]>,
    right: Option<Box<[f32]>>,
    settings: ArcSwap<ClipSettings>,
}

impl Clip {
    /// Creates a clip whose root slice spans the entire sample.
    pub fn new(id: ClipId, sample_rate: u32, left: Vec<f32>, right: Option<Vec<f32>>) -> Self {
        let mut settings = ClipSettings::default();
        settings.root.stop_samples = left.len();
        Self {
            id,
            sample_rate: sample_rate.max(1),
            left: left.into_boxed_slice(),
            right: right.map(Vec::into_boxed_slice),
            settings: ArcSwap::from_pointee(settings),
        }
    }

    pub fn with_settings(self, settings: ClipSettings) -> Self {
        self.settings.store(Arc::new(settings));
        self
    }

    pub fn id(&self) -> ClipId {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.left.len() as f64 / self.sample_rate as f64
    }

    #[inline]
    pub fn left(&self) -> &[f32] {
        &self.left
    }

    /// Right channel, the left one for mono sources.
    #[inline]
    pub fn right(&self) -> &[f32] {
        self.right.as_deref().unwrap_or(&self.left)
    }

    /// Lock-free snapshot for the audio thread.
    pub fn settings(&self) -> Guard<Arc<ClipSettings>> {
        self.settings.load()
    }

    pub fn update_settings(&self, update: impl FnOnce(&mut ClipSettings)) {
        let mut next = ClipSettings::clone(&self.settings.load());
        update(&mut next);
        self.settings.store(Arc::new(next));
    }
}

pub fn db_to_gain(db: f32) -> f32 {
    if db <= -96.0 {
        0.0
    } else {
        10f32.powf(db / 20.0)
    }
}

/// Playback progress published by the voices once per callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionReport {
    pub clip: ClipId,
    pub key: CommandKey,
    pub frame: u64,
    /// Position as a fraction of the whole sample.
    pub progress: f32,
    pub gain_left: f32,
    pub gain_right: f32,
    pub pan: f32,
    /// False for the final report of a voice that just stopped.
    pub playing: bool,
    /// Frame of the latest beat-locked loop restart.
    pub loop_restart_frame: Option<u64>,
    /// Source samples left over (positive) or waited out (negative) at that restart.
    pub loop_deviation: f32,
}

/// Clips known to the audio side. Mutated only by the dispatcher.
#[derive(Default)]
pub(crate) struct ClipRegistry {
    clips: ArrayVec<Arc<Clip>, MAX_REGISTERED_CLIPS>,
}

impl ClipRegistry {
    /// Adds or replaces a clip, returning whatever it displaced.
    pub(crate) fn insert(&mut self, clip: Arc<Clip>) -> Result<Option<Arc<Clip>>, Arc<Clip>> {
        if let Some(slot) = self.clips.iter_mut().find(|existing| existing.id() == clip.id()) {
            return Ok(Some(std::mem::replace(slot, clip)));
        }
        self.clips.try_push(clip).map(|_| None).map_err(|err| err.element())
    }

    pub(crate) fn remove(&mut self, id: ClipId) -> Option<Arc<Clip>> {
        let index = self.clips.iter().position(|clip| clip.id() == id)?;
        Some(self.clips.remove(index))
    }

    #[inline]
    pub(crate) fn get(&self, id: ClipId) -> Option<&Clip> {
        self.clips.iter().find(|clip| clip.id() == id).map(|clip| clip.as_ref())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Clip> {
        self.clips.iter().map(|clip| clip.as_ref())
    }

    pub(crate) fn len(&self) -> usize {
        self.clips.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_lookup_falls_back_to_root() {
        let mut settings = ClipSettings::default();
        settings.slices.push(SliceSettings {
            index: 0,
            root_note: 48,
            ..SliceSettings::default()
        });
        assert_eq!(settings.slice(0).root_note, 48);
        assert_eq!(settings.slice(-1).index, -1);
        assert_eq!(settings.slice(7).index, -1);
    }

    #[test]
    fn grain_envelope_splits_ramps_by_tilt() {
        let granular = GranularSettings {
            size: 200.0,
            sustain: 0.5,
            tilt: 0.25,
            ..GranularSettings::default()
        };
        let envelope = granular.envelope();
        assert!((envelope.attack - 0.025).abs() < 1e-6);
        assert!((envelope.release - 0.075).abs() < 1e-6);
        assert_eq!(envelope.sustain, 1.0);
    }

    #[test]
    fn snapped_length_requires_whole_beats() {
        let mut slice = SliceSettings::default();
        slice.length_beats = 2.0;
        assert_eq!(slice.snapped_length_beats(), Some(2));
        slice.length_beats = 2.5;
        assert_eq!(slice.snapped_length_beats(), None);
    }

    #[test]
    fn registry_replaces_by_id() {
        let mut registry = ClipRegistry::default();
        let first = Arc::new(Clip::new(1, 48_000, vec![0.0; 4], None));
        let second = Arc::new(Clip::new(1, 44_100, vec![0.0; 8], None));
        assert!(matches!(registry.insert(first), Ok(None)));
        let displaced = registry.insert(second).expect("room").expect("displaced");
        assert_eq!(displaced.sample_rate(), 48_000);
        assert_eq!(registry.get(1).map(Clip::len), Some(8));
        assert!(registry.remove(1).is_some());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn settings_swap_is_visible() {
        let clip = Clip::new(4, 48_000, vec![0.0; 100], None);
        assert_eq!(clip.settings().root.stop_samples, 100);
        clip.update_settings(|settings| settings.root.style = PlaybackStyle::Looping);
        assert!(clip.settings().root.looping());
    }
}
