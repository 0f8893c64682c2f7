use crate::source::AdsrParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvelopeState {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Linear ADSR. Zero-length stages are skipped, and the release ramp starts
/// from whatever level the envelope had reached.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AdsrEnvelope {
    parameters: AdsrParameters,
    sample_rate: f32,
    state: EnvelopeState,
    value: f32,
    attack_rate: f32,
    decay_rate: f32,
    release_rate: f32,
}

impl Default for AdsrEnvelope {
    fn default() -> Self {
        Self {
            parameters: AdsrParameters::default(),
            sample_rate: 48_000.0,
            state: EnvelopeState::Idle,
            value: 0.0,
            attack_rate: 0.0,
            decay_rate: 0.0,
            release_rate: 0.0,
        }
    }
}

impl AdsrEnvelope {
    pub(crate) fn set_parameters(&mut self, parameters: AdsrParameters, sample_rate: f32) {
        self.sample_rate = sample_rate.max(1.0);
        self.parameters = AdsrParameters {
            attack: parameters.attack.max(0.0),
            decay: parameters.decay.max(0.0),
            sustain: parameters.sustain.clamp(0.0, 1.0),
            release: parameters.release.max(0.0),
        };
        self.attack_rate = self.rate(1.0, self.parameters.attack);
        self.decay_rate = self.rate(1.0 - self.parameters.sustain, self.parameters.decay);
        self.release_rate = self.rate(self.parameters.sustain, self.parameters.release);
    }

    fn rate(&self, distance: f32, seconds: f32) -> f32 {
        if seconds > 0.0 {
            distance / (seconds * self.sample_rate)
        } else {
            -1.0
        }
    }

    pub(crate) fn reset(&mut self) {
        self.value = 0.0;
        self.state = EnvelopeState::Idle;
    }

    pub(crate) fn note_on(&mut self) {
        if self.attack_rate > 0.0 {
            self.state = EnvelopeState::Attack;
        } else if self.decay_rate > 0.0 {
            self.value = 1.0;
            self.state = EnvelopeState::Decay;
        } else {
            self.value = self.parameters.sustain;
            self.state = EnvelopeState::Sustain;
        }
    }

    pub(crate) fn note_off(&mut self) {
        if self.state == EnvelopeState::Idle {
            return;
        }
        if self.parameters.release > 0.0 {
            self.release_rate = self.value / (self.parameters.release * self.sample_rate);
            self.state = EnvelopeState::Release;
        } else {
            self.reset();
        }
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.state != EnvelopeState::Idle
    }

    pub(crate) fn is_releasing(&self) -> bool {
        self.state == EnvelopeState::Release
    }

    pub(crate) fn release_seconds(&self) -> f32 {
        self.parameters.release
    }

    #[inline]
    pub(crate) fn next_sample(&mut self) -> f32 {
        match self.state {
            EnvelopeState::Idle => return 0.0,
            EnvelopeState::Attack => {
                self.value += self.attack_rate;
                if self.value >= 1.0 {
                    self.value = 1.0;
                    if self.decay_rate > 0.0 {
                        self.state = EnvelopeState::Decay;
                    } else {
                        self.value = self.parameters.sustain;
                        self.state = EnvelopeState::Sustain;
                    }
                }
            }
            EnvelopeState::Decay => {
                self.value -= self.decay_rate;
                if self.value <= self.parameters.sustain {
                    self.value = self.parameters.sustain;
                    self.state = EnvelopeState::Sustain;
                }
            }
            EnvelopeState::Sustain => self.value = self.parameters.sustain,
            EnvelopeState::Release => {
                self.value -= self.release_rate;
                if self.value <= 0.0 {
                    self.reset();
                }
            }
        }
        self.value
    }
}
