use std::f32::consts::PI;

/// Lowest and highest cutoff reachable from a controller.
const CUTOFF_MINIMUM_HZ: f32 = 20.0;
const CUTOFF_RANGE: f32 = 1_000.0;

/// Maps a 7-bit controller value onto 20 Hz..20 kHz.
pub(crate) fn controller_cutoff(value: u8) -> f32 {
    CUTOFF_MINIMUM_HZ * CUTOFF_RANGE.powf(value.min(127) as f32 / 127.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FilterMode {
    LowPass,
    HighPass,
}

/// Stereo one-pole filter, bypassed until a cutoff is set.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OnePoleFilter {
    mode: FilterMode,
    alpha: Option<f32>,
    state: [f32; 2],
}

impl OnePoleFilter {
    pub(crate) const fn new(mode: FilterMode) -> Self {
        Self {
            mode,
            alpha: None,
            state: [0.0; 2],
        }
    }

    pub(crate) fn set_cutoff(&mut self, cutoff: Option<f32>, sample_rate: f32) {
        self.alpha = cutoff.map(|cutoff| {
            let omega = 2.0 * PI * cutoff / sample_rate.max(1.0);
            omega / (omega + 1.0)
        });
    }

    pub(crate) fn reset(&mut self) {
        self.alpha = None;
        self.state = [0.0; 2];
    }

    #[inline]
    pub(crate) fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let Some(alpha) = self.alpha else {
            return (left, right);
        };
        self.state[0] += alpha * (left - self.state[0]);
        self.state[1] += alpha * (right - self.state[1]);
        match self.mode {
            FilterMode::LowPass => (self.state[0], self.state[1]),
            FilterMode::HighPass => (left - self.state[0], right - self.state[1]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowpass_settles_on_dc_and_highpass_rejects_it() {
        let mut low = OnePoleFilter::new(FilterMode::LowPass);
        let mut high = OnePoleFilter::new(FilterMode::HighPass);
        assert_eq!(low.process(0.3, 0.3), (0.3, 0.3));
        low.set_cutoff(Some(1_000.0), 48_000.0);
        high.set_cutoff(Some(1_000.0), 48_000.0);
        let mut last = (0.0, 0.0);
        let mut residue = (1.0, 1.0);
        for _ in 0..2_000 {
            last = low.process(1.0, 1.0);
            residue = high.process(1.0, 1.0);
        }
        assert!((last.0 - 1.0).abs() < 1e-3);
        assert!(residue.1.abs() < 1e-3);
    }

    #[test]
    fn controller_range_spans_the_audible_band() {
        assert!((controller_cutoff(0) - 20.0).abs() < 1e-3);
        assert!((controller_cutoff(127) - 20_000.0).abs() < 1.0);
    }
}
