//! DSP chain (spec.md §4.6 / C6): fade-in/out envelope, volume with
//! soft-clip limiting, then the 3-band EQ. Order is fixed: fade -> volume
//! (soft-clipped) -> EQ, so EQ boosts are applied after the limiter and are
//! not themselves clipped.

use super::eq::{EqGains, ThreeBandEq};
use super::filters::SoftLimiter;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy)]
pub struct DspConfig {
    pub volume: f32,
    pub fade_in_ms: u32,
    pub fade_out_ms: u32,
    pub eq: EqGains,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            fade_in_ms: 0,
            fade_out_ms: 0,
            eq: EqGains::flat(),
        }
    }
}

impl DspConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=2.0).contains(&self.volume) {
            return Err(PipelineError::InvalidArgument(format!(
                "volume {} out of range [0.0, 2.0]",
                self.volume
            )));
        }
        Ok(())
    }
}

enum FadeState {
    None,
    FadingIn { remaining: u64, total: u64 },
    Steady,
    FadingOut { remaining: u64, total: u64 },
    Done,
}

pub struct DspChain {
    volume: f32,
    limiter: SoftLimiter,
    eq: ThreeBandEq,
    fade: FadeState,
    total_frames: Option<u64>,
    fade_out_frames: u64,
    frames_processed: u64,
    sample_rate: u32,
}

impl DspChain {
    pub fn new(sample_rate: u32, config: DspConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let fade_in_frames = frames_for_ms(config.fade_in_ms, sample_rate);
        let fade = if fade_in_frames > 0 {
            FadeState::FadingIn {
                remaining: fade_in_frames,
                total: fade_in_frames,
            }
        } else {
            FadeState::Steady
        };
        let mut eq = ThreeBandEq::new(sample_rate as f32);
        eq.set_gains(config.eq);
        Ok(Self {
            volume: config.volume,
            limiter: SoftLimiter::new(),
            eq,
            fade,
            total_frames: None,
            fade_out_frames: frames_for_ms(config.fade_out_ms, sample_rate),
            frames_processed: 0,
            sample_rate,
        })
    }

    /// Total frame count must be known up front to schedule fade-out; a
    /// streaming source with unknown length simply never triggers it.
    pub fn set_total_frames(&mut self, total_frames: u64) {
        self.total_frames = Some(total_frames);
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<(), PipelineError> {
        if !(0.0..=2.0).contains(&volume) {
            return Err(PipelineError::InvalidArgument(format!(
                "volume {volume} out of range [0.0, 2.0]"
            )));
        }
        self.volume = volume;
        Ok(())
    }

    pub fn set_eq(&mut self, gains: EqGains) {
        self.eq.set_gains(gains);
    }

    fn fade_multiplier(&mut self) -> f32 {
        match &mut self.fade {
            FadeState::FadingIn { remaining, total } => {
                let progress = 1.0 - (*remaining as f32 / *total as f32);
                if *remaining == 0 {
                    self.fade = FadeState::Steady;
                    1.0
                } else {
                    *remaining -= 1;
                    progress
                }
            }
            FadeState::Steady | FadeState::None => {
                if let Some(total) = self.total_frames {
                    if self.fade_out_frames > 0
                        && self.frames_processed + self.fade_out_frames >= total
                    {
                        self.fade = FadeState::FadingOut {
                            remaining: total.saturating_sub(self.frames_processed),
                            total: self.fade_out_frames,
                        };
                        return self.fade_multiplier();
                    }
                }
                1.0
            }
            FadeState::FadingOut { remaining, total } => {
                if *remaining == 0 {
                    self.fade = FadeState::Done;
                    0.0
                } else {
                    let gain = *remaining as f32 / *total as f32;
                    *remaining -= 1;
                    gain
                }
            }
            FadeState::Done => 0.0,
        }
    }

    pub fn process_interleaved_stereo(&mut self, samples: &mut [f32]) {
        let volume_gain = self.volume;
        for frame in samples.chunks_exact_mut(2) {
            let fade_gain = self.fade_multiplier();
            let gain = volume_gain * fade_gain;
            let left = self.limiter.process_sample(frame[0] * gain);
            let right = self.limiter.process_sample(frame[1] * gain);
            let (left, right) = self.eq.process_stereo_frame(left, right);
            frame[0] = left;
            frame[1] = right;
            self.frames_processed += 1;
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn frames_for_ms(ms: u32, sample_rate: u32) -> u64 {
    (ms as u64 * sample_rate as u64) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fade_durations_leave_signal_at_full_gain_immediately() {
        let config = DspConfig {
            volume: 1.0,
            fade_in_ms: 0,
            fade_out_ms: 0,
            eq: EqGains::flat(),
        };
        let mut chain = DspChain::new(48_000, config).unwrap();
        let mut samples = vec![0.5, -0.5];
        chain.process_interleaved_stereo(&mut samples);
        assert!((samples[0] - 0.5).abs() < 0.05);
    }

    #[test]
    fn fade_in_ramps_from_silence() {
        let config = DspConfig {
            volume: 1.0,
            fade_in_ms: 100,
            fade_out_ms: 0,
            eq: EqGains::flat(),
        };
        let mut chain = DspChain::new(48_000, config).unwrap();
        let mut first_frame = vec![1.0, 1.0];
        chain.process_interleaved_stereo(&mut first_frame);
        assert!(first_frame[0].abs() < 0.1);
    }

    #[test]
    fn volume_out_of_range_is_rejected() {
        let config = DspConfig {
            volume: 3.0,
            ..Default::default()
        };
        assert!(matches!(
            DspChain::new(48_000, config),
            Err(PipelineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn fade_out_reaches_silence_at_known_end() {
        let config = DspConfig {
            volume: 1.0,
            fade_in_ms: 0,
            fade_out_ms: 10,
            eq: EqGains::flat(),
        };
        let mut chain = DspChain::new(48_000, config).unwrap();
        chain.set_total_frames(480); // 10ms at 48kHz
        let mut samples = vec![1.0_f32; 480 * 2];
        chain.process_interleaved_stereo(&mut samples);
        let last_frame_left = samples[samples.len() - 2];
        assert!(last_frame_left.abs() < 0.2);
    }
}
