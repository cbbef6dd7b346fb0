//! Format converter (spec.md §4.4 / C4): bridges an upstream PCM stream to a
//! downstream stage at a possibly different sample rate and bit depth,
//! running sample-rate conversion chunk-by-chunk with persistent filter
//! state so chunk boundaries never produce audible discontinuities.

use crate::decode::{sinc_params, ResampleQuality};
use crate::error::PipelineError;
use rubato::{Resampler, SincFixedIn};

pub const DEFAULT_CHUNK_FRAMES: usize = 4096;
pub const MIN_CHUNK_FRAMES: usize = 1;
pub const MAX_CHUNK_FRAMES: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Float32,
    Int16,
    Int24,
    Int32,
}

impl BitDepth {
    pub fn bits(self) -> u16 {
        match self {
            BitDepth::Float32 => 32,
            BitDepth::Int16 => 16,
            BitDepth::Int24 => 24,
            BitDepth::Int32 => 32,
        }
    }
}

impl TryFrom<u16> for BitDepth {
    type Error = PipelineError;
    fn try_from(value: u16) -> Result<Self, PipelineError> {
        match value {
            16 => Ok(BitDepth::Int16),
            24 => Ok(BitDepth::Int24),
            32 => Ok(BitDepth::Int32), // caller distinguishes float/int via a separate flag
            other => Err(PipelineError::BitDepthNotSupported(other)),
        }
    }
}

/// Streaming sample-rate converter carrying `rubato` filter state across
/// calls to `process()` so chunk boundaries stay seamless (spec.md §4.4).
pub struct StreamingResampler {
    inner: Option<SincFixedIn<f32>>,
    channels: usize,
    ratio: f64,
}

impl StreamingResampler {
    pub fn new(
        in_rate: u32,
        out_rate: u32,
        channels: usize,
        chunk_frames: usize,
        quality: ResampleQuality,
    ) -> Result<Self, PipelineError> {
        if in_rate == out_rate {
            return Ok(Self {
                inner: None,
                channels,
                ratio: 1.0,
            });
        }
        let ratio = out_rate as f64 / in_rate as f64;
        let params = sinc_params(quality);
        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_frames, channels)
            .map_err(|e| PipelineError::AudioDecodeError(e.to_string()))?;
        Ok(Self {
            inner: Some(resampler),
            channels,
            ratio,
        })
    }

    /// Output buffer should be pre-reserved to roughly `ceil(input_frames *
    /// ratio) + margin` per spec.md §4.4; this returns the interleaved,
    /// already-sized result directly.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>, PipelineError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(interleaved.to_vec());
        };
        let channels = self.channels;
        let frames = interleaved.len() / channels.max(1);
        let margin = 16;
        let mut out = Vec::with_capacity(((frames as f64 * self.ratio) as usize + margin) * channels);

        let mut planar: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels];
        for frame in interleaved.chunks_exact(channels) {
            for (ch, sample) in frame.iter().enumerate() {
                planar[ch].push(*sample);
            }
        }
        let produced = resampler
            .process(&planar, None)
            .map_err(|e| PipelineError::AudioDecodeError(e.to_string()))?;
        interleave_into(&produced, &mut out);
        Ok(out)
    }

    /// Drains any samples buffered in the filter state by feeding empty
    /// input until 0 frames come back.
    pub fn drain(&mut self) -> Result<Vec<f32>, PipelineError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        loop {
            let empty = vec![Vec::<f32>::new(); self.channels];
            let produced = resampler
                .process_partial(Some(&empty), None)
                .map_err(|e| PipelineError::AudioDecodeError(e.to_string()))?;
            if produced.is_empty() || produced[0].is_empty() {
                break;
            }
            interleave_into(&produced, &mut out);
        }
        Ok(out)
    }
}

fn interleave_into(planar: &[Vec<f32>], out: &mut Vec<f32>) {
    if planar.is_empty() {
        return;
    }
    let frames = planar[0].len();
    for frame in 0..frames {
        for channel in planar {
            out.push(channel[frame]);
        }
    }
}

/// Converts float32 samples in `[-1, 1]` to integer PCM bytes of the target
/// bit depth, symmetric scale, round-to-nearest, clamped to range. Float32
/// output is a direct passthrough (spec.md §4.4).
pub fn convert_bit_depth(samples: &[f32], depth: BitDepth) -> Vec<u8> {
    match depth {
        BitDepth::Float32 => {
            let mut out = Vec::with_capacity(samples.len() * 4);
            for s in samples {
                out.extend_from_slice(&s.to_le_bytes());
            }
            out
        }
        BitDepth::Int16 => {
            let mut out = Vec::with_capacity(samples.len() * 2);
            for s in samples {
                let scaled = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                out.extend_from_slice(&scaled.to_le_bytes());
            }
            out
        }
        BitDepth::Int24 => {
            let mut out = Vec::with_capacity(samples.len() * 3);
            for s in samples {
                let scaled = (s.clamp(-1.0, 1.0) * 8_388_607.0_f32).round() as i32;
                let bytes = scaled.to_le_bytes();
                out.extend_from_slice(&bytes[0..3]);
            }
            out
        }
        BitDepth::Int32 => {
            let mut out = Vec::with_capacity(samples.len() * 4);
            for s in samples {
                let scaled = (s.clamp(-1.0, 1.0) * i32::MAX as f32).round() as i32;
                out.extend_from_slice(&scaled.to_le_bytes());
            }
            out
        }
    }
}

pub fn clamp_chunk_size(frames: usize) -> usize {
    frames.clamp(MIN_CHUNK_FRAMES, MAX_CHUNK_FRAMES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rate_is_passthrough() {
        let mut r = StreamingResampler::new(48_000, 48_000, 2, 1024, ResampleQuality::default()).unwrap();
        let input = vec![0.1_f32, -0.1, 0.2, -0.2];
        let out = r.process(&input).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn bit_depth_conversion_clamps_and_rounds() {
        let samples = vec![1.5_f32, -1.5, 0.0];
        let bytes = convert_bit_depth(&samples, BitDepth::Int16);
        assert_eq!(bytes.len(), 6);
        let first = i16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(first, i16::MAX);
        let second = i16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(second, -i16::MAX);
    }

    #[test]
    fn float32_passthrough_round_trips() {
        let samples = vec![0.25_f32, -0.75];
        let bytes = convert_bit_depth(&samples, BitDepth::Float32);
        let back = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(back, 0.25);
    }

    #[test]
    fn chunk_size_is_clamped_to_valid_range() {
        assert_eq!(clamp_chunk_size(0), MIN_CHUNK_FRAMES);
        assert_eq!(clamp_chunk_size(100_000), MAX_CHUNK_FRAMES);
        assert_eq!(clamp_chunk_size(4096), 4096);
    }
}
