//! Device enumeration and stream construction (spec.md §4.7 / C7), running
//! on every `cpal` host and reporting format mismatches explicitly instead
//! of silently falling back.

use crate::error::PipelineError;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig};

pub struct ResolvedOutput {
    pub config: StreamConfig,
    pub sample_format: SampleFormat,
    pub exact_rate_match: bool,
}

/// Picks an output device by name, or the host default when `name` is `None`.
pub fn select_device(name: Option<&str>) -> Result<Device, PipelineError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| PipelineError::DeviceUnavailable("no default output device".into())),
        Some(wanted) => {
            let mut devices = host
                .output_devices()
                .map_err(|e| PipelineError::DeviceUnavailable(e.to_string()))?;
            devices
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| PipelineError::DeviceUnavailable(format!("no output device named '{wanted}'")))
        }
    }
}

pub fn list_device_names() -> Result<Vec<String>, PipelineError> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| PipelineError::DeviceUnavailable(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Negotiates a stream configuration for `(sample_rate, channels)`. Prefers
/// an exact rate + channel + f32 match; falls back to the device's best
/// available config otherwise and reports the mismatch via
/// `exact_rate_match` rather than silently resampling here (spec.md
/// §4.7: format mismatch is surfaced, the outer resampler handles it).
pub fn resolve_output_config(
    device: &Device,
    sample_rate: u32,
    channels: u16,
) -> Result<ResolvedOutput, PipelineError> {
    let mut preferred: Option<ResolvedOutput> = None;
    let mut fallback: Option<ResolvedOutput> = None;

    let ranges = device
        .supported_output_configs()
        .map_err(|e| PipelineError::DeviceOpenFailed(e.to_string()))?;

    for cfg in ranges {
        let cfg_channels = cfg.channels();
        let sample_format = cfg.sample_format();
        let min = cfg.min_sample_rate().0;
        let max = cfg.max_sample_rate().0;
        let exact_rate = sample_rate >= min && sample_rate <= max;
        let f32_preferred = matches!(sample_format, SampleFormat::F32);

        if cfg_channels == channels && exact_rate {
            let chosen = ResolvedOutput {
                config: StreamConfig {
                    channels: cfg_channels,
                    sample_rate: SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                },
                sample_format,
                exact_rate_match: true,
            };
            if f32_preferred {
                return Ok(chosen);
            }
            preferred = Some(chosen);
        }

        if fallback.is_none() || f32_preferred {
            fallback = Some(ResolvedOutput {
                config: StreamConfig {
                    channels: cfg_channels,
                    sample_rate: cfg.max_sample_rate(),
                    buffer_size: cpal::BufferSize::Default,
                },
                sample_format,
                exact_rate_match: false,
            });
        }
    }

    preferred
        .or(fallback)
        .ok_or_else(|| PipelineError::DeviceOpenFailed("no output stream configuration available".into()))
}

pub fn adapt_channels(input: &[f32], in_channels: usize, out_channels: usize) -> Vec<f32> {
    if in_channels == out_channels || in_channels == 0 || out_channels == 0 {
        return input.to_vec();
    }
    let frames = input.len() / in_channels;
    let mut out = vec![0.0_f32; frames * out_channels];
    for frame in 0..frames {
        for ch in 0..out_channels {
            out[frame * out_channels + ch] = input[frame * in_channels + (ch % in_channels)];
        }
    }
    out
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

pub fn f32_to_u16(sample: f32) -> u16 {
    (((sample.clamp(-1.0, 1.0) + 1.0) * 0.5) * u16::MAX as f32).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapt_channels_is_identity_when_counts_match() {
        let input = vec![0.1, 0.2, 0.3, 0.4];
        let out = adapt_channels(&input, 2, 2);
        assert_eq!(out, input);
    }

    #[test]
    fn adapt_channels_duplicates_mono_to_stereo() {
        let input = vec![0.5, -0.5];
        let out = adapt_channels(&input, 1, 2);
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn f32_to_i16_clamps_extremes() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
    }

    #[test]
    fn f32_to_u16_maps_zero_to_midpoint() {
        let mid = f32_to_u16(0.0);
        assert!((mid as i32 - (u16::MAX as i32 / 2)).abs() < 2);
    }
}
