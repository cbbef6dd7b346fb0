//! `AudioMetadata`, the value record carried in every stage's wire header
//! (spec.md §3).

use serde::{Deserialize, Serialize};

pub const HIGH_RES_THRESHOLD_HZ: u32 = 96_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_number: Option<u32>,
    #[serde(default)]
    pub duration_seconds: f64,
    pub sample_rate: u32,
    #[serde(default)]
    pub original_sample_rate: u32,
    pub bit_depth: u16,
    #[serde(default)]
    pub original_bit_depth: u16,
    pub channels: u16,
    #[serde(default)]
    pub sample_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub is_lossless: bool,
    #[serde(default)]
    pub is_high_res: bool,
}

impl AudioMetadata {
    /// Invariant required before this metadata may reach the wire (spec.md §3).
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample_rate must be > 0".into());
        }
        if !(1..=8).contains(&self.channels) {
            return Err(format!("channels {} outside [1,8]", self.channels));
        }
        Ok(())
    }

    pub fn recompute_high_res(&mut self) {
        self.is_high_res = self.sample_rate >= HIGH_RES_THRESHOLD_HZ;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_sample_rate() {
        let meta = AudioMetadata {
            sample_rate: 0,
            channels: 2,
            ..Default::default()
        };
        assert!(meta.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_channels() {
        let meta = AudioMetadata {
            sample_rate: 44_100,
            channels: 9,
            ..Default::default()
        };
        assert!(meta.validate().is_err());
    }

    #[test]
    fn high_res_threshold() {
        let mut meta = AudioMetadata {
            sample_rate: 96_000,
            channels: 2,
            ..Default::default()
        };
        meta.recompute_high_res();
        assert!(meta.is_high_res);
    }
}
