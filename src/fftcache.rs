//! Content-addressed FFT cache (spec.md §4.5 / C5): windowed STFT artifacts
//! keyed by `SHA256(pcm_bytes || sample_rate || fft_size)`, written
//! atomically (`<name>.tmp` + rename), using rustfft Hann-window magnitude
//! computation and a per-file (not per-directory) atomic rename discipline.

use crate::error::PipelineError;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const CACHE_VERSION: u32 = 1;
pub const MIN_FFT_SIZE: usize = 1024;
pub const MAX_FFT_SIZE: usize = 8192;
const DB_FLOOR: f32 = -100.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FftCacheConfig {
    pub fft_size: usize,
    pub window: String,
    pub version: u32,
    pub samples: usize,
    pub sample_rate: u32,
    pub overlap: usize,
    pub channels: u16,
}

#[derive(Debug, Clone)]
pub struct FftCacheEntry {
    pub config: FftCacheConfig,
    pub magnitude: Vec<f32>,
    pub phase: Vec<f32>,
    pub frequencies: Vec<f32>,
}

pub struct FftCache {
    root: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FftCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn key(pcm_bytes: &[u8], sample_rate: u32, fft_size: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(pcm_bytes);
        hasher.update(sample_rate.to_le_bytes());
        hasher.update((fft_size as u64).to_le_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join("fft").join(key)
    }

    /// Returns a cached entry if `magnitude.bin`, `phase.bin` and
    /// `config.json` are all present; a partially written entry (only some
    /// files present) is treated as a miss, per spec.md §4.5.
    pub fn get(&self, key: &str) -> Option<FftCacheEntry> {
        let dir = self.entry_dir(key);
        let config_path = dir.join("config.json");
        let mag_path = dir.join("magnitude.bin");
        let phase_path = dir.join("phase.bin");
        if !(config_path.is_file() && mag_path.is_file() && phase_path.is_file()) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let config: FftCacheConfig = match fs::read(&config_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        {
            Some(c) => c,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let magnitude = match read_f32_array(&mag_path) {
            Some(v) => v,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let phase = match read_f32_array(&phase_path) {
            Some(v) => v,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let frequencies = bin_frequencies(config.fft_size, config.sample_rate);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(FftCacheEntry {
            config,
            magnitude,
            phase,
            frequencies,
        })
    }

    /// Computes a single windowed FFT frame over `pcm` (interleaved,
    /// downmixed to mono internally) and writes it atomically. Concurrent
    /// writers for the same key are tolerated: the rename is atomic, and
    /// identical inputs produce byte-identical artifacts (spec.md §4.5,
    /// §8 invariant 3), so last-writer-wins is safe.
    pub fn compute_and_store(
        &self,
        key: &str,
        pcm_interleaved: &[f32],
        channels: u16,
        sample_rate: u32,
        fft_size: usize,
        window: &str,
    ) -> Result<FftCacheEntry, PipelineError> {
        if !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) || !fft_size.is_power_of_two() {
            return Err(PipelineError::InvalidArgument(format!(
                "fft_size {fft_size} must be a power of two in [{MIN_FFT_SIZE}, {MAX_FFT_SIZE}]"
            )));
        }
        let mono = downmix_to_mono(pcm_interleaved, channels as usize);
        let (magnitude, phase) = compute_fft(&mono, fft_size);
        let frequencies = bin_frequencies(fft_size, sample_rate);
        let config = FftCacheConfig {
            fft_size,
            window: window.to_string(),
            version: CACHE_VERSION,
            samples: mono.len(),
            sample_rate,
            overlap: 0,
            channels,
        };

        let dir = self.entry_dir(key);
        fs::create_dir_all(&dir).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        write_atomic(&dir.join("magnitude.bin"), &f32_array_bytes(&magnitude))?;
        write_atomic(&dir.join("phase.bin"), &f32_array_bytes(&phase))?;
        let config_json = serde_json::to_vec_pretty(&config)
            .map_err(|e| PipelineError::CacheValidationError(e.to_string()))?;
        write_atomic(&dir.join("config.json"), &config_json)?;

        Ok(FftCacheEntry {
            config,
            magnitude,
            phase,
            frequencies,
        })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    fs::write(&tmp, bytes).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
    Ok(())
}

fn f32_array_bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_ne_bytes());
    }
    out
}

fn read_f32_array(path: &Path) -> Option<Vec<f32>> {
    let bytes = fs::read(path).ok()?;
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Hann window, zero-padding short input and truncating longer input to the
/// first `fft_size` frames (spec.md §4.5). Returns `(magnitude_db,
/// phase_radians)`, each of length `fft_size/2 + 1`.
fn compute_fft(mono: &[f32], fft_size: usize) -> (Vec<f32>, Vec<f32>) {
    let half = fft_size / 2 + 1;
    let frames = mono.len().min(fft_size);

    let mut buffer: Vec<Complex<f32>> = (0..fft_size)
        .map(|i| {
            if i < frames {
                let window = 0.5
                    * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (fft_size - 1) as f32).cos());
                Complex::new(mono[i] * window, 0.0)
            } else {
                Complex::new(0.0, 0.0)
            }
        })
        .collect();

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(fft_size);
    fft.process(&mut buffer);

    let magnitude: Vec<f32> = buffer[..half]
        .iter()
        .map(|c| (20.0 * c.norm().max(1e-10).log10()).max(DB_FLOOR))
        .collect();
    let phase: Vec<f32> = buffer[..half].iter().map(|c| c.im.atan2(c.re)).collect();
    (magnitude, phase)
}

fn bin_frequencies(fft_size: usize, sample_rate: u32) -> Vec<f32> {
    let half = fft_size / 2 + 1;
    (0..half)
        .map(|k| k as f32 * sample_rate as f32 / fft_size as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn miss_then_hit_updates_stats() {
        let dir = tempdir().unwrap();
        let cache = FftCache::new(dir.path());
        let pcm = vec![0.0_f32; 2048];
        let key = FftCache::key(&f32_array_bytes(&pcm), 48_000, 2048);
        assert!(cache.get(&key).is_none());
        cache
            .compute_and_store(&key, &pcm, 1, 48_000, 2048, "hann")
            .unwrap();
        let entry = cache.get(&key).unwrap();
        assert_eq!(entry.magnitude.len(), 2048 / 2 + 1);
        assert!(cache.hit_rate() > 0.0);
    }

    #[test]
    fn short_input_is_zero_padded_not_rejected() {
        let dir = tempdir().unwrap();
        let cache = FftCache::new(dir.path());
        let pcm = vec![0.1_f32; 10];
        let key = FftCache::key(&f32_array_bytes(&pcm), 44_100, 1024);
        let entry = cache
            .compute_and_store(&key, &pcm, 1, 44_100, 1024, "hann")
            .unwrap();
        assert_eq!(entry.magnitude.len(), 1024 / 2 + 1);
    }

    #[test]
    fn identical_input_produces_byte_identical_artifacts() {
        let dir = tempdir().unwrap();
        let cache = FftCache::new(dir.path());
        let pcm: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.01).sin()).collect();
        let key = FftCache::key(&f32_array_bytes(&pcm), 48_000, 2048);
        let first = cache
            .compute_and_store(&key, &pcm, 1, 48_000, 2048, "hann")
            .unwrap();
        let second = cache
            .compute_and_store(&key, &pcm, 1, 48_000, 2048, "hann")
            .unwrap();
        assert_eq!(first.magnitude, second.magnitude);
        assert_eq!(first.phase, second.phase);
    }

    #[test]
    fn rejects_non_power_of_two_fft_size() {
        let dir = tempdir().unwrap();
        let cache = FftCache::new(dir.path());
        let result = cache.compute_and_store("deadbeef", &[0.0; 100], 1, 44_100, 1500, "hann");
        assert!(matches!(result, Err(PipelineError::InvalidArgument(_))));
    }

    #[test]
    fn partial_entry_on_disk_is_treated_as_miss() {
        let dir = tempdir().unwrap();
        let cache = FftCache::new(dir.path());
        let entry_dir = dir.path().join("fft").join("partialkey");
        fs::create_dir_all(&entry_dir).unwrap();
        fs::write(entry_dir.join("magnitude.bin"), [0u8; 4]).unwrap();
        // phase.bin and config.json deliberately missing.
        assert!(cache.get("partialkey").is_none());
    }
}
