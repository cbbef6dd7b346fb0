//! Cross-module FFT cache contract: the first lookup for a key must miss
//! and compute, a second lookup for the same key must hit without
//! recomputation, and a partially written entry must be treated as a miss
//! (spec.md §4.5).

use flowcast_core::fftcache::FftCache;
use tempfile::tempdir;

fn sine_pcm(frames: usize) -> Vec<f32> {
    (0..frames)
        .map(|i| (i as f32 * 0.1).sin())
        .collect()
}

#[test]
fn first_lookup_misses_second_lookup_hits() {
    let dir = tempdir().unwrap();
    let cache = FftCache::new(dir.path());
    let pcm = sine_pcm(2048);
    let key = FftCache::key(&bytemuck_bytes(&pcm), 44_100, 1024);

    assert!(cache.get(&key).is_none());
    assert_eq!(cache.misses(), 1);

    let computed = cache
        .compute_and_store(&key, &pcm, 1, 44_100, 1024, "hann")
        .unwrap();
    assert_eq!(computed.magnitude.len(), 1024 / 2 + 1);

    let hit = cache.get(&key).unwrap();
    assert_eq!(hit.magnitude.len(), computed.magnitude.len());
    assert_eq!(hit.config.fft_size, 1024);
    assert_eq!(cache.hits(), 1);
    assert_eq!(cache.misses(), 1);
    assert!((cache.hit_rate() - 0.5).abs() < 1e-9);
}

#[test]
fn identical_input_produces_byte_identical_cached_artifacts() {
    let dir = tempdir().unwrap();
    let cache = FftCache::new(dir.path());
    let pcm = sine_pcm(2048);
    let key = FftCache::key(&bytemuck_bytes(&pcm), 48_000, 2048);

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
fn partially_written_entry_is_treated_as_a_miss() {
    let dir = tempdir().unwrap();
    let cache = FftCache::new(dir.path());
    let pcm = sine_pcm(1024);
    let key = FftCache::key(&bytemuck_bytes(&pcm), 44_100, 1024);

    cache
        .compute_and_store(&key, &pcm, 1, 44_100, 1024, "hann")
        .unwrap();
    assert!(cache.get(&key).is_some());

    // Simulate a crash mid-write by deleting one of the three artifact
    // files the entry is made of.
    let entry_dir = dir.path().join("fft").join(&key);
    std::fs::remove_file(entry_dir.join("phase.bin")).unwrap();

    assert!(cache.get(&key).is_none());
}

#[test]
fn rejects_fft_size_that_is_not_a_power_of_two() {
    let dir = tempdir().unwrap();
    let cache = FftCache::new(dir.path());
    let pcm = sine_pcm(512);
    let key = FftCache::key(&bytemuck_bytes(&pcm), 44_100, 1500);
    let result = cache.compute_and_store(&key, &pcm, 1, 44_100, 1500, "hann");
    assert!(result.is_err());
}

fn bytemuck_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|v| v.to_ne_bytes()).collect()
}
