//! Queue store (spec.md §4.9 / C9): a durable, ordered mapping from
//! position to `(file_path, metadata)`, persisted atomically after every
//! mutation via the same `tmp`-then-`rename` discipline `fftcache.rs` uses
//! for its artifacts, applied here to `queue.json`.

use crate::error::PipelineError;
use crate::metadata::AudioMetadata;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const QUEUE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    Sequential,
    Random,
    LoopSingle,
    LoopAll,
}

impl Default for PlaybackMode {
    fn default() -> Self {
        PlaybackMode::Sequential
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub file_path: String,
    pub metadata: AudioMetadata,
    pub position: usize,
    pub is_playing: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub version: u32,
    pub current_index: usize,
    #[serde(default)]
    pub mode: PlaybackMode,
    pub entries: Vec<QueueEntry>,
}

impl QueueState {
    /// Invariants from spec.md §3/§8: positions contiguous `[0..N)`;
    /// `0 <= current_index < N` for `N > 0`, `current_index == 0` for `N == 0`.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.position != i {
                return Err(PipelineError::InvalidState(format!(
                    "entry {i} has position {} (expected {i})",
                    entry.position
                )));
            }
        }
        if self.entries.is_empty() {
            if self.current_index != 0 {
                return Err(PipelineError::InvalidState(
                    "current_index must be 0 for an empty queue".into(),
                ));
            }
        } else if self.current_index >= self.entries.len() {
            return Err(PipelineError::InvalidState(format!(
                "current_index {} out of range for {} entries",
                self.current_index,
                self.entries.len()
            )));
        }
        Ok(())
    }
}

/// Owns the one on-disk `queue.json`, mutated under a single writer.
pub struct QueueStore {
    state: QueueState,
    path: PathBuf,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            state: QueueState {
                version: QUEUE_VERSION,
                ..Default::default()
            },
            path: path.into(),
        }
    }

    /// Loads `queue.json` if present; a missing file starts an empty queue
    /// rather than erroring (first run has no queue yet).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| PipelineError::CacheValidationError(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => QueueState {
                version: QUEUE_VERSION,
                ..Default::default()
            },
            Err(e) => return Err(PipelineError::FileReadError(e.to_string())),
        };
        state.validate()?;
        Ok(Self { state, path })
    }

    pub fn state(&self) -> &QueueState {
        &self.state
    }

    pub fn len(&self) -> usize {
        self.state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty()
    }

    /// Writes `queue.json.tmp` then renames into place (spec.md §4.9).
    pub fn save(&self) -> Result<(), PipelineError> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&self.state)
            .map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        }
        fs::write(&tmp, bytes).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        Ok(())
    }

    fn renumber(&mut self) {
        for (i, entry) in self.state.entries.iter_mut().enumerate() {
            entry.position = i;
        }
    }

    pub fn add(&mut self, file_path: impl Into<String>, metadata: AudioMetadata) -> Result<(), PipelineError> {
        let position = self.state.entries.len();
        self.state.entries.push(QueueEntry {
            file_path: file_path.into(),
            metadata,
            position,
            is_playing: false,
        });
        self.save()
    }

    pub fn remove(&mut self, index: usize) -> Result<(), PipelineError> {
        if index >= self.state.entries.len() {
            return Err(PipelineError::InvalidArgument(format!(
                "index {index} out of range"
            )));
        }
        self.state.entries.remove(index);
        self.renumber();
        if self.state.entries.is_empty() {
            self.state.current_index = 0;
        } else if self.state.current_index >= self.state.entries.len() {
            self.state.current_index = self.state.entries.len() - 1;
        } else if index < self.state.current_index {
            self.state.current_index -= 1;
        }
        self.save()
    }

    pub fn clear(&mut self) -> Result<(), PipelineError> {
        self.state.entries.clear();
        self.state.current_index = 0;
        self.save()
    }

    pub fn get_current(&self) -> Option<&QueueEntry> {
        self.state.entries.get(self.state.current_index)
    }

    /// Advances `current_index` per spec.md §4.9's mode rules. Does not
    /// persist any playback progress beyond the index; callers handling
    /// `EndOfQueue` should stop, not retry.
    pub fn advance(&mut self) -> Result<&QueueEntry, PipelineError> {
        if self.state.entries.is_empty() {
            return Err(PipelineError::QueueEmpty);
        }
        let n = self.state.entries.len();
        match self.state.mode {
            PlaybackMode::Sequential => {
                if self.state.current_index + 1 >= n {
                    return Err(PipelineError::EndOfQueue);
                }
                self.state.current_index += 1;
            }
            PlaybackMode::LoopAll => {
                self.state.current_index = (self.state.current_index + 1) % n;
            }
            PlaybackMode::LoopSingle => {}
            PlaybackMode::Random => {
                if n >= 2 {
                    let current = self.state.current_index;
                    let mut rng = rand::thread_rng();
                    let mut candidate = rng.gen_range(0..n - 1);
                    if candidate >= current {
                        candidate += 1;
                    }
                    self.state.current_index = candidate;
                }
            }
        }
        self.save()?;
        Ok(&self.state.entries[self.state.current_index])
    }

    pub fn retreat(&mut self) -> Result<&QueueEntry, PipelineError> {
        if self.state.entries.is_empty() {
            return Err(PipelineError::QueueEmpty);
        }
        if self.state.current_index == 0 {
            return Err(PipelineError::EndOfQueue);
        }
        self.state.current_index -= 1;
        self.save()?;
        Ok(&self.state.entries[self.state.current_index])
    }

    pub fn jump(&mut self, index: usize) -> Result<&QueueEntry, PipelineError> {
        if index >= self.state.entries.len() {
            return Err(PipelineError::InvalidArgument(format!(
                "index {index} out of range"
            )));
        }
        self.state.current_index = index;
        self.save()?;
        Ok(&self.state.entries[self.state.current_index])
    }

    pub fn set_mode(&mut self, mode: PlaybackMode) -> Result<(), PipelineError> {
        self.state.mode = mode;
        self.save()
    }

    /// Preserves the currently playing entry as position 0, shuffles the
    /// rest uniformly (spec.md §4.9).
    pub fn shuffle(&mut self) -> Result<(), PipelineError> {
        if self.state.entries.len() < 2 {
            return self.save();
        }
        let current = self.state.entries.remove(self.state.current_index);
        let mut rng = rand::thread_rng();
        for i in (1..self.state.entries.len()).rev() {
            let j = rng.gen_range(0..=i);
            self.state.entries.swap(i, j);
        }
        self.state.entries.insert(0, current);
        self.state.current_index = 0;
        self.renumber();
        self.save()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta() -> AudioMetadata {
        AudioMetadata {
            sample_rate: 44_100,
            channels: 2,
            ..Default::default()
        }
    }

    #[test]
    fn add_and_remove_keep_positions_contiguous() {
        let dir = tempdir().unwrap();
        let mut store = QueueStore::new(dir.path().join("queue.json"));
        store.add("a.flac", meta()).unwrap();
        store.add("b.flac", meta()).unwrap();
        store.add("c.flac", meta()).unwrap();
        store.remove(1).unwrap();
        store.state().validate().unwrap();
        assert_eq!(store.state().entries[0].file_path, "a.flac");
        assert_eq!(store.state().entries[1].file_path, "c.flac");
        assert_eq!(store.state().entries[1].position, 1);
    }

    #[test]
    fn sequential_advance_hits_end_of_queue() {
        let dir = tempdir().unwrap();
        let mut store = QueueStore::new(dir.path().join("queue.json"));
        store.add("a.flac", meta()).unwrap();
        store.add("b.flac", meta()).unwrap();
        store.advance().unwrap();
        assert_eq!(store.state().current_index, 1);
        assert!(matches!(store.advance(), Err(PipelineError::EndOfQueue)));
    }

    #[test]
    fn loop_all_returns_to_zero_after_n_calls() {
        let dir = tempdir().unwrap();
        let mut store = QueueStore::new(dir.path().join("queue.json"));
        store.add("a.flac", meta()).unwrap();
        store.add("b.flac", meta()).unwrap();
        store.add("c.flac", meta()).unwrap();
        store.set_mode(PlaybackMode::LoopAll).unwrap();
        store.jump(2).unwrap();
        store.advance().unwrap();
        assert_eq!(store.state().current_index, 0);
    }

    #[test]
    fn loop_single_stays_put() {
        let dir = tempdir().unwrap();
        let mut store = QueueStore::new(dir.path().join("queue.json"));
        store.add("a.flac", meta()).unwrap();
        store.add("b.flac", meta()).unwrap();
        store.set_mode(PlaybackMode::LoopSingle).unwrap();
        store.jump(1).unwrap();
        store.advance().unwrap();
        assert_eq!(store.state().current_index, 1);
    }

    #[test]
    fn shuffle_preserves_current_entry_at_position_zero() {
        let dir = tempdir().unwrap();
        let mut store = QueueStore::new(dir.path().join("queue.json"));
        for name in ["a", "b", "c", "d"] {
            store.add(format!("{name}.flac"), meta()).unwrap();
        }
        store.jump(2).unwrap();
        store.shuffle().unwrap();
        assert_eq!(store.state().current_index, 0);
        assert_eq!(store.state().entries[0].file_path, "c.flac");
        store.state().validate().unwrap();
    }

    #[test]
    fn save_then_load_round_trips_identical_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let mut store = QueueStore::new(&path);
        store.add("a.flac", meta()).unwrap();
        store.add("b.flac", meta()).unwrap();
        let first_bytes = fs::read(&path).unwrap();

        let mut reloaded = QueueStore::load(&path).unwrap();
        reloaded.save().unwrap();
        let second_bytes = fs::read(&path).unwrap();
        assert_eq!(first_bytes, second_bytes);
    }

    #[test]
    fn missing_file_loads_as_empty_queue() {
        let dir = tempdir().unwrap();
        let store = QueueStore::load(dir.path().join("does-not-exist.json")).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.state().current_index, 0);
    }

    #[test]
    fn empty_queue_advance_is_queue_empty() {
        let dir = tempdir().unwrap();
        let mut store = QueueStore::new(dir.path().join("queue.json"));
        assert!(matches!(store.advance(), Err(PipelineError::QueueEmpty)));
    }
}
