//! Playback/queue state persistence (`state.json`, spec.md §6's persistent
//! files table), using `serde_json` and the same `tmp`+rename atomic-write
//! discipline used throughout this crate (`fftcache.rs`, `queue.rs`).

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackState {
    pub current_track: String,
    pub position: f64,
    pub is_playing: bool,
    pub mode: String,
    pub volume: f32,
    pub eq_preset: String,
    pub eq_bass: f32,
    pub eq_mid: f32,
    pub eq_treble: f32,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            current_track: String::new(),
            position: 0.0,
            is_playing: false,
            mode: "sequential".to_string(),
            volume: 1.0,
            eq_preset: "flat".to_string(),
            eq_bass: 0.0,
            eq_mid: 0.0,
            eq_treble: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStateSummary {
    pub current_index: usize,
    pub track_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppState {
    #[serde(default = "default_version")]
    pub version: String,
    pub playback: PlaybackState,
    pub queue: QueueStateSummary,
}

fn default_version() -> String {
    STATE_VERSION.to_string()
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            playback: PlaybackState::default(),
            queue: QueueStateSummary::default(),
        }
    }
}

pub struct StateStore {
    path: PathBuf,
    state: AppState,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: AppState::default(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| PipelineError::CacheValidationError(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppState::default(),
            Err(e) => return Err(PipelineError::FileReadError(e.to_string())),
        };
        Ok(Self { path, state })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut AppState {
        &mut self.state
    }

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

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempdir().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).unwrap();
        assert_eq!(store.state().version, STATE_VERSION);
        assert!(!store.state().playback.is_playing);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = StateStore::new(&path);
        store.state_mut().playback.current_track = "track.flac".into();
        store.state_mut().playback.volume = 0.5;
        store.save().unwrap();

        let reloaded = StateStore::load(&path).unwrap();
        assert_eq!(reloaded.state().playback.current_track, "track.flac");
        assert!((reloaded.state().playback.volume - 0.5).abs() < 1e-6);
    }
}
