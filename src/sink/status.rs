//! Playback status reporting: a 10Hz JSON status line written to a sink,
//! grounded in the wire protocol's JSON-line discipline (`protocol.rs`)
//! generalized from a one-shot header to a repeating status heartbeat.

use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const STATUS_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SinkState {
    Stopped = 0,
    Playing = 1,
    Paused = 2,
    Error = 3,
}

impl SinkState {
    fn as_str(self) -> &'static str {
        match self {
            SinkState::Stopped => "stopped",
            SinkState::Playing => "playing",
            SinkState::Paused => "paused",
            SinkState::Error => "error",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SinkState::Playing,
            2 => SinkState::Paused,
            3 => SinkState::Error,
            _ => SinkState::Stopped,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlaybackStatus {
    pub state: &'static str,
    pub frames_played: u64,
    pub buffer_fill_percent: f32,
    pub underrun_count: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub latency_ms: f64,
}

/// Shared state the status thread polls. Playback code owns a clone and
/// updates it as frames are consumed; `AtomicU8` keeps state reads lock-free
/// from the status thread's perspective.
pub struct StatusTracker {
    state: AtomicU8,
    frames_played: AtomicU64,
    buffer_fill_bits: AtomicU32,
    underrun_count: AtomicU64,
    sample_rate: u32,
    channels: u16,
    latency_ms: f64,
}

impl StatusTracker {
    /// `ring_capacity_frames` is the same estimate `sink -t` reports
    /// (`ring_capacity_frames / sample_rate`), threaded through so the
    /// repeating status line carries it too (spec.md §4.7).
    pub fn new(sample_rate: u32, channels: u16, ring_capacity_frames: usize) -> Arc<Self> {
        let latency_ms = ring_capacity_frames as f64 / sample_rate.max(1) as f64 * 1000.0;
        Arc::new(Self {
            state: AtomicU8::new(SinkState::Stopped as u8),
            frames_played: AtomicU64::new(0),
            buffer_fill_bits: AtomicU32::new(0.0_f32.to_bits()),
            underrun_count: AtomicU64::new(0),
            sample_rate,
            channels,
            latency_ms,
        })
    }

    pub fn set_state(&self, state: SinkState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn state(&self) -> SinkState {
        SinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn add_frames_played(&self, frames: u64) {
        self.frames_played.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn set_buffer_fill_percent(&self, percent: f32) {
        self.buffer_fill_bits
            .store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn buffer_fill_percent(&self) -> f32 {
        f32::from_bits(self.buffer_fill_bits.load(Ordering::Relaxed))
    }

    /// Monotonic: only ever increases for the lifetime of a tracker, never
    /// reset mid-session, even across pause/resume.
    pub fn add_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state().as_str(),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            buffer_fill_percent: self.buffer_fill_percent(),
            underrun_count: self.underrun_count(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            latency_ms: self.latency_ms,
        }
    }
}

/// Spawns a thread that writes one status JSON line every
/// `STATUS_INTERVAL_MS` to `out`, stopping once the tracker reaches
/// `SinkState::Stopped` or `SinkState::Error` and has emitted one final
/// line reflecting that terminal state.
pub fn spawn_status_reporter<W>(tracker: Arc<StatusTracker>, mut out: W) -> thread::JoinHandle<()>
where
    W: Write + Send + 'static,
{
    thread::spawn(move || loop {
        let status = tracker.snapshot();
        let terminal = matches!(status.state, "stopped" | "error");
        if let Ok(line) = serde_json::to_string(&status) {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
        if terminal {
            break;
        }
        thread::sleep(Duration::from_millis(STATUS_INTERVAL_MS));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_current_state() {
        let tracker = StatusTracker::new(48_000, 2, 4800);
        tracker.set_state(SinkState::Playing);
        tracker.add_frames_played(1000);
        tracker.set_buffer_fill_percent(42.5);
        tracker.add_underrun();
        tracker.add_underrun();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state, "playing");
        assert_eq!(snapshot.frames_played, 1000);
        assert!((snapshot.buffer_fill_percent - 42.5).abs() < 0.01);
        assert_eq!(snapshot.underrun_count, 2);
        assert!((snapshot.latency_ms - 100.0).abs() < 0.01);
    }

    #[test]
    fn underrun_count_never_decreases() {
        let tracker = StatusTracker::new(48_000, 2, 4800);
        tracker.add_underrun();
        tracker.add_underrun();
        tracker.add_underrun();
        assert_eq!(tracker.underrun_count(), 3);
    }

    #[test]
    fn reporter_stops_after_terminal_state() {
        let tracker = StatusTracker::new(44_100, 2, 4410);
        tracker.set_state(SinkState::Stopped);
        let buf: Vec<u8> = Vec::new();
        let handle = spawn_status_reporter(tracker, buf);
        handle.join().unwrap();
    }
}
