//! Sink stage (spec.md §4.7 / C7): the terminal pipeline stage, consuming
//! PCM chunks over the wire protocol and driving a `cpal` output stream
//! through a ring buffer under strict latency, with an explicit state
//! machine and drain-on-EOF discipline.

pub mod device;
pub mod status;

use crate::error::PipelineError;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use ringbuf::traits::{Consumer as _, Producer as _, Split};
use ringbuf::HeapRb;
use status::{spawn_status_reporter, SinkState, StatusTracker};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Ring buffer sized for at least 5 seconds of audio at the negotiated rate,
/// per spec.md §4.7's strict-latency requirement: large enough to absorb
/// upstream jitter without the consumer ever starving under normal load.
pub const MIN_BUFFER_SECONDS: f32 = 5.0;
const DRAIN_POLL_INTERVAL_MS: u64 = 20;
const DRAIN_LOW_WATER_PERCENT: f32 = 5.0;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct SharedEngine {
    run_state: AtomicU8, // 0 stopped, 1 playing, 2 paused, 3 error
    volume_bits: AtomicU32,
}

const RUN_STOPPED: u8 = 0;
const RUN_PLAYING: u8 = 1;
const RUN_PAUSED: u8 = 2;
const RUN_ERROR: u8 = 3;

/// Drives one output device across the lifetime of a single track stream.
pub struct Sink {
    engine: Arc<SharedEngine>,
    tracker: Arc<StatusTracker>,
    producer: Box<dyn FnMut(&[f32]) -> usize + Send>,
    _stream: Stream,
    channels: usize,
    ring_capacity_frames: usize,
    sample_rate: u32,
    exact_rate_match: bool,
    status_thread: Option<thread::JoinHandle<()>>,
}

impl Sink {
    pub fn open(
        device_name: Option<&str>,
        sample_rate: u32,
        channels: u16,
        buffer_seconds: Option<f32>,
    ) -> Result<Self, PipelineError> {
        let device = device::select_device(device_name)?;
        let resolved = device::resolve_output_config(&device, sample_rate, channels)?;
        if !resolved.exact_rate_match {
            tracing::warn!(
                requested_rate = sample_rate,
                negotiated_rate = resolved.config.sample_rate.0,
                "device does not support exact rate/channel match"
            );
        }

        let negotiated_rate = resolved.config.sample_rate.0;
        let exact_rate_match = resolved.exact_rate_match;
        let output_channels = resolved.config.channels as usize;
        let buffer_seconds = buffer_seconds.unwrap_or(MIN_BUFFER_SECONDS).max(MIN_BUFFER_SECONDS);
        let ring_capacity_frames =
            (resolved.config.sample_rate.0 as f32 * buffer_seconds) as usize;
        let ring = HeapRb::<f32>::new(ring_capacity_frames * output_channels);
        let (mut rb_producer, mut rb_consumer) = ring.split();

        let engine = Arc::new(SharedEngine {
            run_state: AtomicU8::new(RUN_STOPPED),
            volume_bits: AtomicU32::new(1.0_f32.to_bits()),
        });
        let tracker = StatusTracker::new(resolved.config.sample_rate.0, output_channels as u16, ring_capacity_frames);

        let callback_engine = Arc::clone(&engine);
        let callback_tracker = Arc::clone(&tracker);
        let err_fn = |err| tracing::warn!(%err, "audio stream error");

        let stream = match resolved.sample_format {
            SampleFormat::F32 => device
                .build_output_stream(
                    &resolved.config,
                    move |output: &mut [f32], _| {
                        run_callback_f32(output, output_channels, &mut rb_consumer, &callback_engine, &callback_tracker);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| PipelineError::DeviceOpenFailed(e.to_string()))?,
            SampleFormat::I16 => {
                let callback_engine = Arc::clone(&engine);
                let callback_tracker = Arc::clone(&tracker);
                device
                    .build_output_stream(
                        &resolved.config,
                        move |output: &mut [i16], _| {
                            run_callback_i16(output, output_channels, &mut rb_consumer, &callback_engine, &callback_tracker);
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| PipelineError::DeviceOpenFailed(e.to_string()))?
            }
            SampleFormat::U16 => {
                let callback_engine = Arc::clone(&engine);
                let callback_tracker = Arc::clone(&tracker);
                device
                    .build_output_stream(
                        &resolved.config,
                        move |output: &mut [u16], _| {
                            run_callback_u16(output, output_channels, &mut rb_consumer, &callback_engine, &callback_tracker);
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| PipelineError::DeviceOpenFailed(e.to_string()))?
            }
            other => {
                tracing::error!(?other, "unsupported device sample format");
                return Err(PipelineError::AudioFormatMismatch);
            }
        };

        stream
            .play()
            .map_err(|e| PipelineError::DeviceOpenFailed(e.to_string()))?;

        let producer_capacity = ring_capacity_frames * output_channels;
        let producer = Box::new(move |samples: &[f32]| -> usize {
            let mut pushed = 0;
            for sample in samples {
                if rb_producer.try_push(*sample).is_ok() {
                    pushed += 1;
                } else {
                    break;
                }
            }
            pushed.min(producer_capacity)
        });

        Ok(Self {
            engine,
            tracker,
            producer,
            _stream: stream,
            channels: output_channels,
            ring_capacity_frames,
            sample_rate: negotiated_rate,
            exact_rate_match,
            status_thread: None,
        })
    }

    /// The rate the device actually opened at, which may differ from the
    /// rate requested of `open()` when the device has no exact match.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether the device negotiated the exact requested rate/channel count
    /// (spec.md §4.7); callers decide whether an upstream auto-resample is
    /// needed to reach the negotiated rate.
    pub fn exact_rate_match(&self) -> bool {
        self.exact_rate_match
    }

    /// Attaches a status reporter writing one JSON line per
    /// `status::STATUS_INTERVAL_MS` to `out`.
    pub fn attach_status_reporter<W>(&mut self, out: W)
    where
        W: std::io::Write + Send + 'static,
    {
        self.status_thread = Some(spawn_status_reporter(Arc::clone(&self.tracker), out));
    }

    pub fn play(&self) -> Result<(), PipelineError> {
        let current = self.engine.run_state.load(Ordering::SeqCst);
        if current == RUN_ERROR {
            return Err(PipelineError::InvalidState("cannot play from error state".into()));
        }
        self.engine.run_state.store(RUN_PLAYING, Ordering::SeqCst);
        self.tracker.set_state(SinkState::Playing);
        Ok(())
    }

    pub fn pause(&self) -> Result<(), PipelineError> {
        let current = self.engine.run_state.load(Ordering::SeqCst);
        if current != RUN_PLAYING {
            return Err(PipelineError::InvalidState(
                "can only pause from the playing state".into(),
            ));
        }
        self.engine.run_state.store(RUN_PAUSED, Ordering::SeqCst);
        self.tracker.set_state(SinkState::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), PipelineError> {
        let current = self.engine.run_state.load(Ordering::SeqCst);
        if current != RUN_PAUSED {
            return Err(PipelineError::InvalidState(
                "can only resume from the paused state".into(),
            ));
        }
        self.engine.run_state.store(RUN_PLAYING, Ordering::SeqCst);
        self.tracker.set_state(SinkState::Playing);
        Ok(())
    }

    pub fn stop(&self) {
        self.engine.run_state.store(RUN_STOPPED, Ordering::SeqCst);
        self.tracker.set_state(SinkState::Stopped);
    }

    pub fn set_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 2.0);
        self.engine.volume_bits.store(clamped.to_bits(), Ordering::SeqCst);
    }

    /// Pushes interleaved samples into the ring buffer, blocking in small
    /// increments while it is full. Returns `BufferOverrun` if the buffer
    /// stays full past a generous multiple of its own capacity's drain
    /// time, signalling a stuck consumer rather than ordinary backpressure.
    pub fn push_samples(&mut self, samples: &[f32]) -> Result<(), PipelineError> {
        let mut offset = 0;
        let deadline = Instant::now() + Duration::from_secs(30);
        while offset < samples.len() {
            let pushed = (self.producer)(&samples[offset..]);
            offset += pushed;
            if offset < samples.len() {
                if Instant::now() > deadline {
                    return Err(PipelineError::BufferOverrun);
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
        Ok(())
    }

    /// Blocks until the ring buffer empties below `DRAIN_LOW_WATER_PERCENT`,
    /// playback stops, or `DRAIN_TIMEOUT` elapses (spec.md §4.7 drain-on-EOF).
    pub fn drain(&self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            if self.engine.run_state.load(Ordering::SeqCst) != RUN_PLAYING {
                return;
            }
            if self.tracker.buffer_fill_percent() < DRAIN_LOW_WATER_PERCENT {
                return;
            }
            if Instant::now() > deadline {
                return;
            }
            thread::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS));
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn ring_capacity_frames(&self) -> usize {
        self.ring_capacity_frames
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.status_thread.take() {
            let _ = handle.join();
        }
    }
}

fn run_callback_f32(
    output: &mut [f32],
    channels: usize,
    consumer: &mut impl ringbuf::traits::Consumer<Item = f32>,
    engine: &SharedEngine,
    tracker: &StatusTracker,
) {
    let state = engine.run_state.load(Ordering::SeqCst);
    if state != RUN_PLAYING {
        output.fill(0.0);
        return;
    }
    let volume = f32::from_bits(engine.volume_bits.load(Ordering::Relaxed));
    let frame_channels = channels.max(1);
    let mut frames_consumed = 0u64;
    for frame in output.chunks_mut(frame_channels) {
        for sample in frame.iter_mut() {
            match consumer.try_pop() {
                Some(value) => *sample = value * volume,
                None => {
                    *sample = 0.0;
                    tracker.add_underrun();
                }
            }
        }
        frames_consumed += 1;
    }
    tracker.add_frames_played(frames_consumed);
    update_fill(consumer, tracker);
}

fn run_callback_i16(
    output: &mut [i16],
    channels: usize,
    consumer: &mut impl ringbuf::traits::Consumer<Item = f32>,
    engine: &SharedEngine,
    tracker: &StatusTracker,
) {
    let state = engine.run_state.load(Ordering::SeqCst);
    if state != RUN_PLAYING {
        output.fill(0);
        return;
    }
    let volume = f32::from_bits(engine.volume_bits.load(Ordering::Relaxed));
    let frame_channels = channels.max(1);
    let mut frames_consumed = 0u64;
    for frame in output.chunks_mut(frame_channels) {
        for sample in frame.iter_mut() {
            let popped = consumer.try_pop();
            if popped.is_none() {
                tracker.add_underrun();
            }
            let value = popped.unwrap_or(0.0) * volume;
            *sample = device::f32_to_i16(value);
        }
        frames_consumed += 1;
    }
    tracker.add_frames_played(frames_consumed);
    update_fill(consumer, tracker);
}

fn run_callback_u16(
    output: &mut [u16],
    channels: usize,
    consumer: &mut impl ringbuf::traits::Consumer<Item = f32>,
    engine: &SharedEngine,
    tracker: &StatusTracker,
) {
    let state = engine.run_state.load(Ordering::SeqCst);
    if state != RUN_PLAYING {
        output.fill(u16::MAX / 2);
        return;
    }
    let volume = f32::from_bits(engine.volume_bits.load(Ordering::Relaxed));
    let frame_channels = channels.max(1);
    let mut frames_consumed = 0u64;
    for frame in output.chunks_mut(frame_channels) {
        for sample in frame.iter_mut() {
            let popped = consumer.try_pop();
            if popped.is_none() {
                tracker.add_underrun();
            }
            let value = popped.unwrap_or(0.0) * volume;
            *sample = device::f32_to_u16(value);
        }
        frames_consumed += 1;
    }
    tracker.add_frames_played(frames_consumed);
    update_fill(consumer, tracker);
}

fn update_fill(consumer: &impl ringbuf::traits::Observer, tracker: &StatusTracker) {
    let capacity = consumer.capacity().get().max(1);
    let occupied = consumer.occupied_len();
    tracker.set_buffer_fill_percent(occupied as f32 / capacity as f32 * 100.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_callback_f32_fills_silence_when_not_playing() {
        let ring = HeapRb::<f32>::new(8);
        let (_producer, mut consumer) = ring.split();
        let engine = SharedEngine {
            run_state: AtomicU8::new(RUN_STOPPED),
            volume_bits: AtomicU32::new(1.0_f32.to_bits()),
        };
        let tracker = StatusTracker::new(48_000, 2, 4800);
        let mut output = [1.0_f32; 4];
        run_callback_f32(&mut output, 2, &mut consumer, &engine, &tracker);
        assert_eq!(output, [0.0; 4]);
    }
}
