//! Sink stage binary (spec.md §4.7, C7): drives a `cpal` output device from
//! a wire-protocol stream, the terminal stage of the pipeline.

use clap::Parser;
use flowcast_core::convert::StreamingResampler;
use flowcast_core::error::PipelineError;
use flowcast_core::sink::device::{self, adapt_channels};
use flowcast_core::sink::Sink;
use flowcast_core::{cli, protocol};
use std::io::BufReader;

#[derive(Parser, Debug)]
#[command(name = "sink", version, about = "Plays a wire-protocol stream on an output device")]
struct Args {
    #[arg(short = 'd', long = "device")]
    device: Option<String>,

    /// Ring buffer size in seconds.
    #[arg(short = 'b', long = "buffer")]
    buffer: Option<f32>,

    /// Lists output devices as JSON and exits.
    #[arg(short = 'l', long = "list-devices")]
    list_devices: bool,

    /// Reports estimated output latency and exits without reading stdin.
    #[arg(short = 't', long = "latency-test")]
    latency_test: bool,

    /// Auto-resamples to the device's negotiated rate on mismatch.
    #[arg(short = 'a', long = "auto-resample")]
    auto_resample: bool,

    #[arg(short = 'q', long = "quality", default_value = "Medium")]
    quality: String,

    /// Requests exclusive device access (best-effort; falls back silently).
    #[arg(short = 'e', long = "exclusive")]
    exclusive: bool,

    #[arg(long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    cli::init_tracing(args.verbose);
    if let Err(e) = run(&args) {
        cli::exit_with_error(e, args.verbose);
    }
}

fn run(args: &Args) -> Result<(), PipelineError> {
    if args.list_devices {
        let names = device::list_device_names()?;
        let json = serde_json::to_string(&names)
            .map_err(|e| PipelineError::InvalidMessageFormat(e.to_string()))?;
        println!("{json}");
        return Ok(());
    }

    if args.exclusive {
        tracing::warn!("exclusive device mode is best-effort only; falling back to shared mode");
    }

    let mut input = BufReader::new(std::io::stdin());
    let header = protocol::read_header(&mut input)?;

    let mut sink = Sink::open(args.device.as_deref(), header.sample_rate, header.channels, args.buffer)?;

    if args.latency_test {
        let estimated_ms =
            sink.ring_capacity_frames() as f64 / sink.sample_rate().max(1) as f64 * 1000.0;
        let report = serde_json::json!({
            "negotiated_sample_rate": sink.sample_rate(),
            "exact_rate_match": sink.exact_rate_match(),
            "ring_capacity_frames": sink.ring_capacity_frames(),
            "estimated_latency_ms": estimated_ms,
        });
        println!("{report}");
        return Ok(());
    }

    if args.verbose {
        sink.attach_status_reporter(std::io::stdout());
    }

    let quality = cli::parse_quality(&args.quality)?;
    let mut resampler = if !sink.exact_rate_match() {
        if args.auto_resample {
            Some(StreamingResampler::new(
                header.sample_rate,
                sink.sample_rate(),
                sink.channels(),
                4096,
                quality,
            )?)
        } else {
            tracing::warn!(
                source_rate = header.sample_rate,
                device_rate = sink.sample_rate(),
                "device rate mismatch without --auto-resample; playing unconverted"
            );
            None
        }
    } else {
        None
    };

    sink.play()?;
    let source_channels = header.channels as usize;
    let device_channels = sink.channels();

    while let Some(chunk) = protocol::read_chunk(&mut input, header.channels)? {
        let adapted = adapt_channels(&chunk, source_channels, device_channels);
        let final_samples = match resampler.as_mut() {
            Some(r) => r.process(&adapted)?,
            None => adapted,
        };
        sink.push_samples(&final_samples)?;
    }

    if let Some(r) = resampler.as_mut() {
        let drained = r.drain()?;
        if !drained.is_empty() {
            sink.push_samples(&drained)?;
        }
    }

    sink.drain();
    sink.stop();
    Ok(())
}
