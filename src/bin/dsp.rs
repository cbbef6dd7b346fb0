//! DSP stage binary (spec.md §4.6, C6): applies fade-in/out, volume and the
//! fixed 3-band EQ to a wire-protocol stereo stream.

use clap::Parser;
use flowcast_core::dsp::{eq_preset, DspChain, DspConfig, EqGains};
use flowcast_core::error::PipelineError;
use flowcast_core::{cli, protocol};
use std::io::{BufReader, BufWriter, Write};

#[derive(Parser, Debug)]
#[command(name = "dsp", version, about = "Applies fade/volume/EQ to a wire-protocol stream")]
struct Args {
    /// Volume as a percentage, 0-200.
    #[arg(long = "volume", default_value_t = 100)]
    volume: u32,

    #[arg(long = "fade-in", default_value_t = 0)]
    fade_in: u32,

    #[arg(long = "fade-out", default_value_t = 0)]
    fade_out: u32,

    /// Named preset: flat, rock, pop, classical, jazz or electronic.
    #[arg(long = "eq")]
    eq: Option<String>,

    #[arg(long = "eq-low")]
    eq_low: Option<f32>,
    #[arg(long = "eq-mid")]
    eq_mid: Option<f32>,
    #[arg(long = "eq-high")]
    eq_high: Option<f32>,

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
    if args.volume > 200 {
        return Err(PipelineError::InvalidArgument(format!(
            "volume {} out of range [0, 200]",
            args.volume
        )));
    }

    let mut input = BufReader::new(std::io::stdin());
    let mut out = BufWriter::new(std::io::stdout());

    let header = protocol::read_header(&mut input)?;
    protocol::write_header(&mut out, &header)?;

    if header.channels != 2 {
        tracing::warn!(
            channels = header.channels,
            "dsp stage only processes stereo; passing {}-channel stream through unchanged",
            header.channels
        );
        while let Some(chunk) = protocol::read_chunk(&mut input, header.channels)? {
            protocol::write_chunk(&mut out, &chunk)?;
        }
        out.flush().map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        return Ok(());
    }

    let eq = resolve_eq(args)?;
    let config = DspConfig {
        volume: args.volume as f32 / 100.0,
        fade_in_ms: args.fade_in,
        fade_out_ms: args.fade_out,
        eq,
    };
    let mut chain = DspChain::new(header.sample_rate, config)?;
    if header.sample_count > 0 {
        chain.set_total_frames(header.sample_count);
    }

    while let Some(mut chunk) = protocol::read_chunk(&mut input, header.channels)? {
        chain.process_interleaved_stereo(&mut chunk);
        protocol::write_chunk(&mut out, &chunk)?;
    }
    out.flush().map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
    Ok(())
}

fn resolve_eq(args: &Args) -> Result<EqGains, PipelineError> {
    let mut gains = match &args.eq {
        Some(name) => eq_preset(name)
            .ok_or_else(|| PipelineError::InvalidArgument(format!("unknown eq preset '{name}'")))?,
        None => EqGains::flat(),
    };
    if let Some(low) = args.eq_low {
        gains.bass_db = low;
    }
    if let Some(mid) = args.eq_mid {
        gains.mid_db = mid;
    }
    if let Some(high) = args.eq_high {
        gains.treble_db = high;
    }
    Ok(gains.clamped())
}
