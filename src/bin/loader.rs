//! Loader stage binary (spec.md §4.2/§4.3, C1/C2/C3): decodes one input file
//! — DSD container or anything `symphonia` reads — to interleaved stereo
//! float32 PCM and writes it out as a wire-protocol session on stdout.

use clap::Parser;
use flowcast_core::dsd::{self, DecimationFactor};
use flowcast_core::decode;
use flowcast_core::error::PipelineError;
use flowcast_core::{cli, protocol};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

const EMIT_FRAMES: usize = 8192;

#[derive(Parser, Debug)]
#[command(name = "loader", version, about = "Decodes an audio file to the wire protocol")]
struct Args {
    /// File to decode.
    input_file: PathBuf,

    /// Output sample rate in Hz, 0 keeps the source rate.
    #[arg(short = 'r', long = "sample-rate", default_value_t = 0)]
    sample_rate: u32,

    /// DSD container decoder to use.
    #[arg(long = "dsd-decoder", default_value = "default")]
    dsd_decoder: String,

    /// DSD decimation factor (16, 32 or 64).
    #[arg(long = "decimation", default_value_t = 16)]
    decimation: u32,

    /// Emit the header only, no PCM chunks.
    #[arg(short = 'm', long = "metadata-only")]
    metadata_only: bool,

    /// Strip informational tag fields from the header.
    #[arg(short = 'd', long = "data-only")]
    data_only: bool,

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
    if args.dsd_decoder != "default" {
        return Err(PipelineError::NotSupported(format!(
            "dsd-decoder '{}' is not supported",
            args.dsd_decoder
        )));
    }

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    if is_dsd_file(&args.input_file) {
        decode_dsd(args, &mut out)
    } else {
        decode_general(args, &mut out)
    }
}

fn is_dsd_file(path: &std::path::Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("dsf") | Some("dff") | Some("iff")
    )
}

fn decode_dsd<W: Write>(args: &Args, out: &mut W) -> Result<(), PipelineError> {
    let decimation = DecimationFactor::try_from(args.decimation)?;
    let info = dsd::prepare(&args.input_file)?;
    let mut meta = info.to_metadata(decimation, &args.input_file.display().to_string());
    if args.data_only {
        strip_tags(&mut meta);
    }
    meta.validate().map_err(PipelineError::InvalidArgument)?;
    protocol::write_header(out, &meta)?;
    if args.metadata_only {
        return Ok(());
    }
    if args.sample_rate != 0 && args.sample_rate != meta.sample_rate {
        tracing::warn!(
            requested = args.sample_rate,
            actual = meta.sample_rate,
            "loader does not resample DSD output; rate is fixed by the decimation factor"
        );
    }

    let decoder = dsd::DsdDecoder::new(info, decimation)?;
    let mut write_err = None;
    decoder.stream(&args.input_file, |samples| {
        if let Err(e) = protocol::write_chunk(out, samples) {
            write_err = Some(e);
            return false;
        }
        true
    })?;
    if let Some(e) = write_err {
        return Err(e);
    }
    Ok(())
}

fn decode_general<W: Write>(args: &Args, out: &mut W) -> Result<(), PipelineError> {
    let (mut decoder, mut meta) =
        decode::GeneralDecoder::open(&args.input_file, args.sample_rate, decode::ResampleQuality::default())?;
    if args.data_only {
        strip_tags(&mut meta);
    }
    meta.validate().map_err(PipelineError::InvalidArgument)?;
    protocol::write_header(out, &meta)?;
    if args.metadata_only {
        return Ok(());
    }

    let channels = meta.channels as usize;
    let frame_step = EMIT_FRAMES * channels;
    let mut pending = Vec::<f32>::new();
    decoder.stream(&mut |produced: &[f32]| {
        pending.extend_from_slice(produced);
        let mut offset = 0;
        while pending.len() - offset >= frame_step {
            protocol::write_chunk(out, &pending[offset..offset + frame_step])?;
            offset += frame_step;
        }
        pending.drain(0..offset);
        Ok(())
    })?;
    if !pending.is_empty() {
        protocol::write_chunk(out, &pending)?;
    }
    Ok(())
}

fn strip_tags(meta: &mut flowcast_core::metadata::AudioMetadata) {
    meta.title = None;
    meta.artist = None;
    meta.album = None;
    meta.year = None;
    meta.genre = None;
    meta.track_number = None;
}
