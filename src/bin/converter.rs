//! Converter stage binary (spec.md §4.4, C4): bridges an upstream PCM
//! stream to a downstream sample rate/channel count/bit depth, optionally
//! populating the FFT cache as it streams past.

use clap::Parser;
use flowcast_core::convert::{self, BitDepth, StreamingResampler};
use flowcast_core::error::PipelineError;
use flowcast_core::fftcache::FftCache;
use flowcast_core::sink::device::adapt_channels;
use flowcast_core::{cli, protocol};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "converter", version, about = "Converts a wire-protocol PCM stream's rate/channels/bit depth")]
struct Args {
    /// Input file; stdin if omitted.
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,

    /// Output file; stdout (wire protocol) if omitted.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Target sample rate in Hz, 0 keeps the upstream rate.
    #[arg(short = 'r', long = "sample-rate", default_value_t = 0)]
    sample_rate: u32,

    /// Target bit depth; only meaningful when writing to -o as a raw file.
    #[arg(short = 'b', long = "bit-depth")]
    bit_depth: Option<u16>,

    /// Target channel count, keeps the upstream count if omitted.
    #[arg(short = 'c', long = "channels")]
    channels: Option<u16>,

    /// Resample quality: Best, Medium, Fast, Linear or Zero.
    #[arg(short = 'q', long = "quality", default_value = "Medium")]
    quality: String,

    #[arg(long = "chunk-size", default_value_t = convert::DEFAULT_CHUNK_FRAMES)]
    chunk_size: usize,

    /// Enables FFT cache population as data streams past.
    #[arg(long = "fft-cache")]
    fft_cache: bool,

    #[arg(long = "fft-size", default_value_t = 2048)]
    fft_size: usize,

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

/// Accumulates just enough state to compute one FFT-cache entry once the
/// stream reaches EOF without ever buffering the whole file (spec.md §4.5's
/// "process the first fft_size frames" combined with §4.4's O(chunk) memory
/// discipline).
struct FftAccumulator {
    hasher: Sha256,
    mono: Vec<f32>,
    fft_size: usize,
    channels: u16,
    sample_rate: u32,
}

impl FftAccumulator {
    fn new(fft_size: usize, channels: u16, sample_rate: u32) -> Self {
        Self {
            hasher: Sha256::new(),
            mono: Vec::with_capacity(fft_size),
            fft_size,
            channels,
            sample_rate,
        }
    }

    fn feed(&mut self, interleaved: &[f32]) {
        for s in interleaved {
            self.hasher.update(s.to_ne_bytes());
        }
        if self.mono.len() < self.fft_size {
            let channels = self.channels.max(1) as usize;
            for frame in interleaved.chunks_exact(channels) {
                if self.mono.len() >= self.fft_size {
                    break;
                }
                self.mono.push(frame.iter().sum::<f32>() / channels as f32);
            }
        }
    }

    fn finish(self, cache: &FftCache) -> Result<(), PipelineError> {
        let mut hasher = self.hasher;
        hasher.update(self.sample_rate.to_le_bytes());
        hasher.update((self.fft_size as u64).to_le_bytes());
        let key: String = hasher.finalize().iter().map(|b| format!("{b:02x}")).collect();
        if cache.get(&key).is_some() {
            tracing::info!(hit_rate = cache.hit_rate(), "fft cache hit");
            return Ok(());
        }
        cache.compute_and_store(&key, &self.mono, 1, self.sample_rate, self.fft_size, "hann")?;
        tracing::info!(hit_rate = cache.hit_rate(), "fft cache populated");
        Ok(())
    }
}

fn run(args: &Args) -> Result<(), PipelineError> {
    let quality = cli::parse_quality(&args.quality)?;
    let chunk_size = convert::clamp_chunk_size(args.chunk_size);

    let mut input: Box<dyn Read> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).map_err(|e| PipelineError::FileNotFound(format!("{}: {e}", path.display())))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let header = protocol::read_header(&mut input)?;
    let out_rate = if args.sample_rate == 0 { header.sample_rate } else { args.sample_rate };
    let out_channels = args.channels.unwrap_or(header.channels);
    let bit_depth = match args.bit_depth {
        Some(bits) => Some(BitDepth::try_from(bits)?),
        None => None,
    };

    let mut output_meta = header.clone();
    output_meta.sample_rate = out_rate;
    output_meta.channels = out_channels;
    if let Some(depth) = bit_depth {
        output_meta.bit_depth = depth.bits();
    }
    output_meta.recompute_high_res();

    let raw_file_mode = args.output.is_some() && bit_depth.is_some();
    let mut file_writer: Option<BufWriter<File>> = None;
    let mut stdout_writer: Option<BufWriter<std::io::Stdout>> = None;
    let mut named_writer: Option<BufWriter<File>> = None;

    if raw_file_mode {
        let path = args.output.as_ref().unwrap();
        file_writer = Some(BufWriter::new(
            File::create(path).map_err(|e| PipelineError::FileWriteError(format!("{}: {e}", path.display())))?,
        ));
    } else if let Some(path) = &args.output {
        named_writer = Some(BufWriter::new(
            File::create(path).map_err(|e| PipelineError::FileWriteError(format!("{}: {e}", path.display())))?,
        ));
        protocol::write_header(named_writer.as_mut().unwrap(), &output_meta)?;
    } else {
        stdout_writer = Some(BufWriter::new(std::io::stdout()));
        protocol::write_header(stdout_writer.as_mut().unwrap(), &output_meta)?;
    }

    let mut resampler = StreamingResampler::new(header.sample_rate, out_rate, out_channels as usize, chunk_size, quality)?;
    let mut fft = if args.fft_cache {
        Some(FftAccumulator::new(args.fft_size, out_channels, out_rate))
    } else {
        None
    };
    let cache = if args.fft_cache { Some(FftCache::new(cli::cache_dir())) } else { None };

    loop {
        let Some(chunk) = protocol::read_chunk(&mut input, header.channels)? else {
            break;
        };
        let adapted = adapt_channels(&chunk, header.channels as usize, out_channels as usize);
        let resampled = resampler.process(&adapted)?;
        if let Some(acc) = fft.as_mut() {
            acc.feed(&resampled);
        }
        emit(
            &resampled,
            bit_depth,
            raw_file_mode,
            file_writer.as_mut(),
            named_writer.as_mut(),
            stdout_writer.as_mut(),
        )?;
    }

    let drained = resampler.drain()?;
    if !drained.is_empty() {
        if let Some(acc) = fft.as_mut() {
            acc.feed(&drained);
        }
        emit(
            &drained,
            bit_depth,
            raw_file_mode,
            file_writer.as_mut(),
            named_writer.as_mut(),
            stdout_writer.as_mut(),
        )?;
    }

    if let (Some(acc), Some(cache)) = (fft, cache) {
        acc.finish(&cache)?;
    }

    if let Some(w) = file_writer.as_mut() {
        w.flush().map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
    }
    if let Some(w) = named_writer.as_mut() {
        w.flush().map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
    }
    if let Some(w) = stdout_writer.as_mut() {
        w.flush().map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn emit(
    samples: &[f32],
    bit_depth: Option<BitDepth>,
    raw_file_mode: bool,
    file_writer: Option<&mut BufWriter<File>>,
    named_writer: Option<&mut BufWriter<File>>,
    stdout_writer: Option<&mut BufWriter<std::io::Stdout>>,
) -> Result<(), PipelineError> {
    if raw_file_mode {
        let w = file_writer.expect("raw_file_mode implies file_writer is set");
        let bytes = convert::convert_bit_depth(samples, bit_depth.unwrap_or(BitDepth::Float32));
        w.write_all(&bytes).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        return Ok(());
    }
    if let Some(w) = named_writer {
        protocol::write_chunk(w, samples)?;
    } else if let Some(w) = stdout_writer {
        protocol::write_chunk(w, samples)?;
    }
    Ok(())
}
