//! Queue stage binary (spec.md §4.9, C9): a CLI front end over
//! `QueueStore`'s durable `queue.json`.

use clap::{Parser, Subcommand};
use flowcast_core::decode;
use flowcast_core::dsd::{self, DecimationFactor};
use flowcast_core::error::PipelineError;
use flowcast_core::queue::{PlaybackMode, QueueStore};
use flowcast_core::{cli, metadata::AudioMetadata};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "queue", version, about = "Manages the playback queue")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Adds one or more files, probing each for metadata.
    Add { files: Vec<PathBuf> },
    /// Prints the current queue as JSON.
    List,
    /// Removes the entry at the given position.
    Remove { index: usize },
    /// Empties the queue.
    Clear,
    /// Advances to the next entry per the current playback mode.
    Next,
    /// Moves back to the previous entry.
    Previous,
    /// Shuffles the queue, keeping the current entry first.
    Shuffle,
    /// Sets the playback mode: sequential, random, loop-single or loop-all.
    Loop { mode: String },
}

fn main() {
    let args = Args::parse();
    cli::init_tracing(args.verbose);
    if let Err(e) = run(&args) {
        cli::exit_with_error(e, args.verbose);
    }
}

fn run(args: &Args) -> Result<(), PipelineError> {
    let mut store = QueueStore::load(cli::queue_file())?;
    match &args.command {
        Command::Add { files } => {
            for file in files {
                let meta = probe(file)?;
                store.add(file.display().to_string(), meta)?;
            }
            print_json(store.state())
        }
        Command::List => print_json(store.state()),
        Command::Remove { index } => {
            store.remove(*index)?;
            print_json(store.state())
        }
        Command::Clear => {
            store.clear()?;
            print_json(store.state())
        }
        Command::Next => {
            let entry = store.advance()?;
            print_json(entry)
        }
        Command::Previous => {
            let entry = store.retreat()?;
            print_json(entry)
        }
        Command::Shuffle => {
            store.shuffle()?;
            print_json(store.state())
        }
        Command::Loop { mode } => {
            store.set_mode(parse_mode(mode)?)?;
            print_json(store.state())
        }
    }
}

fn parse_mode(raw: &str) -> Result<PlaybackMode, PipelineError> {
    match raw.to_ascii_lowercase().replace('_', "-").as_str() {
        "sequential" => Ok(PlaybackMode::Sequential),
        "random" => Ok(PlaybackMode::Random),
        "loop-single" => Ok(PlaybackMode::LoopSingle),
        "loop-all" => Ok(PlaybackMode::LoopAll),
        other => Err(PipelineError::InvalidArgument(format!(
            "unknown playback mode '{other}'"
        ))),
    }
}

fn is_dsd_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("dsf") | Some("dff") | Some("iff")
    )
}

fn probe(path: &Path) -> Result<AudioMetadata, PipelineError> {
    if is_dsd_file(path) {
        let info = dsd::prepare(path)?;
        Ok(info.to_metadata(DecimationFactor::Sixteen, &path.display().to_string()))
    } else {
        decode::probe_metadata(path)
    }
}

fn print_json<T: serde::Serialize>(value: T) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(&value)
        .map_err(|e| PipelineError::InvalidMessageFormat(e.to_string()))?;
    println!("{json}");
    Ok(())
}
