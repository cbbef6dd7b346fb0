//! Shared CLI plumbing for the stage binaries under `src/bin/`: `tracing`
//! initialization gated by `--verbose`/`RUST_LOG`, platform-conventional
//! path resolution (spec.md §6's persistent-files table), and the
//! stderr/JSON/exit-code error surface of spec.md §7.

use crate::decode::ResampleQuality;
use crate::error::{ErrorEnvelope, PipelineError};
use std::path::PathBuf;

/// Parses the `-q {Best,Medium,Fast,Linear,Zero}` CLI surface shared by
/// `converter` and `sink` (spec.md §6) into `decode::ResampleQuality`'s
/// longer internal names.
pub fn parse_quality(raw: &str) -> Result<ResampleQuality, PipelineError> {
    match raw.to_ascii_lowercase().as_str() {
        "best" => Ok(ResampleQuality::Best),
        "medium" => Ok(ResampleQuality::Medium),
        "fast" | "fastest" => Ok(ResampleQuality::Fastest),
        "linear" => Ok(ResampleQuality::Linear),
        "zero" | "zeroorderhold" => Ok(ResampleQuality::ZeroOrderHold),
        other => Err(PipelineError::InvalidArgument(format!(
            "unknown resample quality '{other}'"
        ))),
    }
}

/// Installs a `tracing-subscriber` fmt layer. Default level is `warn`
/// unless `--verbose` is set (bumps to `info`) or `RUST_LOG` overrides it.
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Prints the human-readable stderr line and (in verbose mode) the
/// structured `{error:{...}}` JSON envelope from spec.md §7, then exits
/// with the HTTP-status-derived exit code.
pub fn exit_with_error(err: PipelineError, verbose: bool) -> ! {
    eprintln!("error: {err}");
    if verbose {
        let envelope = ErrorEnvelope::from(&err);
        if let Ok(json) = serde_json::to_string(&envelope) {
            eprintln!("{json}");
        }
    }
    std::process::exit(err.http_status() as i32);
}

/// `<config dir>/flowcast`, per spec.md §6 ("platform-conventional
/// config/cache/state directories").
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("flowcast")
}

pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("flowcast")
}

pub fn state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("flowcast")
}

pub fn queue_file() -> PathBuf {
    state_dir().join("queue.json")
}

pub fn app_state_file() -> PathBuf {
    state_dir().join("state.json")
}

pub fn pid_file() -> PathBuf {
    state_dir().join("flowcast.pid")
}

pub fn settings_file() -> PathBuf {
    config_dir().join("xpuSetting.conf")
}
