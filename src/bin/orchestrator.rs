//! Orchestrator stage binary (spec.md §4.8/§5, C8): the daemon-facing front
//! end over `orchestrator::Orchestrator`, driven by the queue store's
//! current entry and `xpuSetting.conf`.

use clap::Parser;
use flowcast_core::error::PipelineError;
use flowcast_core::orchestrator::{self, Orchestrator, PipelineConfig};
use flowcast_core::queue::QueueStore;
use flowcast_core::{cli, config::Config};
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "orchestrator", version, about = "Runs and supervises the playback pipeline")]
struct Args {
    /// Relaunches itself detached and returns immediately.
    #[arg(long)]
    daemon: bool,

    /// Runs the supervising loop in this process (set automatically by --daemon).
    #[arg(long)]
    foreground: bool,

    /// Reports whether an instance is running, as JSON, and exits.
    #[arg(long)]
    status: bool,

    /// Stops a running instance (identified by the PID file) and exits.
    #[arg(long)]
    stop: bool,

    /// Stops then restarts a running instance.
    #[arg(long)]
    restart: bool,

    /// Hot-reloads configuration; not supported.
    #[arg(long)]
    reload: bool,

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
    if args.reload {
        return Err(PipelineError::NotSupported(
            "configuration hot-reload is not supported".into(),
        ));
    }

    if args.status {
        return report_status();
    }

    if args.stop {
        let pid = read_pid()?;
        orchestrator::terminate_by_pid(pid)?;
        return Ok(());
    }

    if args.restart {
        if let Ok(pid) = read_pid() {
            let _ = orchestrator::terminate_by_pid(pid);
            thread::sleep(Duration::from_millis(200));
        }
    }

    if args.daemon && !args.foreground {
        return relaunch_detached();
    }

    run_foreground()
}

fn report_status() -> Result<(), PipelineError> {
    let pid = read_pid().ok();
    let running = pid.map(orchestrator::is_process_alive).unwrap_or(false);
    let report = serde_json::json!({ "running": running, "pid": pid });
    println!("{report}");
    Ok(())
}

fn read_pid() -> Result<u32, PipelineError> {
    let text = std::fs::read_to_string(cli::pid_file())
        .map_err(|e| PipelineError::FileNotFound(format!("pid file: {e}")))?;
    text.trim()
        .parse::<u32>()
        .map_err(|e| PipelineError::InvalidState(format!("malformed pid file: {e}")))
}

/// Self-relaunches with `--foreground` and redirected stdio, then exits
/// immediately; this crate carries no daemonization dependency, so true
/// POSIX double-fork detachment is out of scope (see DESIGN.md).
fn relaunch_detached() -> Result<(), PipelineError> {
    let exe = std::env::current_exe().map_err(|e| PipelineError::UnknownError(e.to_string()))?;
    let log_path = cli::state_dir().join("orchestrator.log");
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
    }
    let log = std::fs::File::create(&log_path).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
    let log_err = log.try_clone().map_err(|e| PipelineError::FileWriteError(e.to_string()))?;

    std::process::Command::new(exe)
        .arg("--foreground")
        .stdin(std::process::Stdio::null())
        .stdout(log)
        .stderr(log_err)
        .spawn()
        .map_err(|e| PipelineError::InvalidOperation(format!("relaunch: {e}")))?;
    Ok(())
}

fn run_foreground() -> Result<(), PipelineError> {
    let bin_dir = orchestrator::default_bin_dir()?;
    let mut orch = Orchestrator::new(bin_dir, cli::pid_file());
    orch.acquire_singleton_lock()?;

    let config = load_pipeline_config()?;
    orch.start(config)?;

    loop {
        match orch.state() {
            orchestrator::PipelineState::Idle | orchestrator::PipelineState::Error => break,
            _ => thread::sleep(Duration::from_millis(100)),
        }
    }

    orch.release_singleton_lock();
    Ok(())
}

fn load_pipeline_config() -> Result<PipelineConfig, PipelineError> {
    let settings = Config::load(&cli::settings_file()).unwrap_or_default();
    let queue = QueueStore::load(cli::queue_file())?;
    let current = queue.get_current().ok_or(PipelineError::QueueEmpty)?;

    Ok(PipelineConfig {
        input_file: current.file_path.clone().into(),
        sample_rate: 0,
        use_fft_cache: settings
            .get("cache.fft_enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        use_dsp: settings
            .get("dsp.enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        dsp_preset: settings
            .get("dsp.preset")
            .and_then(|v| v.as_str())
            .unwrap_or("flat")
            .to_string(),
        volume: settings
            .get("playback.volume")
            .and_then(|v| v.as_int())
            .map(|v| v as u32)
            .unwrap_or(100),
        device: settings
            .get("playback.device")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}
