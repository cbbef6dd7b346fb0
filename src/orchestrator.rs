//! Pipeline orchestrator (spec.md §4.8 / C8): spawns `loader -> [converter]
//! -> [dsp] -> sink` as child processes wired by anonymous pipes, monitors
//! their health at 10 Hz, and translates `pause`/`resume`/`stop` into
//! per-process signals. Children are owned `std::process::Child`s wired
//! directly pipe-to-pipe (each child's `Stdio` is handed the previous
//! child's `ChildStdout` so the OS pipe never round-trips through this
//! process, matching spec.md §4.8's "the orchestrator retains no pipe ends
//! after fork/exec").

use crate::error::PipelineError;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Loader,
    Converter,
    Dsp,
    Sink,
}

impl StageKind {
    fn binary_name(self) -> &'static str {
        match self {
            StageKind::Loader => "loader",
            StageKind::Converter => "converter",
            StageKind::Dsp => "dsp",
            StageKind::Sink => "sink",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    Running = 1,
    Paused = 2,
    Error = 3,
}

impl PipelineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PipelineState::Running,
            2 => PipelineState::Paused,
            3 => PipelineState::Error,
            _ => PipelineState::Idle,
        }
    }
}

/// Given to `Orchestrator::start` (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_file: PathBuf,
    pub sample_rate: u32,
    pub use_fft_cache: bool,
    pub use_dsp: bool,
    pub dsp_preset: String,
    pub volume: u32,
    pub device: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_file: PathBuf::new(),
            sample_rate: 0,
            use_fft_cache: true,
            use_dsp: false,
            dsp_preset: "flat".to_string(),
            volume: 100,
            device: None,
        }
    }
}

/// One managed child stage. `exit_code` is only populated once `reap()`
/// has observed the child exit.
pub struct PipelineProcess {
    pub kind: StageKind,
    child: Child,
    pub exit_code: Option<i32>,
}

impl PipelineProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

/// Owns the running pipeline's stages and the 10 Hz health-monitor thread.
pub struct Orchestrator {
    bin_dir: PathBuf,
    state: Arc<AtomicU8>,
    stages: Arc<Mutex<Vec<PipelineProcess>>>,
    current_file: Arc<Mutex<Option<PathBuf>>>,
    monitor_stop: Arc<AtomicBool>,
    monitor_handle: Option<thread::JoinHandle<()>>,
    pid_file: PathBuf,
}

impl Orchestrator {
    /// `bin_dir` is the directory containing the `loader`/`converter`/
    /// `dsp`/`sink` sibling binaries (normally `current_exe()`'s parent).
    pub fn new(bin_dir: impl Into<PathBuf>, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            state: Arc::new(AtomicU8::new(PipelineState::Idle as u8)),
            stages: Arc::new(Mutex::new(Vec::new())),
            current_file: Arc::new(Mutex::new(None)),
            monitor_stop: Arc::new(AtomicBool::new(false)),
            monitor_handle: None,
            pid_file: pid_file.into(),
        }
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        self.current_file.lock().unwrap().clone()
    }

    /// Single-instance lock (spec.md §4.8/§5): writes this process's PID to
    /// `pid_file`, refusing to start if an existing, still-alive PID is
    /// recorded there. A PID file referencing a dead process is stale and
    /// treated as absent.
    pub fn acquire_singleton_lock(&self) -> Result<(), PipelineError> {
        if let Ok(existing) = std::fs::read_to_string(&self.pid_file) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if is_process_alive(pid) {
                    return Err(PipelineError::InvalidState(format!(
                        "another instance is already running (pid {pid})"
                    )));
                }
            }
        }
        if let Some(parent) = self.pid_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        }
        std::fs::write(&self.pid_file, format!("{}\n", std::process::id()))
            .map_err(|e| PipelineError::FileWriteError(e.to_string()))?;
        Ok(())
    }

    pub fn release_singleton_lock(&self) {
        let _ = std::fs::remove_file(&self.pid_file);
    }

    fn binary(&self, kind: StageKind) -> PathBuf {
        let name = kind.binary_name();
        #[cfg(windows)]
        let name = format!("{name}.exe");
        self.bin_dir.join(name)
    }

    /// Spawns `loader -> converter -> [dsp] -> sink` wired by pipes, per
    /// spec.md §4.8's topology. Only legal from `Idle`.
    pub fn start(&mut self, config: PipelineConfig) -> Result<(), PipelineError> {
        if self.state() != PipelineState::Idle {
            return Err(PipelineError::InvalidState(
                "pipeline is not idle".into(),
            ));
        }

        let mut stages = Vec::new();

        let mut loader_cmd = Command::new(self.binary(StageKind::Loader));
        loader_cmd
            .arg(&config.input_file)
            .arg("-r")
            .arg(config.sample_rate.to_string())
            .stdout(Stdio::piped());
        let mut loader_child = loader_cmd
            .spawn()
            .map_err(|e| PipelineError::InvalidOperation(format!("spawn loader: {e}")))?;
        let loader_out = loader_child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::InvalidOperation("loader has no stdout pipe".into()))?;
        stages.push(PipelineProcess {
            kind: StageKind::Loader,
            child: loader_child,
            exit_code: None,
        });

        let mut converter_cmd = Command::new(self.binary(StageKind::Converter));
        converter_cmd.stdin(Stdio::from(loader_out)).stdout(Stdio::piped());
        if config.use_fft_cache {
            converter_cmd.arg("--fft-cache");
        }
        let mut converter_child = converter_cmd
            .spawn()
            .map_err(|e| PipelineError::InvalidOperation(format!("spawn converter: {e}")))?;
        let mut upstream_out = converter_child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::InvalidOperation("converter has no stdout pipe".into()))?;
        stages.push(PipelineProcess {
            kind: StageKind::Converter,
            child: converter_child,
            exit_code: None,
        });

        if config.use_dsp {
            let mut dsp_cmd = Command::new(self.binary(StageKind::Dsp));
            dsp_cmd
                .arg("--volume")
                .arg(config.volume.to_string())
                .arg("--eq")
                .arg(&config.dsp_preset)
                .stdin(Stdio::from(upstream_out))
                .stdout(Stdio::piped());
            let mut dsp_child = dsp_cmd
                .spawn()
                .map_err(|e| PipelineError::InvalidOperation(format!("spawn dsp: {e}")))?;
            upstream_out = dsp_child
                .stdout
                .take()
                .ok_or_else(|| PipelineError::InvalidOperation("dsp has no stdout pipe".into()))?;
            stages.push(PipelineProcess {
                kind: StageKind::Dsp,
                child: dsp_child,
                exit_code: None,
            });
        }

        let mut sink_cmd = Command::new(self.binary(StageKind::Sink));
        sink_cmd.stdin(Stdio::from(upstream_out));
        if let Some(device) = &config.device {
            sink_cmd.arg("-d").arg(device);
        }
        let sink_child = sink_cmd
            .spawn()
            .map_err(|e| PipelineError::InvalidOperation(format!("spawn sink: {e}")))?;
        stages.push(PipelineProcess {
            kind: StageKind::Sink,
            child: sink_child,
            exit_code: None,
        });

        *self.stages.lock().unwrap() = stages;
        *self.current_file.lock().unwrap() = Some(config.input_file);
        self.state.store(PipelineState::Running as u8, Ordering::SeqCst);
        self.spawn_monitor();
        Ok(())
    }

    /// 10 Hz health monitor (spec.md §4.8/§5): any non-zero stage exit
    /// transitions the pipeline to `Error` and stops the rest; a clean exit
    /// of every stage (the sink drained and closed normally) returns the
    /// pipeline to `Idle` without anyone having to call `stop()` first.
    fn spawn_monitor(&mut self) {
        self.monitor_stop.store(false, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let stages = Arc::clone(&self.stages);
        let current_file = Arc::clone(&self.current_file);
        let stop_flag = Arc::clone(&self.monitor_stop);
        self.monitor_handle = Some(thread::spawn(move || loop {
            if stop_flag.load(Ordering::SeqCst) {
                return;
            }
            {
                let mut guard = stages.lock().unwrap();
                let mut failed = false;
                for stage in guard.iter_mut() {
                    if stage.exit_code.is_some() {
                        continue;
                    }
                    match stage.child.try_wait() {
                        Ok(Some(status)) => {
                            let code = status.code().unwrap_or(-1);
                            stage.exit_code = Some(code);
                            if code != 0 {
                                tracing::error!(stage = ?stage.kind, code, "pipeline stage exited with error");
                                failed = true;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(%e, "failed to poll stage exit status");
                        }
                    }
                }
                if failed && state.load(Ordering::SeqCst) != PipelineState::Idle as u8 {
                    state.store(PipelineState::Error as u8, Ordering::SeqCst);
                    terminate_all(&mut guard, false);
                    return;
                }
                let all_exited = !guard.is_empty() && guard.iter().all(|s| s.exit_code.is_some());
                if all_exited && state.load(Ordering::SeqCst) == PipelineState::Running as u8 {
                    tracing::info!("all pipeline stages exited cleanly");
                    guard.clear();
                    state.store(PipelineState::Idle as u8, Ordering::SeqCst);
                    *current_file.lock().unwrap() = None;
                    return;
                }
            }
            thread::sleep(HEALTH_POLL_INTERVAL);
        }));
    }

    /// Pauses the *sink* process only (spec.md §4.8): upstream stages
    /// block on backpressure from the now-full pipe. Unix-only; Windows
    /// has no direct process-suspend primitive.
    pub fn pause(&self) -> Result<(), PipelineError> {
        if self.state() != PipelineState::Running {
            return Err(PipelineError::InvalidState("pipeline is not running".into()));
        }
        self.signal_sink("-STOP")?;
        self.state.store(PipelineState::Paused as u8, Ordering::SeqCst);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), PipelineError> {
        if self.state() != PipelineState::Paused {
            return Err(PipelineError::InvalidState("pipeline is not paused".into()));
        }
        self.signal_sink("-CONT")?;
        self.state.store(PipelineState::Running as u8, Ordering::SeqCst);
        Ok(())
    }

    #[cfg(unix)]
    fn signal_sink(&self, signal: &str) -> Result<(), PipelineError> {
        let stages = self.stages.lock().unwrap();
        let sink = stages
            .iter()
            .find(|s| s.kind == StageKind::Sink)
            .ok_or_else(|| PipelineError::InvalidState("no sink process to signal".into()))?;
        send_signal(sink.pid(), signal)
    }

    #[cfg(not(unix))]
    fn signal_sink(&self, _signal: &str) -> Result<(), PipelineError> {
        Err(PipelineError::NotSupported(
            "pause/resume requires a Unix-like signal API on this platform".into(),
        ))
    }

    /// Graceful stop (spec.md §4.8): SIGTERM to every stage, a 1 s grace
    /// period, then SIGKILL; always reaps before returning.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        self.monitor_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor_handle.take() {
            let _ = handle.join();
        }
        let mut stages = self.stages.lock().unwrap();
        terminate_all(&mut stages, true);
        stages.clear();
        drop(stages);
        self.state.store(PipelineState::Idle as u8, Ordering::SeqCst);
        *self.current_file.lock().unwrap() = None;
        Ok(())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.state() != PipelineState::Idle {
            let _ = self.stop();
        }
    }
}

/// Terminates every still-running stage: SIGTERM (or `kill()` on non-unix),
/// wait up to `GRACE_PERIOD`, then SIGKILL the stragglers, then reap all.
fn terminate_all(stages: &mut [PipelineProcess], graceful: bool) {
    if graceful {
        for stage in stages.iter() {
            #[cfg(unix)]
            let _ = send_signal(stage.pid(), "-TERM");
        }
        let deadline = Instant::now() + GRACE_PERIOD;
        while Instant::now() < deadline {
            let all_exited = stages
                .iter_mut()
                .all(|s| matches!(s.child.try_wait(), Ok(Some(_))));
            if all_exited {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
    for stage in stages.iter_mut() {
        let _ = stage.child.kill();
        let _ = stage.child.wait();
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: &str) -> Result<(), PipelineError> {
    let status = Command::new("kill")
        .arg(signal)
        .arg(pid.to_string())
        .status()
        .map_err(|e| PipelineError::InvalidOperation(format!("kill {pid}: {e}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(PipelineError::InvalidOperation(format!(
            "kill {signal} {pid} failed"
        )))
    }
}

/// Stops a pipeline owned by *another* process, identified only by the PID
/// recorded in its PID file (spec.md §5's `--stop` CLI surface, which talks
/// to a running daemon rather than an in-process `Orchestrator`). Sends
/// SIGTERM and does not wait for exit: the daemon's own `stop()` path tears
/// its children down and removes the PID file once it observes the signal.
pub fn terminate_by_pid(pid: u32) -> Result<(), PipelineError> {
    if !is_process_alive(pid) {
        return Err(PipelineError::InvalidState(format!(
            "no running instance with pid {pid}"
        )));
    }
    #[cfg(unix)]
    {
        send_signal(pid, "-TERM")
    }
    #[cfg(windows)]
    {
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .status()
            .map_err(|e| PipelineError::InvalidOperation(format!("taskkill {pid}: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(PipelineError::InvalidOperation(format!(
                "taskkill {pid} failed"
            )))
        }
    }
}

/// A PID file is advisory; a PID with no live process behind it is stale
/// (spec.md §5). Shells out to `kill -0` / `tasklist` rather than adding a
/// process-inspection dependency for this one check.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
    #[cfg(windows)]
    {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}")])
            .output()
            .map(|out| {
                String::from_utf8_lossy(&out.stdout).contains(&pid.to_string())
            })
            .unwrap_or(false)
    }
}

/// Resolves the directory containing this binary's sibling stage
/// executables (normally `current_exe()`'s parent).
pub fn default_bin_dir() -> Result<PathBuf, PipelineError> {
    let exe = std::env::current_exe().map_err(|e| PipelineError::UnknownError(e.to_string()))?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| PipelineError::UnknownError("current_exe has no parent directory".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn singleton_lock_rejects_when_pid_file_has_live_pid() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("orchestrator.pid");
        std::fs::write(&pid_file, format!("{}\n", std::process::id())).unwrap();
        let orch = Orchestrator::new(dir.path(), &pid_file);
        assert!(orch.acquire_singleton_lock().is_err());
    }

    #[test]
    fn singleton_lock_ignores_stale_pid() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("orchestrator.pid");
        // A PID astronomically unlikely to be alive in this process's PID namespace.
        std::fs::write(&pid_file, "2147483647\n").unwrap();
        let orch = Orchestrator::new(dir.path(), &pid_file);
        assert!(orch.acquire_singleton_lock().is_ok());
        orch.release_singleton_lock();
        assert!(!pid_file.exists());
    }

    #[test]
    fn start_from_non_idle_state_is_rejected() {
        let dir = tempdir().unwrap();
        let mut orch = Orchestrator::new(dir.path(), dir.path().join("o.pid"));
        orch.state.store(PipelineState::Running as u8, Ordering::SeqCst);
        let result = orch.start(PipelineConfig::default());
        assert!(matches!(result, Err(PipelineError::InvalidState(_))));
    }
}
