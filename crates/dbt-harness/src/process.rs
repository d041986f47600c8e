//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "01-harness"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Child process spawn, signal-based shutdown and reaping."
//! dbt_version: "v0.1.0"
//! dbt_owner: "tbd"
//! ---
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use path_absolutize::Absolutize;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::wait::remaining;

/// Everything needed to launch one child process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub executable: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: PathBuf,
    /// Receives both stdout and stderr; truncated on launch.
    pub log_path: PathBuf,
}

/// A spawned child owned by the harness.
///
/// Dropping a handle whose process is still alive kills and reaps it.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    executable: PathBuf,
    child: Child,
    pid: u32,
    started: Instant,
    started_at: DateTime<Utc>,
    log_path: PathBuf,
    exit_code: Option<i32>,
}

impl ProcessHandle {
    /// Launch `spec`, redirecting stdout and stderr into its log file.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        check_executable(&spec.executable)?;

        let stdout = File::create(&spec.log_path)?;
        let stderr = stdout.try_clone()?;
        let child = Command::new(&spec.executable)
            .args(&spec.args)
            .current_dir(&spec.current_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| HarnessError::Spawn {
                executable: spec.executable.clone(),
                source,
            })?;

        let handle = Self {
            name: spec.name.clone(),
            executable: spec.executable.clone(),
            pid: child.id(),
            child,
            started: Instant::now(),
            started_at: Utc::now(),
            log_path: spec.log_path.clone(),
            exit_code: None,
        };
        info!(
            process = %handle.name,
            pid = handle.pid,
            executable = %handle.executable.display(),
            log = %handle.log_path.display(),
            "process started"
        );
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Exit code once the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Non-blocking liveness check; reaps the process if it already exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_reap(), Ok(None))
    }

    /// Deliver `signal` to the process.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        debug!(process = %self.name, pid = self.pid, %signal, "sending signal");
        kill(as_pid(self.pid), signal).map_err(|source| HarnessError::Signal {
            pid: self.pid,
            signal,
            source,
        })
    }

    /// Poll until the process exits or `timeout` elapses.
    pub fn wait_for_exit(
        &mut self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<i32>> {
        poll_exit(self, timeout, poll_interval)
    }

    /// Send `signal`, wait up to `timeout`, then escalate to SIGKILL and wait
    /// up to `kill_grace`. Returns the exit code; a signal death reports
    /// `128 + signal`.
    pub fn kill_and_wait(
        &mut self,
        signal: Signal,
        timeout: Duration,
        kill_grace: Duration,
        poll_interval: Duration,
    ) -> Result<i32> {
        let code = stop(self, signal, timeout, kill_grace, poll_interval)?;
        debug!(process = %self.name, pid = self.pid, uptime_ms = self.uptime().as_millis() as u64, "process reaped");
        Ok(code)
    }

    fn force_kill(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already exited between the last poll and the kill.
            Err(err) if err.kind() == ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn try_reap(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        let status = self.child.try_wait()?;
        let code = status.map(exit_code);
        self.exit_code = code;
        Ok(code)
    }
}

/// What the shutdown sequence needs from a child process.
trait Stoppable {
    fn name(&self) -> &str;
    fn pid(&self) -> u32;
    fn try_reap(&mut self) -> Result<Option<i32>>;
    fn send(&mut self, signal: Signal) -> Result<()>;
    fn force_kill(&mut self) -> Result<()>;
}

impl Stoppable for ProcessHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_reap(&mut self) -> Result<Option<i32>> {
        ProcessHandle::try_reap(self)
    }

    fn send(&mut self, signal: Signal) -> Result<()> {
        self.signal(signal)
    }

    fn force_kill(&mut self) -> Result<()> {
        ProcessHandle::force_kill(self)
    }
}

fn poll_exit<P: Stoppable>(
    process: &mut P,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Option<i32>> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(code) = process.try_reap()? {
            return Ok(Some(code));
        }
        let pause = match remaining(deadline) {
            Some(left) if left.is_zero() => return Ok(None),
            Some(left) => poll_interval.min(left),
            None => poll_interval,
        };
        thread::sleep(pause);
    }
}

fn stop<P: Stoppable>(
    process: &mut P,
    signal: Signal,
    timeout: Duration,
    kill_grace: Duration,
    poll_interval: Duration,
) -> Result<i32> {
    let pid = process.pid();
    if let Some(code) = process.try_reap()? {
        warn!(process = %process.name(), pid, exit_code = code, "process exited before termination was requested");
        return Ok(code);
    }

    process.send(signal)?;
    if let Some(code) = poll_exit(process, timeout, poll_interval)? {
        info!(process = %process.name(), pid, exit_code = code, "process exited");
        return Ok(code);
    }

    warn!(process = %process.name(), pid, ?timeout, "process ignored {signal}; escalating to SIGKILL");
    process.force_kill()?;
    if let Some(code) = poll_exit(process, kill_grace, poll_interval)? {
        warn!(process = %process.name(), pid, exit_code = code, "process killed");
        return Ok(code);
    }

    Err(HarnessError::ShutdownTimeout {
        pid,
        timeout: timeout.saturating_add(kill_grace),
    })
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exit_code.is_some() {
            return;
        }
        if let Ok(None) = self.child.try_wait() {
            warn!(process = %self.name, pid = self.pid, "process still running on drop; killing");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[allow(clippy::cast_possible_wrap)]
fn as_pid(pid: u32) -> Pid {
    Pid::from_raw(pid as i32)
}

fn check_executable(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|source| HarnessError::Spawn {
        executable: path.to_path_buf(),
        source,
    })?;
    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(HarnessError::Spawn {
            executable: path.to_path_buf(),
            source: std::io::Error::new(ErrorKind::PermissionDenied, "not an executable file"),
        });
    }
    Ok(())
}

/// Resolve `name` to an executable path.
///
/// Names containing a path separator are taken as paths. Bare names are
/// looked up in `search_dir` first, then in `PATH`.
pub fn resolve_executable(name: &str, search_dir: Option<&Path>) -> Result<PathBuf> {
    let not_found = || HarnessError::Spawn {
        executable: PathBuf::from(name),
        source: std::io::Error::new(ErrorKind::NotFound, "executable not found"),
    };

    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(name).absolutize()?.into_owned();
        check_executable(&path)?;
        return Ok(path);
    }

    let from_dir = search_dir.map(|dir| dir.join(name));
    let from_path = std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(name))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    from_dir
        .into_iter()
        .chain(from_path)
        .find(|candidate| check_executable(candidate).is_ok())
        .ok_or_else(not_found)
}
