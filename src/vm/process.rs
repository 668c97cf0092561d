//! Supervised host processes: spawning, liveness probes, and termination.
//!
//! The hypervisor and proxy must outlive the invocation that starts them, so
//! they are spawned detached into their own process group and tracked only
//! by PID. Every later invocation re-derives liveness with [`is_alive`].

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{VmError, VmResult};

/// A rendered program invocation. Kept separate from `Command` so it can be
/// inspected, logged, and printed for `--dry-run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Push a flag followed by its value.
    pub fn opt(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.args.push(flag.to_string());
        self.args.push(value.into());
        self
    }

    /// Value following the first occurrence of `flag`.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// All values following each occurrence of `flag`.
    pub fn values_of<'a>(&'a self, flag: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.args
            .windows(2)
            .filter(move |w| w[0] == flag)
            .map(|w| w[1].as_str())
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Spawn `cmd` detached from the caller, appending stdout/stderr to `log`.
///
/// Returns the PID as soon as the process exists. The child is placed in
/// its own process group so a Ctrl-C aimed at the CLI never reaches it.
pub fn spawn_detached(cmd: &CommandLine, log: &Path) -> VmResult<u32> {
    if let Some(parent) = log.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| VmError::io(format!("create {}", parent.display()), e))?;
    }
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .map_err(|e| VmError::io(format!("open log {}", log.display()), e))?;
    let err = out
        .try_clone()
        .map_err(|e| VmError::io(format!("open log {}", log.display()), e))?;

    let program = cmd.program.display().to_string();
    let child = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .process_group(0)
        .spawn()
        .map_err(|source| VmError::Spawn {
            program: program.clone(),
            source,
        })?;

    let pid = child.id().ok_or_else(|| VmError::Spawn {
        program: program.clone(),
        source: std::io::Error::other("process exited before its pid was read"),
    })?;
    // Dropping the handle does not kill the child; it keeps running.
    drop(child);

    info!(pid, program = %program, "spawned");
    Ok(pid)
}

/// Check whether `pid` refers to a live process.
///
/// Uses a signal-0 probe. A zombie child of this process is reaped first so
/// that it is reported dead rather than alive.
pub fn is_alive(pid: u32) -> bool {
    let Some(pid) = to_pid(pid) else {
        return false;
    };
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return false,
        // Not our child, or still running: fall through to the probe.
        _ => {}
    }
    match signal::kill(pid, None) {
        Ok(()) => true,
        // Exists but owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// How a process ended up gone (or not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyGone,
    Graceful,
    Forced,
    /// Still alive after SIGKILL and the kill wait elapsed.
    Unkillable,
}

/// Graceful-then-forced termination.
///
/// Sends SIGTERM, polls for exit up to `grace`, then SIGKILL and polls up
/// to `kill_wait`. Never blocks longer than `grace + kill_wait`. Cancelling
/// ends the grace period early; the SIGKILL and its bounded wait still run.
pub async fn terminate(
    pid: u32,
    grace: Duration,
    kill_wait: Duration,
    cancel: &CancellationToken,
) -> Termination {
    let Some(nix_pid) = to_pid(pid) else {
        return Termination::AlreadyGone;
    };
    if !is_alive(pid) {
        return Termination::AlreadyGone;
    }

    if let Err(e) = signal::kill(nix_pid, Signal::SIGTERM) {
        if e == Errno::ESRCH {
            return Termination::AlreadyGone;
        }
        warn!(pid, error = %e, "SIGTERM failed");
    }
    let exited = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(pid, "cancelled, skipping grace period");
            !is_alive(pid)
        }
        exited = wait_for_exit(pid, grace) => exited,
    };
    if exited {
        debug!(pid, "exited after SIGTERM");
        return Termination::Graceful;
    }

    warn!(pid, grace_secs = grace.as_secs_f32(), "sending SIGKILL");
    if let Err(e) = signal::kill(nix_pid, Signal::SIGKILL) {
        if e == Errno::ESRCH {
            return Termination::Forced;
        }
        warn!(pid, error = %e, "SIGKILL failed");
    }
    if wait_for_exit(pid, kill_wait).await {
        Termination::Forced
    } else {
        warn!(pid, "still alive after SIGKILL");
        Termination::Unkillable
    }
}

/// SIGKILL without a grace period. Used on start-up failure paths.
pub fn kill_now(pid: u32) {
    let Some(nix_pid) = to_pid(pid) else {
        return;
    };
    match signal::kill(nix_pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "SIGKILL failed"),
    }
    // Reap if it was ours.
    let _ = is_alive(pid);
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn to_pid(pid: u32) -> Option<Pid> {
    // 0 and negative values address process groups in kill(2).
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

/// Read a decimal PID from a pid file.
pub fn read_pid_file(path: &Path) -> VmResult<u32> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| VmError::io(format!("read pid file {}", path.display()), e))?;
    content.trim().parse::<u32>().map_err(|e| {
        VmError::io(
            format!("invalid pid in {}: '{}'", path.display(), content.trim()),
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })
}

/// Locate a program: explicit path first, then `PATH`, then `extra` prefixes.
pub fn find_binary(name: &str, explicit: Option<&Path>, extra: &[&str]) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.is_file().then(|| path.to_path_buf());
    }
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    extra
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.is_file())
}
