//! Error taxonomy for the VM lifecycle core.
//!
//! Every variant belongs to one [`ErrorClass`]. Variants that have a known
//! fix carry a `hint` naming the exact command to run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type VmResult<T> = Result<T, VmError>;

/// Coarse classification used by callers to decide abort vs. warn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reported before any process is spawned; no partial state.
    Precondition,
    /// Partially-started processes are cleaned up before surfacing.
    ResourceAllocation,
    /// The VM is left running and its record persisted.
    ReadinessTimeout,
    /// Logged during stop; never blocks the record being marked stopped.
    Teardown,
    /// Lookup, parse, or user-driven outcomes.
    Other,
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM `{0}` not found\n  hint: list known VMs with `bootc-devvm list`")]
    NotFound(String),

    #[error("invalid VM name `{name}`: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("{tool} is not available: {reason}\n  hint: {hint}")]
    Unavailable {
        tool: &'static str,
        reason: String,
        hint: String,
    },

    #[error(
        "VM `{name}` cannot be provisioned, missing artifacts:\n{}\n  hint: run the convert stage first (or pass --disk PATH)",
        format_paths(.missing)
    )]
    MissingArtifacts { name: String, missing: Vec<PathBuf> },

    #[error("VM `{name}` is already running\n  hint: stop it first with `bootc-devvm stop {name}`")]
    AlreadyRunning { name: String },

    #[error("VM `{name}` is not running\n  hint: start the VM first with `bootc-devvm start {name}`")]
    NotRunning { name: String },

    #[error("host port {port} is already in use{}\n  hint: free the port or remove the VM holding it", holder_suffix(.holder))]
    PortInUse { port: u16, holder: Option<String> },

    #[error("no free host port found after {attempts} attempts")]
    PortExhausted { attempts: u32 },

    #[error("socket path {} is {len} bytes, over the {limit}-byte limit for Unix sockets", .path.display())]
    SocketPathTooLong {
        path: PathBuf,
        len: usize,
        limit: usize,
    },

    #[error("failed to copy disk image {} -> {}: {source}", .from.display(), .to.display())]
    DiskCopy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("network proxy for `{name}` did not come up: {reason}\n  hint: check {}", .log.display())]
    ProxyStart {
        name: String,
        reason: String,
        log: PathBuf,
    },

    #[error("hypervisor for `{name}` exited during boot\n  hint: check {}", .log.display())]
    HypervisorExited { name: String, log: PathBuf },

    #[error("VM `{name}` did not reach a running state within {}s; it was left running", .timeout.as_secs())]
    BootTimeout { name: String, timeout: Duration },

    #[error("remote shell for `{name}` not reachable on port {port} within {}s; the guest may still be booting", .timeout.as_secs())]
    SshTimeout {
        name: String,
        port: u16,
        timeout: Duration,
    },

    #[error("remote shell for `{name}` is unreachable: the network proxy has exited\n  hint: restart the VM with `bootc-devvm stop {name} && bootc-devvm start {name}`")]
    ProxyDown { name: String },

    #[error("proxy control API request failed: {0}")]
    ProxyApi(String),

    #[error("hypervisor control request failed: {0}")]
    Control(String),

    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("record {} is corrupt: {source}\n  hint: remove it with `bootc-devvm rm --force {name}`", .path.display())]
    CorruptRecord {
        name: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("aborted by user")]
    Aborted,
}

impl VmError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        VmError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            VmError::InvalidName { .. }
            | VmError::Unavailable { .. }
            | VmError::MissingArtifacts { .. }
            | VmError::AlreadyRunning { .. }
            | VmError::NotRunning { .. }
            | VmError::SocketPathTooLong { .. } => ErrorClass::Precondition,
            VmError::PortInUse { .. }
            | VmError::PortExhausted { .. }
            | VmError::DiskCopy { .. }
            | VmError::Spawn { .. }
            | VmError::ProxyStart { .. }
            | VmError::HypervisorExited { .. } => ErrorClass::ResourceAllocation,
            VmError::BootTimeout { .. } | VmError::SshTimeout { .. } => {
                ErrorClass::ReadinessTimeout
            }
            VmError::Signal { .. } => ErrorClass::Teardown,
            _ => ErrorClass::Other,
        }
    }

    /// Readiness timeouts leave a usable VM behind and are reported as warnings.
    pub fn is_degraded(&self) -> bool {
        self.class() == ErrorClass::ReadinessTimeout
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("    - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn holder_suffix(holder: &Option<String>) -> String {
    match holder {
        Some(name) => format!(" by VM `{name}`"),
        None => String::new(),
    }
}
