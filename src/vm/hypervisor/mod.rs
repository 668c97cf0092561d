//! Hypervisor drivers.
//!
//! One [`HypervisorDriver`] per supported platform, selected once by
//! [`detect`]. The orchestrator only ever talks to the trait, so platform
//! differences stay confined to the invocation arguments, the boot
//! readiness signal, and the host acceleration pre-check.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Binaries;
use crate::error::{VmError, VmResult};
use crate::vm::network::Attachment;
use crate::vm::process::{self, CommandLine};
use crate::vm::{ConnectionInfo, remote};

pub mod qemu;
pub mod vfkit;

pub use qemu::Qemu;
pub use vfkit::Vfkit;

/// MAC gvproxy's DHCP server maps to the default guest address.
pub const GUEST_MAC: &str = "5a:94:ef:e4:0c:ee";

/// Everything a driver needs to launch one VM.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk: PathBuf,
    /// EFI variable store, private to the VM.
    pub efi_vars: PathBuf,
    /// Guest serial console sink.
    pub console_log: PathBuf,
    /// Hypervisor's own stdout/stderr.
    pub hypervisor_log: PathBuf,
    /// Proxy socket the virtio-net device attaches to.
    pub network_socket: PathBuf,
    /// Management socket (QMP).
    pub control_socket: PathBuf,
    /// Management TCP port (vfkit REST).
    pub control_port: u16,
    /// Discard any existing EFI variable store before boot.
    pub fresh_efi: bool,
}

#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    fn kind(&self) -> &'static str;

    /// How the network proxy must listen for this hypervisor.
    fn attachment(&self) -> Attachment;

    /// Fail fast, before any resource is allocated, if the host cannot run
    /// this hypervisor.
    fn check_available(&self) -> VmResult<()>;

    fn command(&self, spec: &LaunchSpec) -> VmResult<CommandLine>;

    /// On-disk preparation before spawn (EFI store, stale sockets).
    fn prepare(&self, spec: &LaunchSpec) -> VmResult<()> {
        if spec.fresh_efi {
            crate::vm::network::remove_if_exists(&spec.efi_vars)?;
        }
        crate::vm::network::remove_if_exists(&spec.control_socket)
    }

    /// Spawn the hypervisor. Returns once the process exists, not once the
    /// guest has booted.
    async fn start(&self, spec: &LaunchSpec) -> VmResult<u32> {
        self.prepare(spec)?;
        let cmd = self.command(spec)?;
        debug!(vm = %spec.name, command = %cmd, "launching hypervisor");
        process::spawn_detached(&cmd, &spec.hypervisor_log)
    }

    /// Poll until the guest reports a running state.
    async fn wait_for_ready(
        &self,
        spec: &LaunchSpec,
        pid: u32,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> VmResult<()>;

    /// Poll the forwarded remote-shell port. Advisory: callers warn on error.
    async fn wait_for_ssh(
        &self,
        name: &str,
        conn: &ConnectionInfo,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> VmResult<()> {
        remote::wait_for_ssh(name, conn, timeout, interval, cancel).await
    }

    /// Best-effort kill on the start-up failure path. Normal stops go
    /// through the graceful-then-forced sequence instead.
    async fn cleanup(&self, pid: u32) {
        process::kill_now(pid);
    }
}

/// Pick the driver for the host platform.
pub fn detect(binaries: &Binaries) -> Arc<dyn HypervisorDriver> {
    if cfg!(target_os = "macos") {
        Arc::new(Vfkit::new(binaries))
    } else {
        Arc::new(Qemu::new(binaries))
    }
}

/// Shared readiness loop: run `probe` every `interval` until it reports
/// running, the process dies, the deadline passes, or `cancel` fires.
pub(crate) async fn poll_until_running<F, Fut>(
    spec: &LaunchSpec,
    pid: u32,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> VmResult<()>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = bool> + Send,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !process::is_alive(pid) {
            return Err(VmError::HypervisorExited {
                name: spec.name.clone(),
                log: spec.hypervisor_log.clone(),
            });
        }
        if probe().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(VmError::BootTimeout {
                name: spec.name.clone(),
                timeout,
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(VmError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
