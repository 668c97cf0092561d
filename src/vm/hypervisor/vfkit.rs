//! vfkit driver (macOS Virtualization.framework).
//!
//! Readiness comes from vfkit's REST management API: `GET /vm/state`
//! reports `VirtualMachineStateRunning` once the guest has started.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{GUEST_MAC, HypervisorDriver, LaunchSpec, poll_until_running};
use crate::config::Binaries;
use crate::error::{VmError, VmResult};
use crate::vm::network::Attachment;
use crate::vm::process::{self, CommandLine};

/// Homebrew prefixes on Apple Silicon and Intel.
const VFKIT_CANDIDATES: &[&str] = &["/opt/homebrew/bin/vfkit", "/usr/local/bin/vfkit"];

#[derive(Debug, Clone)]
pub struct Vfkit {
    explicit: Option<PathBuf>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

impl Vfkit {
    pub fn new(binaries: &Binaries) -> Self {
        Self {
            explicit: binaries.vfkit.clone(),
            http: reqwest::Client::new(),
        }
    }

    fn binary(&self) -> VmResult<PathBuf> {
        process::find_binary("vfkit", self.explicit.as_deref(), VFKIT_CANDIDATES).ok_or_else(|| {
            VmError::Unavailable {
                tool: "vfkit",
                reason: "binary not found".into(),
                hint: "install it with `brew install vfkit` or set [binaries] vfkit in config.toml"
                    .into(),
            }
        })
    }

    async fn vm_state(&self, port: u16) -> Option<String> {
        let url = format!("http://localhost:{port}/vm/state");
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            debug!(port, http_status = resp.status().as_u16(), "vfkit state non-2xx");
            return None;
        }
        resp.json::<StateResponse>().await.ok().map(|s| s.state)
    }
}

#[async_trait]
impl HypervisorDriver for Vfkit {
    fn kind(&self) -> &'static str {
        "vfkit"
    }

    fn attachment(&self) -> Attachment {
        Attachment::VfkitDatagram
    }

    fn check_available(&self) -> VmResult<()> {
        if !cfg!(target_os = "macos") {
            return Err(VmError::Unavailable {
                tool: "vfkit",
                reason: "vfkit requires macOS (Virtualization.framework)".into(),
                hint: "use the QEMU driver on Linux".into(),
            });
        }
        self.binary().map(|_| ())
    }

    fn command(&self, spec: &LaunchSpec) -> VmResult<CommandLine> {
        let mut cmd = CommandLine::new(self.binary()?);

        cmd.opt("--cpus", spec.cpus.to_string())
            .opt("--memory", spec.memory_mb.to_string());

        // `create` refuses an existing store, so only pass it when there is
        // none. `prepare` has already removed the old one on a fresh boot.
        let mut bootloader = format!("efi,variable-store={}", spec.efi_vars.display());
        if spec.fresh_efi || !spec.efi_vars.exists() {
            bootloader.push_str(",create");
        }
        cmd.opt("--bootloader", bootloader);

        cmd.opt("--device", format!("virtio-blk,path={}", spec.disk.display()));
        cmd.opt(
            "--device",
            format!(
                "virtio-net,unixSocketPath={},mac={GUEST_MAC}",
                spec.network_socket.display()
            ),
        );
        cmd.opt(
            "--device",
            format!("virtio-serial,logFilePath={}", spec.console_log.display()),
        );
        // Entropy device (required for kernel RNG).
        cmd.opt("--device", "virtio-rng");

        cmd.opt("--restful-uri", format!("tcp://localhost:{}", spec.control_port));
        Ok(cmd)
    }

    async fn wait_for_ready(
        &self,
        spec: &LaunchSpec,
        pid: u32,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> VmResult<()> {
        let port = spec.control_port;
        poll_until_running(spec, pid, timeout, interval, cancel, || async move {
            match self.vm_state(port).await {
                Some(state) => {
                    debug!(port, state = %state, "vfkit state");
                    state.ends_with("Running")
                }
                None => false,
            }
        })
        .await?;
        info!(vm = %spec.name, "guest running");
        Ok(())
    }
}
