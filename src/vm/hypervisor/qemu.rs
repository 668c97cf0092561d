//! QEMU/KVM driver (Linux).
//!
//! Readiness comes from QMP: after the capabilities handshake,
//! `query-status` returns `"status": "running"` once the guest executes.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{GUEST_MAC, HypervisorDriver, LaunchSpec, poll_until_running};
use crate::config::Binaries;
use crate::error::{VmError, VmResult};
use crate::vm::network::{self, Attachment};
use crate::vm::process::{self, CommandLine};

const KVM_DEVICE: &str = "/dev/kvm";

/// Per-connection budget for one QMP status query.
const QMP_TIMEOUT: Duration = Duration::from_secs(2);

struct Firmware {
    code: &'static [&'static str],
    vars: &'static [&'static str],
}

const X86_64_FIRMWARE: Firmware = Firmware {
    code: &[
        "/usr/share/edk2/ovmf/OVMF_CODE.fd",
        "/usr/share/OVMF/OVMF_CODE_4M.fd",
        "/usr/share/OVMF/OVMF_CODE.fd",
        "/usr/share/qemu/ovmf-x86_64-code.bin",
    ],
    vars: &[
        "/usr/share/edk2/ovmf/OVMF_VARS.fd",
        "/usr/share/OVMF/OVMF_VARS_4M.fd",
        "/usr/share/OVMF/OVMF_VARS.fd",
        "/usr/share/qemu/ovmf-x86_64-vars.bin",
    ],
};

const AARCH64_FIRMWARE: Firmware = Firmware {
    code: &[
        "/usr/share/edk2/aarch64/QEMU_EFI-pflash.raw",
        "/usr/share/AAVMF/AAVMF_CODE.fd",
        "/usr/share/qemu/aavmf-aarch64-code.bin",
    ],
    vars: &[
        "/usr/share/edk2/aarch64/vars-template-pflash.raw",
        "/usr/share/AAVMF/AAVMF_VARS.fd",
        "/usr/share/qemu/aavmf-aarch64-vars.bin",
    ],
};

#[derive(Debug, Clone)]
pub struct Qemu {
    arch: &'static str,
    explicit: Option<PathBuf>,
    firmware_code: Option<PathBuf>,
    firmware_vars: Option<PathBuf>,
}

impl Qemu {
    pub fn new(binaries: &Binaries) -> Self {
        Self {
            arch: std::env::consts::ARCH,
            explicit: binaries.qemu.clone(),
            firmware_code: binaries.firmware_code.clone(),
            firmware_vars: binaries.firmware_vars.clone(),
        }
    }

    fn binary_name(&self) -> String {
        format!("qemu-system-{}", self.arch)
    }

    fn machine(&self) -> &'static str {
        match self.arch {
            "aarch64" => "virt",
            _ => "q35",
        }
    }

    fn firmware_candidates(&self) -> &'static Firmware {
        match self.arch {
            "aarch64" => &AARCH64_FIRMWARE,
            _ => &X86_64_FIRMWARE,
        }
    }

    fn binary(&self) -> VmResult<PathBuf> {
        let name = self.binary_name();
        process::find_binary(&name, self.explicit.as_deref(), &[]).ok_or_else(|| {
            VmError::Unavailable {
                tool: "qemu",
                reason: format!("{name} not found"),
                hint: "install QEMU (e.g. `dnf install qemu-kvm`) or set [binaries] qemu in config.toml"
                    .into(),
            }
        })
    }

    fn firmware_code(&self) -> VmResult<PathBuf> {
        locate_firmware(self.firmware_code.as_deref(), self.firmware_candidates().code)
            .ok_or_else(|| missing_firmware("UEFI firmware code"))
    }

    fn firmware_vars_template(&self) -> VmResult<PathBuf> {
        locate_firmware(self.firmware_vars.as_deref(), self.firmware_candidates().vars)
            .ok_or_else(|| missing_firmware("UEFI variable store template"))
    }

    async fn query_status(socket: &Path) -> VmResult<String> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| VmError::Control(format!("connect {}: {e}", socket.display())))?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        // Greeting first, then the handshake that leaves capabilities mode.
        qmp_reply(&mut lines).await?;
        write
            .write_all(b"{\"execute\":\"qmp_capabilities\"}\n")
            .await
            .map_err(|e| VmError::Control(format!("qmp write: {e}")))?;
        qmp_reply(&mut lines).await?;

        write
            .write_all(b"{\"execute\":\"query-status\"}\n")
            .await
            .map_err(|e| VmError::Control(format!("qmp write: {e}")))?;
        let reply = qmp_reply(&mut lines).await?;
        reply
            .pointer("/return/status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| VmError::Control(format!("unexpected query-status reply: {reply}")))
    }
}

/// Next QMP message that is not an asynchronous event.
async fn qmp_reply<R>(lines: &mut tokio::io::Lines<R>) -> VmResult<Value>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| VmError::Control(format!("qmp read: {e}")))?
            .ok_or_else(|| VmError::Control("qmp connection closed".into()))?;
        let msg: Value = serde_json::from_str(&line)
            .map_err(|e| VmError::Control(format!("qmp decode: {e}")))?;
        if msg.get("event").is_some() {
            continue;
        }
        if let Some(err) = msg.get("error") {
            return Err(VmError::Control(format!("qmp error: {err}")));
        }
        return Ok(msg);
    }
}

fn locate_firmware(explicit: Option<&Path>, candidates: &[&str]) -> Option<PathBuf> {
    match explicit {
        Some(path) => path.is_file().then(|| path.to_path_buf()),
        None => candidates
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file()),
    }
}

fn missing_firmware(what: &str) -> VmError {
    VmError::Unavailable {
        tool: "qemu",
        reason: format!("{what} not found"),
        hint: "install edk2-ovmf (or edk2-aarch64) or set [binaries] firmware_code / firmware_vars"
            .into(),
    }
}

/// Verifies that `/dev/kvm` exists and is read/write accessible.
fn check_kvm() -> VmResult<()> {
    let path = Path::new(KVM_DEVICE);
    if !path.exists() {
        return Err(VmError::Unavailable {
            tool: "qemu",
            reason: format!("{KVM_DEVICE} does not exist"),
            hint: "enable virtualization in firmware and load the module: sudo modprobe kvm_intel (or kvm_amd)"
                .into(),
        });
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map(|_| ())
        .map_err(|e| VmError::Unavailable {
            tool: "qemu",
            reason: format!("cannot open {KVM_DEVICE}: {e}"),
            hint: "add your user to the kvm group: sudo usermod -aG kvm $USER".into(),
        })
}

fn disk_format(disk: &Path) -> &'static str {
    match disk.extension().and_then(|e| e.to_str()) {
        Some("qcow2") => "qcow2",
        _ => "raw",
    }
}

#[async_trait]
impl HypervisorDriver for Qemu {
    fn kind(&self) -> &'static str {
        "qemu"
    }

    fn attachment(&self) -> Attachment {
        Attachment::QemuStream
    }

    fn check_available(&self) -> VmResult<()> {
        self.binary()?;
        check_kvm()?;
        self.firmware_code()?;
        self.firmware_vars_template()?;
        Ok(())
    }

    /// Fresh per-VM variable store copied from the distribution template.
    fn prepare(&self, spec: &LaunchSpec) -> VmResult<()> {
        network::remove_if_exists(&spec.control_socket)?;
        if spec.fresh_efi || !spec.efi_vars.exists() {
            let template = self.firmware_vars_template()?;
            if let Some(parent) = spec.efi_vars.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| VmError::io(format!("create {}", parent.display()), e))?;
            }
            std::fs::copy(&template, &spec.efi_vars).map_err(|source| VmError::DiskCopy {
                from: template.clone(),
                to: spec.efi_vars.clone(),
                source,
            })?;
            debug!(vm = %spec.name, template = %template.display(), "EFI variable store created");
        }
        Ok(())
    }

    fn command(&self, spec: &LaunchSpec) -> VmResult<CommandLine> {
        let mut cmd = CommandLine::new(self.binary()?);
        let code = self.firmware_code()?;

        cmd.opt("-name", spec.name.clone())
            .opt("-machine", format!("{},accel=kvm", self.machine()))
            .opt("-cpu", "host")
            .opt("-smp", spec.cpus.to_string())
            .opt("-m", spec.memory_mb.to_string());

        cmd.opt(
            "-drive",
            format!("if=pflash,format=raw,unit=0,readonly=on,file={}", code.display()),
        );
        cmd.opt(
            "-drive",
            format!("if=pflash,format=raw,unit=1,file={}", spec.efi_vars.display()),
        );
        cmd.opt(
            "-drive",
            format!(
                "file={},format={},if=virtio",
                spec.disk.display(),
                disk_format(&spec.disk)
            ),
        );

        cmd.opt(
            "-netdev",
            format!(
                "stream,id=net0,server=off,addr.type=unix,addr.path={}",
                spec.network_socket.display()
            ),
        );
        cmd.opt("-device", format!("virtio-net-pci,netdev=net0,mac={GUEST_MAC}"));
        cmd.opt("-device", "virtio-rng-pci");

        cmd.opt("-serial", format!("file:{}", spec.console_log.display()))
            .opt("-display", "none")
            .opt(
                "-qmp",
                format!("unix:{},server=on,wait=off", spec.control_socket.display()),
            );
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
        let socket = spec.control_socket.as_path();
        poll_until_running(spec, pid, timeout, interval, cancel, || async move {
            match tokio::time::timeout(QMP_TIMEOUT, Self::query_status(socket)).await {
                Ok(Ok(status)) => {
                    debug!(status = %status, "qmp status");
                    status == "running"
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "qmp not ready");
                    false
                }
                Err(_) => false,
            }
        })
        .await?;
        info!(vm = %spec.name, "guest running");
        Ok(())
    }
}
