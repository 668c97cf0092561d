//! Remote shell bridge into the guest.
//!
//! [`wait_for_ssh`] is the readiness probe the orchestrator uses after boot;
//! [`run_remote`] and [`ssh_command`] back the `ssh` and `bootc` commands.
//! All network I/O is async so waits honour the shared cancellation token.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{VmError, VmResult};
use crate::vm::process::CommandLine;
use crate::vm::ConnectionInfo;

/// SSH options shared by every ssh invocation.
///
/// * `StrictHostKeyChecking=no` and `UserKnownHostsFile=/dev/null`: every
///   provisioned disk has fresh host keys, and ports are reused across VMs.
/// * `LogLevel=ERROR` suppresses the "Permanently added" banner.
/// * `IdentitiesOnly=yes` stops the agent offering unrelated keys first.
#[rustfmt::skip]
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "IdentitiesOnly=yes",
    "-o", "ConnectTimeout=5",
];

/// Per-attempt budget for connecting and reading the server banner.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait until the forwarded port answers with an SSH identification string.
///
/// The proxy accepts TCP connections before the guest's sshd is listening,
/// so a bare connect is not enough; the probe reads the `SSH-` banner.
pub async fn wait_for_ssh(
    name: &str,
    conn: &ConnectionInfo,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> VmResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe_ssh(&conn.host, conn.port).await {
            info!(vm = %name, port = conn.port, "remote shell is reachable");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(VmError::SshTimeout {
                name: name.to_string(),
                port: conn.port,
                timeout,
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(VmError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// One short-lived banner probe.
pub async fn probe_ssh(host: &str, port: u16) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect((host, port)).await.ok()?;
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.ok()?;
        Some(buf[..n].starts_with(b"SSH-"))
    };
    match tokio::time::timeout(PROBE_TIMEOUT, attempt).await {
        Ok(Some(ok)) => ok,
        _ => {
            debug!(host, port, "ssh probe failed");
            false
        }
    }
}

/// Build the `ssh` invocation for `conn`, optionally running `remote_cmd`.
pub fn ssh_command(conn: &ConnectionInfo, remote_cmd: &[String]) -> CommandLine {
    let mut cmd = CommandLine::new("ssh");
    for opt in SSH_OPTS {
        cmd.arg(*opt);
    }
    cmd.opt("-i", conn.key_path.display().to_string())
        .opt("-p", conn.port.to_string());
    if remote_cmd.is_empty() {
        cmd.arg("-t");
    }
    cmd.arg(format!("{}@{}", conn.user, conn.host));
    for part in remote_cmd {
        cmd.arg(part.clone());
    }
    cmd
}

/// `sudo bootc <args>` through the remote shell.
pub fn bootc_command(conn: &ConnectionInfo, args: &[String]) -> CommandLine {
    let mut remote = vec!["sudo".to_string(), "bootc".to_string()];
    remote.extend(args.iter().cloned());
    ssh_command(conn, &remote)
}

/// Run an ssh invocation attached to the caller's terminal.
pub async fn run_remote(cmd: &CommandLine) -> VmResult<ExitStatus> {
    debug!(command = %cmd, "running remote command");
    Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|source| VmError::Spawn {
            program: cmd.program.display().to_string(),
            source,
        })
}
