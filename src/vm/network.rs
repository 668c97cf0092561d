//! User-mode network proxy coordination (gvproxy).
//!
//! ```text
//! hypervisor virtio-net ──► <runtime>/<name>-net.sock ──► gvproxy ──► host
//!                                                            │
//!        127.0.0.1:<ssh_port> ◄── port forward ──────────────┤
//!        HTTP control API     ◄── <runtime>/<name>-svc.sock ─┘
//! ```
//!
//! The proxy is started before the hypervisor because the hypervisor's
//! network device binds to the proxy socket at spawn time.

use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Binaries;
use crate::error::{VmError, VmResult};
use crate::vm::process::{self, CommandLine};

/// `sun_path` capacity including the trailing NUL.
#[cfg(target_os = "macos")]
pub const SOCKET_PATH_LIMIT: usize = 104;
#[cfg(not(target_os = "macos"))]
pub const SOCKET_PATH_LIMIT: usize = 108;

/// How long the proxy gets to create its sockets.
const PROXY_SOCKET_WAIT: Duration = Duration::from_secs(5);

const GVPROXY_CANDIDATES: &[&str] = &[
    "/opt/homebrew/opt/podman/libexec/podman/gvproxy",
    "/opt/homebrew/bin/gvproxy",
    "/usr/local/opt/podman/libexec/podman/gvproxy",
    "/opt/podman/bin/gvproxy",
    "/usr/libexec/podman/gvproxy",
    "/usr/local/libexec/podman/gvproxy",
    "/usr/lib/podman/gvproxy",
];

/// How the hypervisor's network device reaches the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// vfkit: unix datagram socket.
    VfkitDatagram,
    /// QEMU `-netdev stream`: unix stream socket, proxy is the server.
    QemuStream,
}

/// Everything the proxy needs for one VM.
#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub name: String,
    pub attachment: Attachment,
    pub network_socket: PathBuf,
    pub services_socket: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub ssh_port: u16,
}

#[async_trait]
pub trait NetworkProxy: Send + Sync {
    /// Fail fast if the proxy binary is missing.
    fn check_available(&self) -> VmResult<()>;

    fn command(&self, spec: &ProxySpec) -> VmResult<CommandLine>;

    /// Launch the proxy; returns its PID once its sockets exist.
    async fn start(&self, spec: &ProxySpec, cancel: &CancellationToken) -> VmResult<u32>;

    /// Forward `127.0.0.1:host_port` to `guest` through the control API.
    async fn expose_port(
        &self,
        services_socket: &Path,
        host_port: u16,
        guest: SocketAddrV4,
    ) -> VmResult<()>;
}

/// gvproxy from the podman project.
#[derive(Debug, Clone, Default)]
pub struct Gvproxy {
    explicit: Option<PathBuf>,
}

impl Gvproxy {
    pub fn new(binaries: &Binaries) -> Self {
        Self {
            explicit: binaries.gvproxy.clone(),
        }
    }

    fn binary(&self) -> VmResult<PathBuf> {
        process::find_binary("gvproxy", self.explicit.as_deref(), GVPROXY_CANDIDATES).ok_or_else(
            || VmError::Unavailable {
                tool: "gvproxy",
                reason: "binary not found on PATH or in the podman install prefixes".into(),
                hint: "install podman (which ships gvproxy) or set [binaries] gvproxy in config.toml"
                    .into(),
            },
        )
    }
}

#[async_trait]
impl NetworkProxy for Gvproxy {
    fn check_available(&self) -> VmResult<()> {
        self.binary().map(|_| ())
    }

    fn command(&self, spec: &ProxySpec) -> VmResult<CommandLine> {
        check_socket_path(&spec.network_socket)?;
        check_socket_path(&spec.services_socket)?;

        let mut cmd = CommandLine::new(self.binary()?);
        match spec.attachment {
            Attachment::VfkitDatagram => cmd.opt(
                "-listen-vfkit",
                format!("unixgram://{}", spec.network_socket.display()),
            ),
            Attachment::QemuStream => cmd.opt(
                "-listen-qemu",
                format!("unix://{}", spec.network_socket.display()),
            ),
        };
        cmd.opt("-services", format!("unix://{}", spec.services_socket.display()))
            .opt("-ssh-port", spec.ssh_port.to_string())
            .opt("-pid-file", spec.pid_file.display().to_string())
            .opt("-log-file", spec.log_file.display().to_string());
        Ok(cmd)
    }

    async fn start(&self, spec: &ProxySpec, cancel: &CancellationToken) -> VmResult<u32> {
        let cmd = self.command(spec)?;
        for stale in [&spec.network_socket, &spec.services_socket, &spec.pid_file] {
            remove_if_exists(stale)?;
        }

        let pid = process::spawn_detached(&cmd, &spec.log_file)?;
        info!(vm = %spec.name, pid, ssh_port = spec.ssh_port, "network proxy spawned");

        let sockets = [spec.network_socket.as_path(), spec.services_socket.as_path()];
        match wait_for_sockets(pid, &sockets, PROXY_SOCKET_WAIT, cancel).await {
            // A wrapper script may have exec'd or forked the real proxy.
            Ok(()) => match process::read_pid_file(&spec.pid_file) {
                Ok(written) if written != pid && process::is_alive(written) => {
                    debug!(vm = %spec.name, spawned = pid, pid = written, "proxy pid from pid file");
                    Ok(written)
                }
                _ => Ok(pid),
            },
            Err(reason) => {
                process::kill_now(pid);
                if matches!(reason, SocketWait::Cancelled) {
                    return Err(VmError::Cancelled);
                }
                Err(VmError::ProxyStart {
                    name: spec.name.clone(),
                    reason: reason.to_string(),
                    log: spec.log_file.clone(),
                })
            }
        }
    }

    async fn expose_port(
        &self,
        services_socket: &Path,
        host_port: u16,
        guest: SocketAddrV4,
    ) -> VmResult<()> {
        let local = format!("127.0.0.1:{host_port}");
        // An existing rule for the same local address makes expose fail.
        if let Err(e) = control_post(
            services_socket,
            "/services/forwarder/unexpose",
            &Forward {
                local: &local,
                remote: None,
                protocol: "tcp",
            },
        )
        .await
        {
            debug!(local = %local, error = %e, "unexpose before expose failed");
        }

        control_post(
            services_socket,
            "/services/forwarder/expose",
            &Forward {
                local: &local,
                remote: Some(guest.to_string()),
                protocol: "tcp",
            },
        )
        .await?;
        info!(local = %local, remote = %guest, "port exposed");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Forward<'a> {
    local: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote: Option<String>,
    protocol: &'a str,
}

/// POST a JSON body to the gvproxy services socket.
async fn control_post<T: Serialize>(socket: &Path, path: &str, body: &T) -> VmResult<()> {
    let payload =
        serde_json::to_vec(body).map_err(|e| VmError::ProxyApi(format!("encode request: {e}")))?;

    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| VmError::ProxyApi(format!("connect {}: {e}", socket.display())))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| VmError::ProxyApi(format!("handshake: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "proxy control connection closed");
        }
    });

    let request = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(HOST, "gvproxy")
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(payload)))
        .map_err(|e| VmError::ProxyApi(format!("build request: {e}")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| VmError::ProxyApi(format!("{path}: {e}")))?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response
        .into_body()
        .collect()
        .await
        .map(|b| String::from_utf8_lossy(&b.to_bytes()).trim().to_string())
        .unwrap_or_default();
    Err(VmError::ProxyApi(format!("{path}: HTTP {} {body}", status.as_u16())))
}

/// Reject socket paths that would be truncated by `bind(2)`.
pub fn check_socket_path(path: &Path) -> VmResult<()> {
    let len = path.as_os_str().len();
    if len >= SOCKET_PATH_LIMIT {
        return Err(VmError::SocketPathTooLong {
            path: path.to_path_buf(),
            len,
            limit: SOCKET_PATH_LIMIT,
        });
    }
    Ok(())
}

pub fn remove_if_exists(path: &Path) -> VmResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VmError::io(format!("remove {}", path.display()), e)),
    }
}

#[derive(Debug)]
enum SocketWait {
    Exited,
    TimedOut(PathBuf),
    Cancelled,
}

impl std::fmt::Display for SocketWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketWait::Exited => write!(f, "process exited before creating its sockets"),
            SocketWait::TimedOut(p) => write!(f, "socket {} never appeared", p.display()),
            SocketWait::Cancelled => write!(f, "cancelled"),
        }
    }
}

async fn wait_for_sockets(
    pid: u32,
    sockets: &[&Path],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), SocketWait> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let missing = sockets.iter().find(|s| !s.exists());
        let Some(missing) = missing else {
            return Ok(());
        };
        if !process::is_alive(pid) {
            return Err(SocketWait::Exited);
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(pid, socket = %missing.display(), "proxy socket did not appear");
            return Err(SocketWait::TimedOut(missing.to_path_buf()));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(SocketWait::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
}
