//! VM lifecycle orchestration.
//!
//! ## Start sequence
//!
//! ```text
//! start(name)
//!     ├─► registry.find ─┬─► restart path   (record + disk present: reuse port, key, disk)
//!     │                  └─► provision path (copy disk, fresh port, fresh EFI store)
//!     ├─► proxy.start ──► hypervisor.start
//!     ├─► wait_for_ready ──► wait_for_ssh ──► expose_port(guest address)
//!     └─► registry.save
//! ```
//!
//! Fatal errors before `wait_for_ready` leave no process and no record
//! behind. Readiness timeouts are degraded success: the VM keeps running,
//! the record is persisted, and the error is returned as a warning.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{VmError, VmResult};
use crate::paths::DevVmPaths;
use crate::vm::hypervisor::{HypervisorDriver, LaunchSpec};
use crate::vm::network::{self, Attachment, NetworkProxy, ProxySpec};
use crate::vm::process::{self, CommandLine, Termination};
use crate::vm::record::SSH_HOST;
use crate::vm::state::{Transitions, VmState};
use crate::vm::{ConnectionInfo, Registry, VmRecord, guest_addr, ports, remote};

/// Keeps `<runtime>/<name>-svc.sock` well inside the socket path limit.
const MAX_NAME_LEN: usize = 32;

const GUEST_SSH_PORT: u16 = 22;

/// Names become file and socket names, so only a conservative alphabet is
/// accepted.
pub fn validate_name(name: &str) -> VmResult<()> {
    let reason = if name.is_empty() {
        Some("name is empty".to_string())
    } else if name.len() > MAX_NAME_LEN {
        Some(format!("longer than {MAX_NAME_LEN} characters"))
    } else if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        Some("must start with a letter or digit".to_string())
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Some("only letters, digits, '-' and '_' are allowed".to_string())
    } else {
        None
    };
    match reason {
        Some(reason) => Err(VmError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Where everything belonging to one VM lives.
#[derive(Debug, Clone)]
pub struct VmLayout {
    pub dir: PathBuf,
    pub efi_vars: PathBuf,
    pub console_log: PathBuf,
    pub hypervisor_log: PathBuf,
    pub proxy_log: PathBuf,
    pub network_socket: PathBuf,
    pub services_socket: PathBuf,
    pub control_socket: PathBuf,
    pub proxy_pid_file: PathBuf,
}

impl VmLayout {
    pub fn new(paths: &DevVmPaths, name: &str) -> Self {
        let dir = paths.vm_dir(name);
        let run = &paths.runtime;
        Self {
            efi_vars: dir.join("efi-vars.fd"),
            console_log: dir.join("console.log"),
            hypervisor_log: dir.join("hypervisor.log"),
            proxy_log: dir.join("gvproxy.log"),
            network_socket: run.join(format!("{name}-net.sock")),
            services_socket: run.join(format!("{name}-svc.sock")),
            control_socket: run.join(format!("{name}-qmp.sock")),
            proxy_pid_file: run.join(format!("{name}-gvproxy.pid")),
            dir,
        }
    }

    /// Private disk copy, keeping the source's format extension.
    pub fn disk_for(&self, source: Option<&Path>) -> PathBuf {
        let ext = match source.and_then(|s| s.extension()).and_then(|e| e.to_str()) {
            Some("qcow2") => "qcow2",
            _ => "raw",
        };
        self.dir.join(format!("disk.{ext}"))
    }

    fn existing_disk(&self) -> Option<PathBuf> {
        ["disk.raw", "disk.qcow2"]
            .iter()
            .map(|f| self.dir.join(f))
            .find(|p| p.is_file())
    }

    pub fn runtime_files(&self) -> [&Path; 4] {
        [
            &self.network_socket,
            &self.services_socket,
            &self.control_socket,
            &self.proxy_pid_file,
        ]
    }

    fn check_socket_paths(&self) -> VmResult<()> {
        network::check_socket_path(&self.network_socket)?;
        network::check_socket_path(&self.services_socket)?;
        network::check_socket_path(&self.control_socket)
    }
}

/// Caller input for [`Orchestrator::start`]. Unset sizing falls back to the
/// stored record on restart, then to the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub name: String,
    /// Built disk image to copy in on the provision path.
    pub source_disk: Option<PathBuf>,
    pub cpus: Option<u32>,
    pub memory_mb: Option<u32>,
    pub pipeline_name: Option<String>,
    pub pipeline_file: Option<PathBuf>,
    pub image_tag: Option<String>,
}

impl StartRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_disk(mut self, disk: impl Into<PathBuf>) -> Self {
        self.source_disk = Some(disk.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPath {
    Provisioned,
    Restarted,
}

impl std::fmt::Display for StartPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartPath::Provisioned => f.write_str("provisioned"),
            StartPath::Restarted => f.write_str("restarted"),
        }
    }
}

#[derive(Debug)]
pub struct StartOutcome {
    pub name: String,
    pub path: StartPath,
    pub connection: ConnectionInfo,
    pub hypervisor_pid: Option<u32>,
    pub proxy_pid: Option<u32>,
    /// Non-fatal problems. The VM was left running.
    pub warnings: Vec<VmError>,
    /// Rendered proxy and hypervisor invocations; only filled on a dry run.
    pub commands: Vec<CommandLine>,
}

impl StartOutcome {
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Result of [`Orchestrator::stop`]; `None` means there was no process to signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    pub hypervisor: Option<Termination>,
    pub proxy: Option<Termination>,
}

/// Fresh view of one VM, derived from liveness probes.
#[derive(Debug, Clone, Serialize)]
pub struct VmStatus {
    pub name: String,
    pub state: VmState,
    pub running: bool,
    /// Set only while the process is alive.
    pub hypervisor_pid: Option<u32>,
    pub proxy_pid: Option<u32>,
    pub ssh_reachable: bool,
    pub connection: ConnectionInfo,
    pub disk_image_path: PathBuf,
    pub hypervisor: Option<String>,
    pub image_tag: Option<String>,
}

/// Everything [`Orchestrator::remove`] will delete.
#[derive(Debug, Clone, Serialize)]
pub struct RemovalPlan {
    pub name: String,
    pub running: bool,
    pub files: Vec<PathBuf>,
    /// Referenced by the record but outside the VM's storage; left in place.
    pub kept: Vec<PathBuf>,
}

/// Resolved parameters for one start attempt.
#[derive(Debug)]
struct Launch {
    path: StartPath,
    record: VmRecord,
    layout: VmLayout,
    copy_from: Option<PathBuf>,
    cpus: u32,
    memory_mb: u32,
    control_port: u16,
    fresh_efi: bool,
}

impl Launch {
    fn connection(&self) -> ConnectionInfo {
        self.record.connection()
    }

    fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            name: self.record.name.clone(),
            cpus: self.cpus,
            memory_mb: self.memory_mb,
            disk: self.record.disk_image_path.clone(),
            efi_vars: self.layout.efi_vars.clone(),
            console_log: self.layout.console_log.clone(),
            hypervisor_log: self.layout.hypervisor_log.clone(),
            network_socket: self.layout.network_socket.clone(),
            control_socket: self.layout.control_socket.clone(),
            control_port: self.control_port,
            fresh_efi: self.fresh_efi,
        }
    }

    fn proxy_spec(&self, attachment: Attachment) -> ProxySpec {
        ProxySpec {
            name: self.record.name.clone(),
            attachment,
            network_socket: self.layout.network_socket.clone(),
            services_socket: self.layout.services_socket.clone(),
            pid_file: self.layout.proxy_pid_file.clone(),
            log_file: self.layout.proxy_log.clone(),
            ssh_port: self.record.ssh_port,
        }
    }

    /// Snapshot to persist once both processes exist.
    fn to_record(&self, hypervisor_pid: u32, proxy_pid: u32) -> VmRecord {
        let mut record = self.record.clone();
        record.hypervisor_pid = Some(hypervisor_pid);
        record.proxy_pid = Some(proxy_pid);
        record.updated_at = Some(Utc::now());
        record
    }
}

pub struct Orchestrator {
    paths: DevVmPaths,
    registry: Registry,
    config: OrchestratorConfig,
    hypervisor: Arc<dyn HypervisorDriver>,
    proxy: Arc<dyn NetworkProxy>,
}

impl Orchestrator {
    pub fn new(
        paths: DevVmPaths,
        config: OrchestratorConfig,
        hypervisor: Arc<dyn HypervisorDriver>,
        proxy: Arc<dyn NetworkProxy>,
    ) -> Self {
        Self {
            registry: Registry::new(paths.vms.clone()),
            paths,
            config,
            hypervisor,
            proxy,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn layout(&self, name: &str) -> VmLayout {
        VmLayout::new(&self.paths, name)
    }

    /// Start `req.name`, provisioning it first when needed.
    pub async fn start(
        &self,
        req: StartRequest,
        cancel: &CancellationToken,
    ) -> VmResult<StartOutcome> {
        validate_name(&req.name)?;
        let existing = self.registry.find(&req.name)?;
        let states = Transitions::new(req.name.as_str(), VmState::observe(existing.as_ref()));

        let mut orphan_proxy = None;
        if let Some(record) = &existing {
            if record.hypervisor_alive() {
                return Err(VmError::AlreadyRunning {
                    name: req.name.clone(),
                });
            }
            if record.proxy_alive() {
                orphan_proxy = record.proxy_pid;
            }
        }

        self.hypervisor.check_available()?;
        self.proxy.check_available()?;

        if let Some(pid) = orphan_proxy {
            if self.config.dry_run {
                info!(vm = %req.name, pid, "dry run: would stop orphaned network proxy");
            } else {
                warn!(vm = %req.name, pid, "stopping network proxy left behind by a dead hypervisor");
                let t = &self.config.timeouts;
                process::terminate(pid, t.stop_grace(), t.kill_wait(), cancel).await;
            }
        }

        let live = self.live_ports(&req.name)?;
        let launch = match existing {
            Some(record) if record.disk_image_path.is_file() => {
                self.plan_restart(record, &req, &live, orphan_proxy.is_some())?
            }
            Some(record) => {
                warn!(
                    vm = %req.name,
                    disk = %record.disk_image_path.display(),
                    "disk image of existing VM is missing, provisioning a new one"
                );
                self.plan_provision(&req, Some(&record), &live)?
            }
            None => self.plan_provision(&req, None, &live)?,
        };
        launch.layout.check_socket_paths()?;

        if self.config.dry_run {
            let commands = vec![
                self.proxy
                    .command(&launch.proxy_spec(self.hypervisor.attachment()))?,
                self.hypervisor.command(&launch.launch_spec())?,
            ];
            return Ok(StartOutcome {
                name: req.name,
                path: launch.path,
                connection: launch.connection(),
                hypervisor_pid: None,
                proxy_pid: None,
                warnings: Vec::new(),
                commands,
            });
        }

        self.launch(launch, states, cancel).await
    }

    fn plan_restart(
        &self,
        mut record: VmRecord,
        req: &StartRequest,
        live: &HashMap<u16, String>,
        orphan_proxy: bool,
    ) -> VmResult<Launch> {
        let port = record.ssh_port;
        if let Some(holder) = live.get(&port) {
            return Err(VmError::PortInUse {
                port,
                holder: Some(holder.clone()),
            });
        }
        // On a dry run the orphaned proxy still holds the port.
        if !(self.config.dry_run && orphan_proxy) && !ports::is_port_free(port) {
            return Err(VmError::PortInUse { port, holder: None });
        }

        let layout = VmLayout::new(&self.paths, &record.name);
        let mut reserved: HashSet<u16> = live.keys().copied().collect();
        reserved.insert(port);
        let control_port = ports::allocate_port(&reserved)?;

        let defaults = &self.config.defaults;
        let cpus = req.cpus.or(record.cpus).unwrap_or(defaults.cpus);
        let memory_mb = req.memory_mb.or(record.memory_mb).unwrap_or(defaults.memory_mb);
        record.cpus = Some(cpus);
        record.memory_mb = Some(memory_mb);
        record.hypervisor = Some(self.hypervisor.kind().to_string());
        if record.efi_vars_path.as_os_str().is_empty() {
            record.efi_vars_path = layout.efi_vars.clone();
        }
        if record.log_file_path.as_os_str().is_empty() {
            record.log_file_path = layout.console_log.clone();
        }
        if req.pipeline_name.is_some() {
            record.pipeline_name = req.pipeline_name.clone();
        }
        if req.pipeline_file.is_some() {
            record.pipeline_file = req.pipeline_file.clone();
        }
        if req.image_tag.is_some() {
            record.image_tag = req.image_tag.clone();
        }

        info!(vm = %record.name, ssh_port = port, "restarting existing VM");
        Ok(Launch {
            path: StartPath::Restarted,
            record,
            layout,
            copy_from: None,
            cpus,
            memory_mb,
            control_port,
            fresh_efi: false,
        })
    }

    fn plan_provision(
        &self,
        req: &StartRequest,
        stale: Option<&VmRecord>,
        live: &HashMap<u16, String>,
    ) -> VmResult<Launch> {
        let layout = VmLayout::new(&self.paths, &req.name);
        let defaults = &self.config.defaults;

        let mut missing = Vec::new();
        let (disk, copy_from) = match &req.source_disk {
            Some(source) => {
                if !source.is_file() {
                    missing.push(source.clone());
                }
                (layout.disk_for(Some(source)), Some(source.clone()))
            }
            // No source given: a private copy from an earlier attempt is reusable.
            None => match layout.existing_disk() {
                Some(disk) => (disk, None),
                None => {
                    if let Some(stale) = stale {
                        missing.push(stale.disk_image_path.clone());
                    }
                    let disk = layout.disk_for(None);
                    if !missing.contains(&disk) {
                        missing.push(disk.clone());
                    }
                    (disk, None)
                }
            },
        };
        if !defaults.ssh_key.is_file() {
            missing.push(defaults.ssh_key.clone());
        }
        if !missing.is_empty() {
            return Err(VmError::MissingArtifacts {
                name: req.name.clone(),
                missing,
            });
        }

        let mut reserved: HashSet<u16> = live.keys().copied().collect();
        let ssh_port = ports::allocate_port(&reserved)?;
        reserved.insert(ssh_port);
        let control_port = ports::allocate_port(&reserved)?;

        let cpus = req.cpus.unwrap_or(defaults.cpus);
        let memory_mb = req.memory_mb.unwrap_or(defaults.memory_mb);
        let now = Utc::now();
        let record = VmRecord {
            name: req.name.clone(),
            disk_image_path: disk,
            efi_vars_path: layout.efi_vars.clone(),
            hypervisor_pid: None,
            proxy_pid: None,
            ssh_host: SSH_HOST.to_string(),
            ssh_port,
            ssh_user: defaults.ssh_user.clone(),
            ssh_key_path: defaults.ssh_key.clone(),
            log_file_path: layout.console_log.clone(),
            cpus: Some(cpus),
            memory_mb: Some(memory_mb),
            hypervisor: Some(self.hypervisor.kind().to_string()),
            pipeline_name: req.pipeline_name.clone(),
            pipeline_file: req.pipeline_file.clone(),
            image_tag: req.image_tag.clone(),
            created_at: now,
            updated_at: Some(now),
        };

        info!(vm = %req.name, ssh_port, "provisioning new VM");
        Ok(Launch {
            path: StartPath::Provisioned,
            record,
            layout,
            copy_from,
            cpus,
            memory_mb,
            control_port,
            fresh_efi: true,
        })
    }

    async fn launch(
        &self,
        launch: Launch,
        mut states: Transitions,
        cancel: &CancellationToken,
    ) -> VmResult<StartOutcome> {
        let name = launch.record.name.clone();
        if launch.path == StartPath::Provisioned {
            transition(&mut states, VmState::Provisioning);
        }

        for dir in [&launch.layout.dir, &self.paths.runtime] {
            std::fs::create_dir_all(dir)
                .map_err(|e| VmError::io(format!("create {}", dir.display()), e))?;
        }

        if let Some(source) = &launch.copy_from {
            if let Err(e) = copy_disk(source, &launch.record.disk_image_path).await {
                transition(&mut states, VmState::Failed);
                return Err(e);
            }
        }

        let proxy_spec = launch.proxy_spec(self.hypervisor.attachment());
        let launch_spec = launch.launch_spec();

        let proxy_pid = match self.proxy.start(&proxy_spec, cancel).await {
            Ok(pid) => pid,
            Err(e) => {
                transition(&mut states, VmState::Failed);
                return Err(e);
            }
        };
        let hypervisor_pid = match self.hypervisor.start(&launch_spec).await {
            Ok(pid) => pid,
            Err(e) => {
                process::kill_now(proxy_pid);
                transition(&mut states, VmState::Failed);
                return Err(e);
            }
        };

        let record = launch.to_record(hypervisor_pid, proxy_pid);
        let mut outcome = StartOutcome {
            name: name.clone(),
            path: launch.path,
            connection: record.connection(),
            hypervisor_pid: Some(hypervisor_pid),
            proxy_pid: Some(proxy_pid),
            warnings: Vec::new(),
            commands: Vec::new(),
        };

        let t = &self.config.timeouts;
        match self
            .hypervisor
            .wait_for_ready(&launch_spec, hypervisor_pid, t.boot(), t.poll_interval(), cancel)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_degraded() => {
                warn!(vm = %name, error = %e, "boot not confirmed, leaving VM running");
                transition(&mut states, VmState::Running);
                self.persist(&record).await?;
                outcome.warnings.push(e);
                return Ok(outcome);
            }
            Err(VmError::Cancelled) => {
                // A cancelled wait leaves the VM running and manageable.
                self.persist(&record).await?;
                return Err(VmError::Cancelled);
            }
            Err(e) => {
                self.hypervisor.cleanup(hypervisor_pid).await;
                process::kill_now(proxy_pid);
                transition(&mut states, VmState::Failed);
                return Err(e);
            }
        }
        transition(&mut states, VmState::Running);

        // The lease may already be in the console log; forwarding now lets
        // the ssh wait succeed against a non-default guest address.
        if let Err(e) = self
            .reassert_ssh_forward(&name, &launch.layout, record.ssh_port, proxy_pid)
            .await
        {
            debug!(vm = %name, error = %e, "early ssh port forward failed");
        }

        match self
            .hypervisor
            .wait_for_ssh(&name, &outcome.connection, t.ssh(), t.poll_interval(), cancel)
            .await
        {
            Ok(()) => {}
            Err(VmError::Cancelled) => {
                self.persist(&record).await?;
                return Err(VmError::Cancelled);
            }
            Err(e) => {
                warn!(vm = %name, error = %e, "remote shell not reachable yet");
                outcome.warnings.push(e);
            }
        }

        // Again, in case the lease line only appeared during the ssh wait.
        if let Err(e) = self
            .reassert_ssh_forward(&name, &launch.layout, record.ssh_port, proxy_pid)
            .await
        {
            warn!(vm = %name, error = %e, "could not re-assert ssh port forward");
            outcome.warnings.push(e);
        }

        self.persist(&record).await?;
        info!(
            vm = %name,
            path = %launch.path,
            ssh_port = record.ssh_port,
            hypervisor_pid,
            proxy_pid,
            "VM started"
        );
        Ok(outcome)
    }

    /// Save a record for running processes. If the write fails the
    /// processes are killed so nothing unmanaged is left behind.
    async fn persist(&self, record: &VmRecord) -> VmResult<()> {
        if let Err(e) = self.registry.save(record) {
            if let Some(pid) = record.hypervisor_pid {
                self.hypervisor.cleanup(pid).await;
            }
            if let Some(pid) = record.proxy_pid {
                process::kill_now(pid);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Point the forwarded ssh port at the guest's actual DHCP address.
    async fn reassert_ssh_forward(
        &self,
        name: &str,
        layout: &VmLayout,
        host_port: u16,
        proxy_pid: u32,
    ) -> VmResult<()> {
        if !process::is_alive(proxy_pid) {
            return Err(VmError::ProxyDown {
                name: name.to_string(),
            });
        }
        let (addr, found) = guest_addr::guest_address_from_file(&layout.console_log);
        if !found {
            debug!(vm = %name, guest = %addr, "no lease line in console log, using default address");
        }
        self.proxy
            .expose_port(
                &layout.services_socket,
                host_port,
                SocketAddrV4::new(addr, GUEST_SSH_PORT),
            )
            .await
    }

    /// Ports held by other VMs whose hypervisor or proxy is alive.
    fn live_ports(&self, except: &str) -> VmResult<HashMap<u16, String>> {
        Ok(self
            .registry
            .list()?
            .into_iter()
            .filter(|r| r.name != except && (r.hypervisor_alive() || r.proxy_alive()))
            .map(|r| (r.ssh_port, r.name))
            .collect())
    }

    /// Graceful-then-forced stop of the hypervisor, then the proxy.
    /// Always ends with the record marked stopped. Cancelling skips the
    /// grace periods and goes straight to SIGKILL.
    pub async fn stop(&self, name: &str, cancel: &CancellationToken) -> VmResult<StopReport> {
        validate_name(name)?;
        let mut record = self.registry.load(name)?;
        let mut states = Transitions::new(name, VmState::observe(Some(&record)));
        transition(&mut states, VmState::Stopping);

        if self.config.dry_run {
            info!(
                vm = %name,
                hypervisor_pid = ?record.hypervisor_pid,
                proxy_pid = ?record.proxy_pid,
                "dry run: would stop"
            );
            return Ok(StopReport {
                hypervisor: None,
                proxy: None,
            });
        }

        let hypervisor = match record.hypervisor_pid {
            Some(pid) => Some(self.terminate(name, "hypervisor", pid, cancel).await),
            None => None,
        };
        let proxy = match record.proxy_pid {
            Some(pid) => Some(self.terminate(name, "proxy", pid, cancel).await),
            None => None,
        };

        record.mark_stopped();
        self.registry.save(&record)?;
        for path in self.layout(name).runtime_files() {
            if let Err(e) = network::remove_if_exists(path) {
                debug!(path = %path.display(), error = %e, "runtime file cleanup failed");
            }
        }
        transition(&mut states, VmState::Stopped);
        info!(vm = %name, "VM stopped");
        Ok(StopReport { hypervisor, proxy })
    }

    async fn terminate(
        &self,
        name: &str,
        role: &str,
        pid: u32,
        cancel: &CancellationToken,
    ) -> Termination {
        let t = &self.config.timeouts;
        let outcome = process::terminate(pid, t.stop_grace(), t.kill_wait(), cancel).await;
        match outcome {
            Termination::AlreadyGone => debug!(vm = %name, role, pid, "already gone"),
            Termination::Graceful => info!(vm = %name, role, pid, "exited"),
            Termination::Forced => warn!(vm = %name, role, pid, "killed after grace period"),
            Termination::Unkillable => {
                let e = VmError::Signal {
                    pid,
                    reason: "still alive after SIGKILL".into(),
                };
                warn!(vm = %name, role, error = %e, "giving up on process");
            }
        }
        outcome
    }

    pub async fn status(&self, name: &str) -> VmResult<VmStatus> {
        validate_name(name)?;
        let record = self.registry.load(name)?;
        Ok(probe(record).await)
    }

    /// Status of every VM, probed concurrently.
    pub async fn list(&self) -> VmResult<Vec<VmStatus>> {
        let records = self.registry.list()?;
        Ok(join_all(records.into_iter().map(probe)).await)
    }

    pub fn removal_plan(&self, name: &str, force: bool) -> VmResult<RemovalPlan> {
        validate_name(name)?;
        let record = self.load_for_removal(name, force)?;
        Ok(self.plan_removal(name, record.as_ref()))
    }

    /// Remove a VM and everything it owns.
    ///
    /// `confirm` always sees the full [`RemovalPlan`] before anything is
    /// touched. Without `force` its answer decides, and a running VM is
    /// stopped gracefully first. With `force` the answer is ignored,
    /// processes are killed immediately, and a corrupt record is also
    /// removed. Paths outside the VM's own storage are never deleted.
    pub async fn remove<F>(
        &self,
        name: &str,
        force: bool,
        cancel: &CancellationToken,
        confirm: F,
    ) -> VmResult<RemovalPlan>
    where
        F: FnOnce(&RemovalPlan) -> bool,
    {
        validate_name(name)?;
        let record = self.load_for_removal(name, force)?;
        let plan = self.plan_removal(name, record.as_ref());

        let confirmed = confirm(&plan);
        if !force && !confirmed {
            return Err(VmError::Aborted);
        }
        if self.config.dry_run {
            return Ok(plan);
        }

        if let Some(record) = &record {
            if force {
                for pid in [record.hypervisor_pid, record.proxy_pid].into_iter().flatten() {
                    process::kill_now(pid);
                }
            } else if record.hypervisor_pid.is_some() || record.proxy_pid.is_some() {
                self.stop(name, cancel).await?;
            }
        }

        let layout = self.layout(name);
        let record_file = self.registry.record_path(name);
        for path in plan.files.iter().filter(|p| **p != record_file && !p.is_dir()) {
            network::remove_if_exists(path)?;
        }
        match std::fs::remove_dir_all(&layout.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(VmError::io(format!("remove {}", layout.dir.display()), e)),
        }
        match self.registry.delete(name) {
            Ok(()) | Err(VmError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!(vm = %name, files = plan.files.len(), "VM removed");
        Ok(plan)
    }

    fn load_for_removal(&self, name: &str, force: bool) -> VmResult<Option<VmRecord>> {
        match self.registry.load(name) {
            Ok(record) => Ok(Some(record)),
            Err(e @ VmError::CorruptRecord { .. }) if force => {
                warn!(vm = %name, error = %e, "removing corrupt record");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn plan_removal(&self, name: &str, record: Option<&VmRecord>) -> RemovalPlan {
        let layout = self.layout(name);
        let mut files = Vec::new();

        let record_file = self.registry.record_path(name);
        if record_file.exists() {
            files.push(record_file);
        }
        if let Ok(entries) = std::fs::read_dir(&layout.dir) {
            let mut owned: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
            owned.sort();
            files.extend(owned);
        }
        // Legacy records may point at a disk outside the VM directory,
        // possibly a shared build artifact. It is reported, not deleted.
        let kept = record
            .map(|r| r.disk_image_path.clone())
            .filter(|disk| !disk.starts_with(&layout.dir) && disk.is_file())
            .into_iter()
            .collect();
        files.extend(
            layout
                .runtime_files()
                .into_iter()
                .filter(|p| p.exists())
                .map(Path::to_path_buf),
        );

        RemovalPlan {
            name: name.to_string(),
            running: record.is_some_and(VmRecord::is_running),
            files,
            kept,
        }
    }

    /// Connection parameters for a running VM.
    pub fn connection_info(&self, name: &str) -> VmResult<ConnectionInfo> {
        validate_name(name)?;
        let record = self.registry.load(name)?;
        if !record.hypervisor_alive() {
            return Err(VmError::NotRunning {
                name: name.to_string(),
            });
        }
        if !record.proxy_alive() {
            return Err(VmError::ProxyDown {
                name: name.to_string(),
            });
        }
        Ok(record.connection())
    }

    /// Forward an extra guest port to the host. Returns the host port.
    pub async fn expose(
        &self,
        name: &str,
        guest_port: u16,
        host_port: Option<u16>,
    ) -> VmResult<u16> {
        let conn = self.connection_info(name)?;
        let host_port = match host_port {
            Some(port) => port,
            None => {
                let mut reserved: HashSet<u16> =
                    self.live_ports(name)?.into_keys().collect();
                reserved.insert(conn.port);
                ports::allocate_port(&reserved)?
            }
        };
        let layout = self.layout(name);
        let (addr, _) = guest_addr::guest_address_from_file(&layout.console_log);
        self.proxy
            .expose_port(
                &layout.services_socket,
                host_port,
                SocketAddrV4::new(addr, guest_port),
            )
            .await?;
        Ok(host_port)
    }

    /// Path of the guest serial console log.
    pub fn console_log(&self, name: &str) -> VmResult<PathBuf> {
        validate_name(name)?;
        let record = self.registry.load(name)?;
        if record.log_file_path.as_os_str().is_empty() {
            return Ok(self.layout(name).console_log);
        }
        Ok(record.log_file_path)
    }
}

fn transition(states: &mut Transitions, next: VmState) {
    if let Err(e) = states.advance(next) {
        debug!(error = %e, "state transition skipped");
    }
}

async fn probe(record: VmRecord) -> VmStatus {
    let hypervisor_alive = record.hypervisor_alive();
    let proxy_alive = record.proxy_alive();
    let ssh_reachable =
        hypervisor_alive && proxy_alive && remote::probe_ssh(&record.ssh_host, record.ssh_port).await;
    VmStatus {
        state: if hypervisor_alive {
            VmState::Running
        } else {
            VmState::Stopped
        },
        running: hypervisor_alive,
        hypervisor_pid: record.hypervisor_pid.filter(|_| hypervisor_alive),
        proxy_pid: record.proxy_pid.filter(|_| proxy_alive),
        ssh_reachable,
        connection: record.connection(),
        disk_image_path: record.disk_image_path,
        hypervisor: record.hypervisor,
        image_tag: record.image_tag,
        name: record.name,
    }
}

/// Copy `from` to `to` unless `to` already exists. Returns whether a copy
/// was made. Writes to a `.partial` sibling and renames, so an interrupted
/// copy is never mistaken for a finished one.
pub async fn copy_disk(from: &Path, to: &Path) -> VmResult<bool> {
    if to.exists() {
        info!(disk = %to.display(), "reusing existing disk copy");
        return Ok(false);
    }
    let partial = partial_path(to);
    let (src, dst, tmp) = (from.to_path_buf(), to.to_path_buf(), partial.clone());
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&tmp);
        reflink_copy::reflink_or_copy(&src, &tmp)?;
        std::fs::rename(&tmp, &dst)
    })
    .await
    .map_err(|e| VmError::io("disk copy task", std::io::Error::other(e)))?;

    if let Err(source) = result {
        let _ = std::fs::remove_file(&partial);
        return Err(VmError::DiskCopy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        });
    }
    info!(from = %from.display(), to = %to.display(), "disk image copied");
    Ok(true)
}

fn partial_path(to: &Path) -> PathBuf {
    let file = to
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "disk".to_string());
    to.with_file_name(format!(".{file}.partial"))
}
