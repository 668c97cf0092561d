//! Orchestrator tests against fake drivers.
//!
//! The fakes spawn real host processes (`sleep`, or a `sh` loop that ignores
//! SIGTERM) so liveness probes, stale-record detection, and the
//! graceful-then-forced stop all run against real PIDs. No hypervisor, proxy
//! or guest image is needed; everything runs under a per-test temp dir.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use bootc_devvm::config::{OrchestratorConfig, Timeouts, VmDefaults};
use bootc_devvm::paths::DevVmPaths;
use bootc_devvm::vm::network::Attachment;
use bootc_devvm::vm::process::{self, CommandLine, Termination};
use bootc_devvm::vm::{
    ConnectionInfo, HypervisorDriver, LaunchSpec, NetworkProxy, Orchestrator, ProxySpec,
    StartOutcome, StartPath, StartRequest, StopReport, VmState,
};
use bootc_devvm::{VmError, VmResult};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boot {
    /// Reports running immediately and writes a lease line to the console.
    Ready,
    /// Never reports running.
    Hangs,
    /// Process exits straight away.
    Crashes,
    /// Reports running, but ignores SIGTERM.
    Stubborn,
}

type Forwards = Arc<Mutex<Vec<(u16, SocketAddrV4)>>>;

struct FakeHypervisor {
    boot: Boot,
    ssh_ready: bool,
    available: bool,
    starts: AtomicUsize,
    /// When set, ssh only answers once a port forward exists.
    needs_forward: Option<Forwards>,
}

impl FakeHypervisor {
    fn new(boot: Boot) -> Self {
        Self {
            boot,
            ssh_ready: true,
            available: true,
            starts: AtomicUsize::new(0),
            needs_forward: None,
        }
    }
}

fn sh(script: &str) -> CommandLine {
    let mut cmd = CommandLine::new("/bin/sh");
    cmd.arg("-c").arg(script);
    cmd
}

#[async_trait]
impl HypervisorDriver for FakeHypervisor {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn attachment(&self) -> Attachment {
        Attachment::QemuStream
    }

    fn check_available(&self) -> VmResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(VmError::Unavailable {
                tool: "fake",
                reason: "not installed".into(),
                hint: "install it".into(),
            })
        }
    }

    fn command(&self, spec: &LaunchSpec) -> VmResult<CommandLine> {
        let mut cmd = match self.boot {
            Boot::Crashes => sh("exit 1"),
            Boot::Stubborn => sh("trap '' TERM; while :; do sleep 1; done"),
            Boot::Ready | Boot::Hangs => sh("exec sleep 60"),
        };
        cmd.arg(spec.name.clone());
        Ok(cmd)
    }

    async fn start(&self, spec: &LaunchSpec) -> VmResult<u32> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.prepare(spec)?;
        process::spawn_detached(&self.command(spec)?, &spec.hypervisor_log)
    }

    async fn wait_for_ready(
        &self,
        spec: &LaunchSpec,
        pid: u32,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> VmResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !process::is_alive(pid) {
                return Err(VmError::HypervisorExited {
                    name: spec.name.clone(),
                    log: spec.hypervisor_log.clone(),
                });
            }
            if matches!(self.boot, Boot::Ready | Boot::Stubborn) {
                std::fs::write(
                    &spec.console_log,
                    "systemd-networkd[612]: enp0s1: DHCPv4 address 192.168.127.9/24\n",
                )
                .unwrap();
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

    async fn wait_for_ssh(
        &self,
        name: &str,
        conn: &ConnectionInfo,
        timeout: Duration,
        _interval: Duration,
        _cancel: &CancellationToken,
    ) -> VmResult<()> {
        let forwarded = self
            .needs_forward
            .as_ref()
            .is_none_or(|f| !f.lock().unwrap().is_empty());
        if self.ssh_ready && forwarded {
            Ok(())
        } else {
            Err(VmError::SshTimeout {
                name: name.to_string(),
                port: conn.port,
                timeout,
            })
        }
    }
}

#[derive(Default)]
struct FakeProxy {
    starts: AtomicUsize,
    last_pid: Mutex<Option<u32>>,
    exposed: Forwards,
}

impl FakeProxy {
    fn last_pid(&self) -> Option<u32> {
        *self.last_pid.lock().unwrap()
    }
}

#[async_trait]
impl NetworkProxy for FakeProxy {
    fn check_available(&self) -> VmResult<()> {
        Ok(())
    }

    fn command(&self, spec: &ProxySpec) -> VmResult<CommandLine> {
        let mut cmd = sh("exec sleep 60");
        cmd.arg(spec.name.clone());
        Ok(cmd)
    }

    async fn start(&self, spec: &ProxySpec, _cancel: &CancellationToken) -> VmResult<u32> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let pid = process::spawn_detached(&self.command(spec)?, &spec.log_file)?;
        *self.last_pid.lock().unwrap() = Some(pid);
        Ok(pid)
    }

    async fn expose_port(
        &self,
        _services_socket: &Path,
        host_port: u16,
        guest: SocketAddrV4,
    ) -> VmResult<()> {
        self.exposed.lock().unwrap().push((host_port, guest));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    tmp: tempfile::TempDir,
    hypervisor: Arc<FakeHypervisor>,
    proxy: Arc<FakeProxy>,
    orchestrator: Orchestrator,
    source: PathBuf,
}

fn timeouts() -> Timeouts {
    Timeouts {
        boot_secs: 0,
        ssh_secs: 0,
        stop_grace_secs: 1,
        kill_wait_secs: 2,
        poll_interval_ms: 20,
    }
}

fn harness_with(hypervisor: FakeHypervisor, dry_run: bool) -> Harness {
    harness_timed(hypervisor, dry_run, timeouts())
}

fn harness_timed(hypervisor: FakeHypervisor, dry_run: bool, timeouts: Timeouts) -> Harness {
    harness_parts(hypervisor, FakeProxy::default(), dry_run, timeouts)
}

fn harness_parts(
    hypervisor: FakeHypervisor,
    proxy: FakeProxy,
    dry_run: bool,
    timeouts: Timeouts,
) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let paths = DevVmPaths::under(tmp.path());
    paths.ensure().unwrap();

    let key = tmp.path().join("id_ed25519");
    std::fs::write(&key, b"key").unwrap();
    let source = tmp.path().join("build/disk.raw");
    std::fs::create_dir_all(source.parent().unwrap()).unwrap();
    std::fs::write(&source, b"bootc disk v1").unwrap();

    let config = OrchestratorConfig {
        defaults: VmDefaults {
            ssh_key: key,
            ..VmDefaults::default()
        },
        timeouts,
        dry_run,
        ..OrchestratorConfig::default()
    };

    let hypervisor = Arc::new(hypervisor);
    let proxy = Arc::new(proxy);
    let orchestrator = Orchestrator::new(paths, config, hypervisor.clone(), proxy.clone());
    Harness {
        tmp,
        hypervisor,
        proxy,
        orchestrator,
        source,
    }
}

fn harness(boot: Boot) -> Harness {
    harness_with(FakeHypervisor::new(boot), false)
}

impl Harness {
    fn request(&self, name: &str) -> StartRequest {
        StartRequest::new(name).with_disk(&self.source)
    }

    async fn start(&self, name: &str) -> VmResult<StartOutcome> {
        self.orchestrator
            .start(self.request(name), &CancellationToken::new())
            .await
    }

    async fn stop(&self, name: &str) -> VmResult<StopReport> {
        self.orchestrator.stop(name, &CancellationToken::new()).await
    }

    fn disk_copy(&self, name: &str) -> PathBuf {
        self.tmp.path().join(format!("data/vms/{name}/disk.raw"))
    }
}

fn sigkill(pid: u32) {
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    // Reap so the probe sees it gone.
    let _ = process::is_alive(pid);
}

async fn wait_dead(pid: u32) {
    for _ in 0..100 {
        if !process::is_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pid {pid} still alive");
}

// ---------------------------------------------------------------------------
// Start / restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_stop_start_reuses_port_and_key() {
    let h = harness(Boot::Ready);

    let first = h.start("demo").await.unwrap();
    assert_eq!(first.path, StartPath::Provisioned);
    assert!(!first.is_degraded(), "warnings: {:?}", first.warnings);
    assert_eq!(first.connection.host, "localhost");
    assert_eq!(first.connection.user, "user");
    assert!(first.connection.port > 0);

    let status = h.orchestrator.status("demo").await.unwrap();
    assert!(status.running);
    assert_eq!(status.state, VmState::Running);

    h.stop("demo").await.unwrap();
    let status = h.orchestrator.status("demo").await.unwrap();
    assert!(!status.running);
    assert_eq!(status.state, VmState::Stopped);

    let second = h.start("demo").await.unwrap();
    assert_eq!(second.path, StartPath::Restarted);
    assert_eq!(second.connection.port, first.connection.port);
    assert_eq!(second.connection.key_path, first.connection.key_path);

    h.stop("demo").await.unwrap();
}

#[tokio::test]
async fn second_start_is_refused_without_new_processes() {
    let h = harness(Boot::Ready);
    h.start("demo").await.unwrap();

    let err = h.start("demo").await.unwrap_err();
    assert!(matches!(err, VmError::AlreadyRunning { .. }), "got {err}");
    assert!(err.to_string().contains("bootc-devvm stop demo"));
    assert_eq!(h.hypervisor.starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.proxy.starts.load(Ordering::SeqCst), 1);

    h.stop("demo").await.unwrap();
}

#[tokio::test]
async fn existing_disk_copy_is_not_recopied() {
    let h = harness(Boot::Ready);
    h.start("demo").await.unwrap();
    h.stop("demo").await.unwrap();
    let copy = h.disk_copy("demo");
    let mtime = std::fs::metadata(&copy).unwrap().modified().unwrap();

    // Lose the record but keep the copy, then provision again from a newer build.
    h.orchestrator.registry().delete("demo").unwrap();
    std::fs::write(&h.source, b"bootc disk v2").unwrap();

    let outcome = h.start("demo").await.unwrap();
    assert_eq!(outcome.path, StartPath::Provisioned);
    assert_eq!(std::fs::read(&copy).unwrap(), b"bootc disk v1");
    assert_eq!(std::fs::metadata(&copy).unwrap().modified().unwrap(), mtime);

    h.stop("demo").await.unwrap();
}

#[tokio::test]
async fn missing_disk_falls_back_to_provisioning() {
    let h = harness(Boot::Ready);
    h.start("demo").await.unwrap();
    h.stop("demo").await.unwrap();
    std::fs::remove_file(h.disk_copy("demo")).unwrap();

    let outcome = h.start("demo").await.unwrap();
    assert_eq!(outcome.path, StartPath::Provisioned);
    assert!(h.disk_copy("demo").is_file());

    h.stop("demo").await.unwrap();
}

#[tokio::test]
async fn missing_artifacts_are_listed_before_spawning() {
    let h = harness(Boot::Ready);
    let absent = h.tmp.path().join("build/absent.raw");
    let err = h
        .orchestrator
        .start(StartRequest::new("demo").with_disk(&absent), &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        VmError::MissingArtifacts { missing, .. } => assert_eq!(missing, &vec![absent]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("run the convert stage first"));
    assert_eq!(h.proxy.starts.load(Ordering::SeqCst), 0);
    assert!(h.orchestrator.registry().find("demo").unwrap().is_none());
}

#[tokio::test]
async fn unavailable_hypervisor_fails_fast() {
    let mut fake = FakeHypervisor::new(Boot::Ready);
    fake.available = false;
    let h = harness_with(fake, false);

    let err = h.start("demo").await.unwrap_err();
    assert!(matches!(err, VmError::Unavailable { .. }));
    assert_eq!(h.proxy.starts.load(Ordering::SeqCst), 0);
    assert!(!h.disk_copy("demo").exists());
}

#[tokio::test]
async fn restart_refuses_port_held_elsewhere() {
    let h = harness(Boot::Ready);
    let port = h.start("demo").await.unwrap().connection.port;
    h.stop("demo").await.unwrap();

    let _squatter = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    let err = h.start("demo").await.unwrap_err();
    assert!(matches!(err, VmError::PortInUse { port: p, .. } if p == port));
    assert_eq!(h.hypervisor.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ssh_forward_targets_leased_guest_address() {
    let h = harness(Boot::Ready);
    let outcome = h.start("demo").await.unwrap();

    let leased = (
        outcome.connection.port,
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 127, 9), 22),
    );
    let exposed = h.proxy.exposed.lock().unwrap().clone();
    assert!(!exposed.is_empty());
    assert!(exposed.iter().all(|e| *e == leased), "exposed: {exposed:?}");

    h.stop("demo").await.unwrap();
}

#[tokio::test]
async fn ssh_wait_sees_forward_to_leased_address() {
    let proxy = FakeProxy::default();
    let mut hypervisor = FakeHypervisor::new(Boot::Ready);
    hypervisor.needs_forward = Some(proxy.exposed.clone());
    let h = harness_parts(hypervisor, proxy, false, timeouts());

    let outcome = h.start("demo").await.unwrap();
    assert!(!outcome.is_degraded(), "warnings: {:?}", outcome.warnings);
    assert_eq!(
        h.proxy.exposed.lock().unwrap()[0].1,
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 127, 9), 22)
    );

    h.stop("demo").await.unwrap();
}

#[tokio::test]
async fn dry_run_renders_commands_only() {
    let h = harness_with(FakeHypervisor::new(Boot::Ready), true);
    let outcome = h.start("demo").await.unwrap();

    assert_eq!(outcome.commands.len(), 2);
    assert!(outcome.commands[1].args.contains(&"demo".to_string()));
    assert!(outcome.hypervisor_pid.is_none());
    assert_eq!(h.hypervisor.starts.load(Ordering::SeqCst), 0);
    assert_eq!(h.proxy.starts.load(Ordering::SeqCst), 0);
    assert!(!h.disk_copy("demo").exists());
    assert!(h.orchestrator.registry().find("demo").unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Readiness failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn boot_timeout_leaves_vm_running_and_recorded() {
    let h = harness(Boot::Hangs);
    let outcome = h.start("demo").await.unwrap();

    assert!(outcome.is_degraded());
    assert!(matches!(outcome.warnings[0], VmError::BootTimeout { .. }));
    assert!(outcome.warnings[0].is_degraded());

    let record = h.orchestrator.registry().load("demo").unwrap();
    assert_eq!(record.hypervisor_pid, outcome.hypervisor_pid);
    assert!(record.is_running());

    h.stop("demo").await.unwrap();
}

#[tokio::test]
async fn ssh_timeout_is_only_a_warning() {
    let mut fake = FakeHypervisor::new(Boot::Ready);
    fake.ssh_ready = false;
    let h = harness_with(fake, false);

    let outcome = h.start("demo").await.unwrap();
    assert!(matches!(outcome.warnings.as_slice(), [VmError::SshTimeout { .. }]));
    assert!(h.orchestrator.status("demo").await.unwrap().running);

    h.stop("demo").await.unwrap();
}

#[tokio::test]
async fn crash_during_boot_cleans_up_everything() {
    let h = harness(Boot::Crashes);
    let mut req = h.request("demo");
    req.cpus = Some(1);
    let err = h
        .orchestrator
        .start(req, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, VmError::HypervisorExited { .. }), "got {err}");
    wait_dead(h.proxy.last_pid().unwrap()).await;
    assert!(h.orchestrator.registry().find("demo").unwrap().is_none());
}

#[tokio::test]
async fn cancelled_wait_keeps_vm_running() {
    let h = harness_timed(
        FakeHypervisor::new(Boot::Hangs),
        false,
        Timeouts {
            boot_secs: 30,
            ..timeouts()
        },
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut req = h.request("demo");
    req.memory_mb = Some(1024);

    let err = h.orchestrator.start(req, &cancel).await.unwrap_err();
    assert!(matches!(err, VmError::Cancelled), "got {err}");

    let record = h.orchestrator.registry().load("demo").unwrap();
    assert!(record.is_running());
    assert_eq!(record.memory_mb, Some(1024));

    h.stop("demo").await.unwrap();
}

// ---------------------------------------------------------------------------
// Stop / status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_forces_process_that_ignores_sigterm() {
    let h = harness(Boot::Stubborn);
    let outcome = h.start("demo").await.unwrap();
    let pid = outcome.hypervisor_pid.unwrap();

    let started = std::time::Instant::now();
    let report = h.stop("demo").await.unwrap();
    assert_eq!(report.hypervisor, Some(Termination::Forced));
    assert_eq!(report.proxy, Some(Termination::Graceful));
    assert!(started.elapsed() < Duration::from_secs(6));
    assert!(!process::is_alive(pid));

    let record = h.orchestrator.registry().load("demo").unwrap();
    assert_eq!(record.hypervisor_pid, None);
    assert_eq!(record.proxy_pid, None);
}

#[tokio::test]
async fn cancelled_stop_skips_grace_period() {
    let h = harness_timed(
        FakeHypervisor::new(Boot::Stubborn),
        false,
        Timeouts {
            stop_grace_secs: 30,
            ..timeouts()
        },
    );
    let pid = h.start("demo").await.unwrap().hypervisor_pid.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let started = std::time::Instant::now();
    let report = h.orchestrator.stop("demo", &cancel).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.hypervisor, Some(Termination::Forced));
    assert!(!process::is_alive(pid));

    let record = h.orchestrator.registry().load("demo").unwrap();
    assert_eq!(record.hypervisor_pid, None);
    assert_eq!(record.proxy_pid, None);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let h = harness(Boot::Ready);
    h.start("demo").await.unwrap();
    h.stop("demo").await.unwrap();

    let report = h.stop("demo").await.unwrap();
    assert_eq!(report.hypervisor, None);
    assert_eq!(report.proxy, None);
}

#[tokio::test]
async fn status_ignores_stale_running_record() {
    let h = harness(Boot::Ready);
    let outcome = h.start("demo").await.unwrap();
    sigkill(outcome.hypervisor_pid.unwrap());

    // The record still carries the dead pid.
    let record = h.orchestrator.registry().load("demo").unwrap();
    assert_eq!(record.hypervisor_pid, outcome.hypervisor_pid);

    let status = h.orchestrator.status("demo").await.unwrap();
    assert!(!status.running);
    assert_eq!(status.state, VmState::Stopped);
    assert_eq!(status.hypervisor_pid, None);

    h.stop("demo").await.unwrap();
}

#[tokio::test]
async fn start_after_crash_clears_orphaned_proxy() {
    let h = harness(Boot::Ready);
    let first = h.start("demo").await.unwrap();
    let orphan = first.proxy_pid.unwrap();
    sigkill(first.hypervisor_pid.unwrap());
    assert!(process::is_alive(orphan));

    let second = h.start("demo").await.unwrap();
    assert_eq!(second.path, StartPath::Restarted);
    assert!(!process::is_alive(orphan));
    assert_ne!(second.proxy_pid, Some(orphan));

    h.stop("demo").await.unwrap();
}

#[tokio::test]
async fn connection_info_distinguishes_stopped_and_proxy_down() {
    let h = harness(Boot::Ready);
    let outcome = h.start("demo").await.unwrap();
    assert_eq!(
        h.orchestrator.connection_info("demo").unwrap(),
        outcome.connection
    );

    sigkill(outcome.proxy_pid.unwrap());
    let err = h.orchestrator.connection_info("demo").unwrap_err();
    assert!(matches!(err, VmError::ProxyDown { .. }));
    assert!(err.to_string().contains("restart"));

    h.stop("demo").await.unwrap();
    let err = h.orchestrator.connection_info("demo").unwrap_err();
    assert!(matches!(err, VmError::NotRunning { .. }));
}

#[tokio::test]
async fn list_reports_each_vm_fresh() {
    let h = harness(Boot::Ready);
    h.start("alpha").await.unwrap();
    h.start("beta").await.unwrap();
    h.stop("beta").await.unwrap();

    let list = h.orchestrator.list().await.unwrap();
    let summary: Vec<_> = list.iter().map(|s| (s.name.as_str(), s.running)).collect();
    assert_eq!(summary, vec![("alpha", true), ("beta", false)]);
    assert_ne!(list[0].connection.port, list[1].connection.port);

    h.stop("alpha").await.unwrap();
}

// ---------------------------------------------------------------------------
// Remove
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remove_lists_files_then_stops_and_deletes() {
    let h = harness(Boot::Ready);
    let outcome = h.start("demo").await.unwrap();
    let pid = outcome.hypervisor_pid.unwrap();

    let mut seen = None;
    let plan = h
        .orchestrator
        .remove("demo", false, &CancellationToken::new(), |plan| {
            // Nothing is touched before confirmation.
            assert!(process::is_alive(pid));
            seen = Some(plan.clone());
            true
        })
        .await
        .unwrap();

    let seen = seen.unwrap();
    assert!(seen.running);
    assert!(seen.files.contains(&h.orchestrator.registry().record_path("demo")));
    assert!(seen.files.contains(&h.disk_copy("demo")));
    assert_eq!(plan.files, seen.files);

    assert!(!process::is_alive(pid));
    assert!(h.orchestrator.registry().find("demo").unwrap().is_none());
    assert!(!h.orchestrator.layout("demo").dir.exists());
}

#[tokio::test]
async fn declined_removal_changes_nothing() {
    let h = harness(Boot::Ready);
    h.start("demo").await.unwrap();

    let err = h
        .orchestrator
        .remove("demo", false, &CancellationToken::new(), |_| false)
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::Aborted));
    assert!(h.orchestrator.status("demo").await.unwrap().running);
    assert!(h.disk_copy("demo").exists());

    h.stop("demo").await.unwrap();
}

#[tokio::test]
async fn forced_removal_ignores_answer_and_clears_corrupt_record() {
    let h = harness(Boot::Ready);
    let record_path = h.orchestrator.registry().record_path("demo");
    std::fs::write(&record_path, b"{ not json").unwrap();

    let err = h.start("demo").await.unwrap_err();
    assert!(matches!(err, VmError::CorruptRecord { .. }));
    assert!(err.to_string().contains("rm --force demo"));

    let mut seen = None;
    h.orchestrator
        .remove("demo", true, &CancellationToken::new(), |plan| {
            seen = Some(plan.clone());
            false
        })
        .await
        .unwrap();
    assert!(seen.unwrap().files.contains(&record_path));
    assert!(!record_path.exists());
}

#[tokio::test]
async fn forced_removal_shows_plan_and_keeps_outside_disk() {
    let h = harness(Boot::Ready);
    let pid = h.start("demo").await.unwrap().hypervisor_pid.unwrap();

    // An older record that booted the build artifact in place.
    let mut record = h.orchestrator.registry().load("demo").unwrap();
    record.disk_image_path = h.source.clone();
    h.orchestrator.registry().save(&record).unwrap();

    let mut seen = None;
    let plan = h
        .orchestrator
        .remove("demo", true, &CancellationToken::new(), |plan| {
            assert!(process::is_alive(pid));
            seen = Some(plan.clone());
            false
        })
        .await
        .unwrap();

    let seen = seen.unwrap();
    assert!(seen.running);
    assert_eq!(seen.kept, vec![h.source.clone()]);
    assert!(!seen.files.contains(&h.source));
    assert_eq!(plan.files, seen.files);

    assert!(h.source.exists());
    assert!(!process::is_alive(pid));
    assert!(h.orchestrator.registry().find("demo").unwrap().is_none());
}
