//! User configuration for the VM lifecycle core.
//!
//! Loaded from `config.toml` in the config directory. Every section is
//! `#[serde(default)]` so a partial file only overrides what it names, and
//! a missing file yields the compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::paths::expand_home;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DevVmConfig {
    pub vm: VmDefaults,
    pub timeouts: Timeouts,
    pub binaries: Binaries,
}

/// Sizing and remote-shell defaults for new VMs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VmDefaults {
    pub cpus: u32,
    pub memory_mb: u32,
    pub ssh_user: String,
    pub ssh_key: PathBuf,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 4096,
            ssh_user: "user".to_string(),
            ssh_key: PathBuf::from("~/.ssh/id_ed25519"),
        }
    }
}

/// Bounds for every wait in the lifecycle.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Timeouts {
    pub boot_secs: u64,
    pub ssh_secs: u64,
    pub stop_grace_secs: u64,
    pub kill_wait_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            boot_secs: 60,
            ssh_secs: 120,
            stop_grace_secs: 5,
            kill_wait_secs: 2,
            poll_interval_ms: 500,
        }
    }
}

impl Timeouts {
    pub fn boot(&self) -> Duration {
        Duration::from_secs(self.boot_secs)
    }

    pub fn ssh(&self) -> Duration {
        Duration::from_secs(self.ssh_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_secs(self.kill_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

/// Explicit locations for host programs. Unset means search `PATH` and the
/// well-known install prefixes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Binaries {
    pub vfkit: Option<PathBuf>,
    pub qemu: Option<PathBuf>,
    pub gvproxy: Option<PathBuf>,
    pub firmware_code: Option<PathBuf>,
    pub firmware_vars: Option<PathBuf>,
}

impl DevVmConfig {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read config {}", path.display()));
            }
        };
        let config = Self::from_toml(&content)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config.expanded())
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Expand `~/` in every configured path.
    pub fn expanded(mut self) -> Self {
        self.vm.ssh_key = expand_home(&self.vm.ssh_key);
        for path in [
            &mut self.binaries.vfkit,
            &mut self.binaries.qemu,
            &mut self.binaries.gvproxy,
            &mut self.binaries.firmware_code,
            &mut self.binaries.firmware_vars,
        ]
        .into_iter()
        .flatten()
        {
            *path = expand_home(path);
        }
        self
    }
}

/// Per-invocation settings handed to the orchestrator and drivers at
/// construction time.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub defaults: VmDefaults,
    pub timeouts: Timeouts,
    pub binaries: Binaries,
    /// Render commands without copying, spawning, or persisting anything.
    pub dry_run: bool,
}

impl OrchestratorConfig {
    pub fn from_config(config: DevVmConfig, dry_run: bool) -> Self {
        let config = config.expanded();
        Self {
            defaults: config.vm,
            timeouts: config.timeouts,
            binaries: config.binaries,
            dry_run,
        }
    }
}
