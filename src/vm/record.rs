//! Persistent per-VM state.
//!
//! A [`VmRecord`] is written as pretty JSON so users can inspect it. Fields
//! introduced after the first release are `#[serde(default)]` so older
//! records keep loading.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vm::process;

/// Host the forwarded remote-shell port is bound on.
pub const SSH_HOST: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub disk_image_path: PathBuf,
    #[serde(default)]
    pub efi_vars_path: PathBuf,
    #[serde(default)]
    pub hypervisor_pid: Option<u32>,
    #[serde(default)]
    pub proxy_pid: Option<u32>,
    #[serde(default = "default_ssh_host")]
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key_path: PathBuf,
    #[serde(default)]
    pub log_file_path: PathBuf,
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub hypervisor: Option<String>,
    #[serde(default)]
    pub pipeline_name: Option<String>,
    #[serde(default)]
    pub pipeline_file: Option<PathBuf>,
    #[serde(default)]
    pub image_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_ssh_host() -> String {
    SSH_HOST.to_string()
}

/// Remote-shell parameters handed to the operation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
}

impl VmRecord {
    /// Liveness of the hypervisor, probed now. Never read from a stored flag.
    pub fn hypervisor_alive(&self) -> bool {
        self.hypervisor_pid.is_some_and(process::is_alive)
    }

    pub fn proxy_alive(&self) -> bool {
        self.proxy_pid.is_some_and(process::is_alive)
    }

    pub fn is_running(&self) -> bool {
        self.hypervisor_alive()
    }

    pub fn connection(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.ssh_host.clone(),
            port: self.ssh_port,
            user: self.ssh_user.clone(),
            key_path: self.ssh_key_path.clone(),
        }
    }

    /// Clear process identifiers after a stop.
    pub fn mark_stopped(&mut self) {
        self.hypervisor_pid = None;
        self.proxy_pid = None;
        self.updated_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_records_without_optional_fields_load() {
        let json = r#"{
            "name": "legacy",
            "disk_image_path": "/data/vms/legacy/disk.raw",
            "ssh_port": 41022,
            "ssh_user": "core",
            "ssh_key_path": "/home/u/.ssh/id_ed25519",
            "created_at": "2026-01-15T10:30:00Z"
        }"#;
        let record: VmRecord = serde_json::from_str(json).expect("legacy record should load");
        assert_eq!(record.ssh_host, "localhost");
        assert_eq!(record.hypervisor_pid, None);
        assert!(record.pipeline_name.is_none());
        assert!(!record.is_running());
    }

    #[test]
    fn zero_pid_is_never_alive() {
        let json = r#"{
            "name": "z", "disk_image_path": "/d", "hypervisor_pid": 0,
            "ssh_port": 1, "ssh_user": "u", "ssh_key_path": "/k",
            "created_at": "2026-01-15T10:30:00Z"
        }"#;
        let record: VmRecord = serde_json::from_str(json).unwrap();
        assert!(!record.hypervisor_alive());
    }
}
