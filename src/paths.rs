//! Directory layout for bootc-devvm.
//!
//! Provides a single `DevVmPaths` struct that resolves every directory the
//! VM lifecycle core touches. Follows platform conventions:
//!
//! - Config:   `~/.config/bootc-devvm/`  (human-editable, XDG-style)
//! - Data:     `~/Library/Application Support/bootc-devvm/` or `~/.local/share/bootc-devvm/`
//! - Logs:     `~/Library/Logs/bootc-devvm/` or `<data>/logs`
//! - Runtime:  short socket directory, see [`resolve_runtime_dir`]
//!
//! VM records live at `<data>/vms/<name>.json`; each VM owns the artifact
//! directory `<data>/vms/<name>/`.

use std::path::{Path, PathBuf};

use tracing::debug;

const APP_NAME: &str = "bootc-devvm";

/// Longest runtime directory we accept before falling back to `/tmp`.
/// Leaves room for `<name>-svc.sock` under the `sun_path` limit.
const MAX_RUNTIME_DIR_LEN: usize = 50;

/// All resolved directory paths.
#[derive(Debug, Clone)]
pub struct DevVmPaths {
    /// Human-editable config: `~/.config/bootc-devvm/`
    pub config: PathBuf,
    /// Machine-managed data root
    pub data: PathBuf,
    /// VM records and per-VM artifact directories
    pub vms: PathBuf,
    /// Application logs
    pub logs: PathBuf,
    /// Unix sockets and pid files
    pub runtime: PathBuf,
}

impl DevVmPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        let data = resolve_data_dir(&home);

        Some(Self {
            config: resolve_config_dir(&home),
            vms: data.join("vms"),
            logs: resolve_log_dir(&home),
            runtime: resolve_runtime_dir(),
            data,
        })
    }

    /// Lay everything out under a single root. Used by tests and `--state-dir`.
    pub fn under(root: &Path) -> Self {
        Self {
            config: root.join("config"),
            data: root.join("data"),
            vms: root.join("data").join("vms"),
            logs: root.join("logs"),
            runtime: root.join("run"),
        }
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.vms, &self.logs, &self.runtime] {
            std::fs::create_dir_all(dir)?;
            debug!("ensured directory: {}", dir.display());
        }
        restrict_permissions(&self.runtime)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Per-VM artifact directory (disk copy, EFI vars, logs).
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.vms.join(name)
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Application Support").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    resolve_data_dir(home).join("logs")
}

/// Pick a directory for Unix sockets.
///
/// `$TMPDIR` on macOS is a long `/var/folders/...` path that pushes socket
/// paths past the 104-byte `sun_path` limit, so it is never used. Prefer
/// `$XDG_RUNTIME_DIR` when it is short, else a per-user directory in `/tmp`.
pub fn resolve_runtime_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        let candidate = PathBuf::from(xdg).join(APP_NAME);
        if candidate.as_os_str().len() <= MAX_RUNTIME_DIR_LEN {
            return candidate;
        }
    }
    let uid = nix::unistd::getuid();
    PathBuf::from(format!("/tmp/{APP_NAME}-{uid}"))
}

fn restrict_permissions(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var("HOME")) {
        (Ok(rest), Ok(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
