//! On-disk VM registry: one JSON file per VM under `<data>/vms/`.
//!
//! Writes go to a temp file in the same directory and are renamed into
//! place, so a reader never observes a half-written record. There is no
//! cross-process locking; two invocations mutating the same VM name race.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::{VmError, VmResult};
use crate::vm::VmRecord;

const RECORD_EXT: &str = "json";

#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{RECORD_EXT}"))
    }

    /// Write `record`, replacing any existing record with the same name.
    pub fn save(&self, record: &VmRecord) -> VmResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| VmError::io(format!("create {}", self.dir.display()), e))?;

        let path = self.record_path(&record.name);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", record.name, std::process::id()));

        let json = serde_json::to_vec_pretty(record).map_err(|e| VmError::CorruptRecord {
            name: record.name.clone(),
            path: path.clone(),
            source: e,
        })?;

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(VmError::io(format!("write record {}", path.display()), e));
        }

        debug!(vm = %record.name, path = %path.display(), "record saved");
        Ok(())
    }

    /// Load a record. A missing file is [`VmError::NotFound`].
    pub fn load(&self, name: &str) -> VmResult<VmRecord> {
        let path = self.record_path(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VmError::NotFound(name.to_string()));
            }
            Err(e) => return Err(VmError::io(format!("read record {}", path.display()), e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| VmError::CorruptRecord {
            name: name.to_string(),
            path,
            source: e,
        })
    }

    /// Like [`load`](Self::load) but maps `NotFound` to `None`.
    pub fn find(&self, name: &str) -> VmResult<Option<VmRecord>> {
        match self.load(name) {
            Ok(record) => Ok(Some(record)),
            Err(VmError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All readable records, sorted by name. Corrupt files are skipped.
    pub fn list(&self) -> VmResult<Vec<VmRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VmError::io(format!("read {}", self.dir.display()), e)),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match self.load(name) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Remove the record file only. Disk images and sockets are the caller's.
    pub fn delete(&self, name: &str) -> VmResult<()> {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VmError::NotFound(name.to_string()))
            }
            Err(e) => Err(VmError::io(format!("delete record {}", path.display()), e)),
        }
    }
}
