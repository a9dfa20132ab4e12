use tracing::warn;

use crate::config::Config;
use crate::error::{self, Result, VmError};
use crate::lock::LockedFile;
use crate::types::VmMetadata;

/// Per-VM metadata CRUD, spec.md §4.1. One JSON file per VM, guarded by an
/// exclusive lock on a sibling `.lock` file for every write.
pub struct MetadataStore {
    config: Config,
}

impl MetadataStore {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn metadata_path(&self, name: &str) -> std::path::PathBuf {
        self.config.vm_dir(name).join("metadata.json")
    }

    pub fn exists(&self, name: &str) -> bool {
        self.metadata_path(name).exists()
    }

    /// Serialize `meta` and write it under an exclusive lock. Creates the VM
    /// directory if missing.
    pub fn save(&self, meta: &VmMetadata) -> Result<()> {
        let dir = self.config.vm_dir(&meta.name);
        std::fs::create_dir_all(&dir).map_err(|e| VmError::io(error::io_ctx("create", &dir), e))?;

        let path = self.metadata_path(&meta.name);
        let payload = serde_json::to_vec_pretty(meta)
            .map_err(|e| VmError::json(format!("serialize metadata for '{}'", meta.name), e))?;

        let guard = LockedFile::acquire(&path)?;
        guard.write(&payload)
    }

    /// Best-effort read. Unknown fields in the JSON are ignored by serde's
    /// default deserialization (forward compatibility, spec.md §4.1).
    pub fn load(&self, name: &str) -> Result<VmMetadata> {
        let path = self.metadata_path(name);
        let bytes = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VmError::VmNotFound {
                    name: name.to_string(),
                }
            } else {
                VmError::io(error::io_ctx("read", &path), e)
            }
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| VmError::json(format!("parse metadata for '{name}'"), e))
    }

    /// Enumerate all VM directories. Individual bad entries are logged and
    /// skipped rather than failing the whole listing (spec.md §4.1, §7).
    pub fn list(&self) -> Result<Vec<VmMetadata>> {
        let vms_dir = self.config.vms_dir();
        if !vms_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&vms_dir)
            .map_err(|e| VmError::io(error::io_ctx("read", &vms_dir), e))?;

        let mut out = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if error::validate_vm_name(&name).is_err() {
                continue;
            }
            match self.load(&name) {
                Ok(meta) => out.push(meta),
                Err(e) => {
                    warn!(vm = %name, error = %e, "skipping vm with unreadable metadata");
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Recursively remove a VM's directory. Used by `create`'s rollback path
    /// and by `remove`; failures here are logged, never propagated, per the
    /// explicit exception in spec.md §7.
    pub fn purge_dir(&self, name: &str) {
        let dir = self.config.vm_dir(name);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(vm = name, error = %e, "failed to remove vm directory during cleanup");
            }
        }
    }
}
