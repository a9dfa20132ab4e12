use std::path::{Path, PathBuf};

use byte_unit::Byte;
use tracing::info;

use crate::config::Config;
use crate::error::{Result, VmError};
use crate::exec::Exec;

/// Creates root and extra-volume qcow2 files, and tracks the base-image
/// library (spec.md §4.3).
pub struct ImageStore<E: Exec> {
    exec: E,
    config: Config,
}

impl<E: Exec> ImageStore<E> {
    pub fn new(exec: E, config: Config) -> Self {
        Self { exec, config }
    }

    pub fn path_for(&self, base_image: &str) -> PathBuf {
        self.config.images_dir().join(format!("{base_image}.qcow2"))
    }

    /// If `base_image` is non-empty, clone it as a thin-provisioned backing
    /// overlay; otherwise create a standalone qcow2 of `size`. Returns the
    /// absolute path to the created file at `<target_dir>/<name>.qcow2`.
    pub async fn create_image(
        &self,
        name: &str,
        size: &str,
        base_image: &str,
        target_dir: &Path,
    ) -> Result<PathBuf> {
        let out_path = target_dir.join(format!("{name}.qcow2"));
        if out_path.exists() {
            return Err(VmError::ExecFailed {
                command: "qemu-img create".into(),
                code: None,
                stderr: format!("{} already exists", out_path.display()),
            });
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VmError::io("create image dir", e))?;
        }

        if !base_image.is_empty() {
            let base_path = self.path_for(base_image);
            if !base_path.exists() {
                return Err(VmError::ImageNotFound {
                    name: base_image.to_string(),
                });
            }
            self.create_backed(&base_path, &out_path).await?;
        } else {
            let bytes = parse_size(size)?;
            self.create_standalone(&out_path, bytes).await?;
        }

        info!(path = %out_path.display(), base = base_image, "created volume");
        Ok(out_path)
    }

    async fn create_backed(&self, base: &Path, overlay: &Path) -> Result<()> {
        let output = self
            .exec
            .run(
                "qemu-img",
                &[
                    "create",
                    "-f",
                    "qcow2",
                    "-b",
                    &base.to_string_lossy(),
                    "-F",
                    "qcow2",
                    &overlay.to_string_lossy(),
                ],
            )
            .await?;
        output.check(format!(
            "qemu-img create -b {} {}",
            base.display(),
            overlay.display()
        ))?;
        Ok(())
    }

    async fn create_standalone(&self, path: &Path, bytes: u64) -> Result<()> {
        let output = self
            .exec
            .run(
                "qemu-img",
                &[
                    "create",
                    "-f",
                    "qcow2",
                    &path.to_string_lossy(),
                    &bytes.to_string(),
                ],
            )
            .await?;
        output.check(format!("qemu-img create {}", path.display()))?;
        Ok(())
    }

    /// List the base images available under `images_dir`.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.config.images_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| VmError::io("read images dir", e))? {
            let entry = entry.map_err(|e| VmError::io("read images dir entry", e))?;
            if let Some(name) = entry.path().file_stem() {
                if entry.path().extension().is_some_and(|ext| ext == "qcow2") {
                    out.push(name.to_string_lossy().into_owned());
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Parse an SI-prefixed size string (`Ki`/`Mi`/`Gi`/`Ti`) into bytes
/// (spec.md §4.3).
pub fn parse_size(size: &str) -> Result<u64> {
    Byte::parse_str(size, true)
        .map(|b| b.as_u64())
        .map_err(|e| VmError::InvalidSize {
            value: size.to_string(),
            reason: e.to_string(),
        })
}

/// Convert a size string to whole mebibytes, rounding down, for QEMU's `-m`
/// flag (spec.md §4.7).
pub fn parse_size_mib(size: &str) -> Result<u64> {
    Ok(parse_size(size)? / (1024 * 1024))
}
