use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::{Result, VmError};
use crate::exec::Exec;

/// Build a cloud-init NoCloud seed ISO from `user_data` and the VM's name,
/// via `genisoimage -volid cidata -joliet -rock` over `user-data` and
/// `meta-data`, falling back to `mkisofs` (spec.md §4.8, glossary). Routed
/// through `Exec` like every other shell-out, so tests can substitute a fake
/// executor instead of actually invoking an ISO tool.
///
/// `meta-data` contains only `local-hostname: <name>`, matching the source's
/// minimal per-VM identity (no instance-id is needed since VM names are
/// already unique per host).
pub async fn create_seed_iso<E: Exec>(
    exec: &E,
    name: &str,
    user_data: &str,
    out_iso: &Path,
) -> Result<()> {
    let meta_data = format!("local-hostname: {name}\n");
    create_seed_iso_raw(exec, user_data.as_bytes(), meta_data.as_bytes(), out_iso).await
}

async fn create_seed_iso_raw<E: Exec>(
    exec: &E,
    user_data: &[u8],
    meta_data: &[u8],
    out_iso: &Path,
) -> Result<()> {
    if let Some(parent) = out_iso.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VmError::io("create cloud-init seed dir", e))?;
    }

    let dir = tempfile::tempdir().map_err(|e| VmError::io("create seed staging dir", e))?;
    let seed_path = dir.path();

    let user_data_path = seed_path.join("user-data");
    let meta_data_path = seed_path.join("meta-data");

    write_file(&user_data_path, user_data)?;
    write_file(&meta_data_path, meta_data)?;

    let out_iso_str = out_iso.to_string_lossy().into_owned();
    let user_data_str = user_data_path.to_string_lossy().into_owned();
    let meta_data_str = meta_data_path.to_string_lossy().into_owned();
    let args = [
        "-quiet",
        "-output",
        out_iso_str.as_str(),
        "-volid",
        "cidata",
        "-joliet",
        "-rock",
        user_data_str.as_str(),
        meta_data_str.as_str(),
    ];

    let genisoimage = exec.run("genisoimage", &args).await;
    let output = match genisoimage {
        Ok(out) if out.success() => out,
        _ => exec.run("mkisofs", &args).await?,
    };

    output.check("genisoimage/mkisofs")?;
    Ok(())
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut f =
        File::create(path).map_err(|e| VmError::io(format!("create {}", path.display()), e))?;
    f.write_all(contents)
        .map_err(|e| VmError::io(format!("write {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExec;

    #[test]
    fn meta_data_matches_hostname_format() {
        let meta = format!("local-hostname: {}\n", "vm1");
        assert_eq!(meta, "local-hostname: vm1\n");
    }

    #[tokio::test]
    async fn create_seed_iso_runs_genisoimage_via_exec() {
        let exec = FakeExec::new();
        let dir = tempfile::tempdir().unwrap();
        let out_iso = dir.path().join("seed.iso");
        create_seed_iso(&exec, "vm1", "#cloud-config\n", &out_iso)
            .await
            .unwrap();
        assert!(exec.calls().iter().any(|(program, _)| program == "genisoimage"));
    }

    #[tokio::test]
    async fn create_seed_iso_falls_back_to_mkisofs() {
        let exec = FakeExec::new();
        exec.set_response(
            "genisoimage",
            crate::exec::CmdOutput {
                code: Some(127),
                stdout: String::new(),
                stderr: "not found".into(),
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let out_iso = dir.path().join("seed.iso");
        create_seed_iso(&exec, "vm1", "", &out_iso).await.unwrap();
        assert!(exec.calls().iter().any(|(program, _)| program == "mkisofs"));
    }
}
