use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Result, VmError};
use crate::exec::Exec;
use crate::image::parse_size_mib;
use crate::network::NetworkSubstrate;
use crate::types::VmMetadata;

const AARCH64_EFI_FIRMWARE: &str = "/usr/share/AAVMF/AAVMF_CODE.fd";

/// Builds the QEMU argument vector for a VM and launches it (spec.md §4.7).
pub struct QemuLauncher<E: Exec> {
    exec: E,
    config: Config,
}

impl<E: Exec> QemuLauncher<E> {
    pub fn new(exec: E, config: Config) -> Self {
        Self { exec, config }
    }

    fn qemu_binary(arch: &str) -> String {
        format!("qemu-system-{arch}")
    }

    pub fn qmp_socket(&self, name: &str) -> PathBuf {
        self.config.vm_dir(name).join("qmp.socket")
    }

    pub fn vnc_socket(&self, name: &str) -> PathBuf {
        self.config.vm_dir(name).join("vnc.socket")
    }

    /// Build the argv per spec.md §4.7: KVM flags, root + extra drives,
    /// aarch64 firmware branch, cdrom, net entries, daemonize + QMP socket,
    /// memory/smp, VNC unix socket.
    pub fn build_args(&self, meta: &VmMetadata) -> Result<Vec<String>> {
        let mut args = Vec::new();

        if !self.config.no_kvm {
            args.push("--enable-kvm".to_string());
            args.push("-cpu".to_string());
            args.push("host".to_string());
        }

        args.push("-drive".to_string());
        args.push(format!(
            "file={},if=virtio,cache=none,aio=threads,format=qcow2",
            meta.volume.display()
        ));

        for vol in &meta.extra_volumes {
            args.push("-drive".to_string());
            args.push(format!(
                "file={},if=virtio,cache=none,aio=threads,format=qcow2",
                vol.path.display()
            ));
        }

        if meta.arch == "aarch64" {
            args.push("-machine".to_string());
            args.push("virt".to_string());
            args.push("-bios".to_string());
            args.push(AARCH64_EFI_FIRMWARE.to_string());
        }

        args.push("-cdrom".to_string());
        args.push(meta.cloud_init_iso.to_string_lossy().into_owned());

        args.push("-net".to_string());
        args.push(format!("nic,model=virtio,macaddr={}", meta.mac_address));
        args.push("-net".to_string());
        args.push(format!(
            "tap,ifname={},script=/tmp/ifup,downscript=/tmp/ifdown",
            NetworkSubstrate::<E>::tap_name(&meta.name)
        ));

        args.push("-daemonize".to_string());
        args.push("-qmp".to_string());
        args.push(format!(
            "unix:{},server,nowait",
            self.qmp_socket(&meta.name).display()
        ));

        let memory_mib = parse_size_mib(&meta.memory)?;
        args.push("-m".to_string());
        args.push(memory_mib.to_string());
        args.push("-smp".to_string());
        args.push(format!("cpus={}", meta.cpu));

        args.push("-vnc".to_string());
        args.push(format!(
            "unix:{}",
            self.vnc_socket(&meta.name).display()
        ));
        args.push("-k".to_string());
        args.push(self.config.vnc_keyboard_layout.clone());

        Ok(args)
    }

    /// Launch QEMU for `meta`. Because of `-daemonize`, the spawned process
    /// forks and the parent exits once initialization succeeds; the caller
    /// then contacts QMP to confirm the child is up.
    pub async fn launch(&self, meta: &VmMetadata) -> Result<()> {
        let binary = Self::qemu_binary(&meta.arch);
        let args = self.build_args(meta)?;
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        debug!(vm = %meta.name, binary = %binary, args = ?args, "launching qemu");

        let output = self.exec.run(&binary, &arg_refs).await?;
        output.check(format!("{binary} (vm {})", meta.name))?;

        info!(vm = %meta.name, "qemu daemonized");
        Ok(())
    }

    /// Liveness probe via the Unix domain socket's presence; used as a
    /// cheap pre-check before attempting a QMP round trip.
    pub fn qmp_socket_exists(&self, name: &str) -> bool {
        self.qmp_socket(name).exists()
    }
}

/// How long to wait for the QMP socket to appear after `-daemonize` forks.
pub const DAEMONIZE_SETTLE: Duration = Duration::from_millis(200);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExec;
    use crate::types::ExtraVolume;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            state_root: dir.to_path_buf(),
            agents: vec![],
            subnet_cidr: String::new(),
            name_servers: vec![],
            no_kvm: false,
            vnc_keyboard_layout: "en-us".into(),
        }
    }

    fn meta(name: &str) -> VmMetadata {
        VmMetadata {
            name: name.to_string(),
            owner: "alice".into(),
            image: "ubuntu-22.04".into(),
            arch: "x86_64".into(),
            volume: PathBuf::from(format!("/tmp/{name}.qcow2")),
            mac_address: "52:54:00:aa:bb:cc".into(),
            ip_address: String::new(),
            cpu: "2".into(),
            memory: "1Gi".into(),
            disk: "10Gi".into(),
            tag: String::new(),
            lock: false,
            vnc_password: "abcdefgh123".into(),
            vnc_port: String::new(),
            user_data: String::new(),
            cloud_init_iso: PathBuf::from(format!("/tmp/{name}.iso")),
            extra_volumes: vec![],
        }
    }

    #[test]
    fn build_args_includes_kvm_flags_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = QemuLauncher::new(FakeExec::new(), config(dir.path()));
        let args = launcher.build_args(&meta("vm1")).unwrap();
        assert!(args.contains(&"--enable-kvm".to_string()));
    }

    #[test]
    fn build_args_omits_kvm_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.no_kvm = true;
        let launcher = QemuLauncher::new(FakeExec::new(), cfg);
        let args = launcher.build_args(&meta("vm1")).unwrap();
        assert!(!args.contains(&"--enable-kvm".to_string()));
    }

    #[test]
    fn build_args_adds_aarch64_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = QemuLauncher::new(FakeExec::new(), config(dir.path()));
        let mut m = meta("vm1");
        m.arch = "aarch64".into();
        let args = launcher.build_args(&m).unwrap();
        assert!(args.contains(&"-bios".to_string()));
        assert!(args.contains(&AARCH64_EFI_FIRMWARE.to_string()));
    }

    #[test]
    fn build_args_adds_one_drive_per_extra_volume() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = QemuLauncher::new(FakeExec::new(), config(dir.path()));
        let mut m = meta("vm1");
        m.extra_volumes.push(ExtraVolume {
            name: "extra-volume1".into(),
            path: PathBuf::from("/tmp/extra-volume1.qcow2"),
            size: "5Gi".into(),
        });
        let args = launcher.build_args(&m).unwrap();
        let drive_count = args.iter().filter(|a| a.as_str() == "-drive").count();
        assert_eq!(drive_count, 2);
    }

    #[test]
    fn build_args_converts_memory_to_mebibytes() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = QemuLauncher::new(FakeExec::new(), config(dir.path()));
        let args = launcher.build_args(&meta("vm1")).unwrap();
        let idx = args.iter().position(|a| a == "-m").unwrap();
        assert_eq!(args[idx + 1], "1024");
    }
}
