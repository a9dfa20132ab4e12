use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::cloudinit;
use crate::config::Config;
use crate::error::{self, Result, VmError};
use crate::exec::Exec;
use crate::forwarder::Forwarder;
use crate::image::ImageStore;
use crate::metadata::MetadataStore;
use crate::network::NetworkSubstrate;
use crate::qemu::QemuLauncher;
use crate::qmp::QmpClient;
use crate::types::{CreateParams, ExtraVolume, IpUpdate, ResizeParams, VmMetadata, VmStatus, VmView};

/// The top-level lifecycle orchestrator (spec.md §4.8). Sole writer of VM
/// metadata; composes the image store, network substrate, QMP client, and
/// forwarder. Per-VM mutual exclusion is an in-memory keyed mutex (design
/// note §9) layered on top of the cross-process advisory file lock already
/// enforced by `metadata::MetadataStore`.
pub struct VmSupervisor<E: Exec> {
    config: Config,
    exec: E,
    metadata: MetadataStore,
    network: NetworkSubstrate<E>,
    images: ImageStore<E>,
    qemu: QemuLauncher<E>,
    forwarder: Arc<Forwarder<E>>,
    vm_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl<E: Exec> VmSupervisor<E> {
    pub fn new(exec: E, config: Config, forwarder: Arc<Forwarder<E>>) -> Self {
        Self {
            metadata: MetadataStore::new(config.clone()),
            network: NetworkSubstrate::new(exec.clone(), config.clone()),
            images: ImageStore::new(exec.clone(), config.clone()),
            qemu: QemuLauncher::new(exec.clone(), config.clone()),
            exec,
            forwarder,
            vm_locks: DashMap::new(),
            config,
        }
    }

    fn vm_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.vm_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// create(name, owner, image, cpu, memory, disk, user_data, tag):
    /// rejects if metadata exists, builds the root qcow2 and seed ISO,
    /// generates MAC/VNC secrets, persists metadata, then starts the VM. Any
    /// failure after directory creation rolls back the directory (spec.md
    /// §4.8; rollback errors are logged and ignored per spec.md §7).
    pub async fn create(&self, params: CreateParams) -> Result<VmView> {
        error::validate_vm_name(&params.name)?;
        let lock = self.vm_lock(&params.name);
        let _guard = lock.lock().await;

        if self.metadata.exists(&params.name) {
            return Err(VmError::VmAlreadyExists {
                name: params.name.clone(),
            });
        }

        match self.create_inner(&params).await {
            Ok(view) => Ok(view),
            Err(e) => {
                self.metadata.purge_dir(&params.name);
                Err(e)
            }
        }
    }

    async fn create_inner(&self, params: &CreateParams) -> Result<VmView> {
        let vm_dir = self.config.vm_dir(&params.name);
        std::fs::create_dir_all(&vm_dir).map_err(|e| VmError::io("create vm dir", e))?;

        let volume = self
            .images
            .create_image(&params.name, &params.disk, &params.image, &vm_dir)
            .await?;

        let iso_path = vm_dir.join("cloud-init.iso");
        cloudinit::create_seed_iso(&self.exec, &params.name, &params.user_data, &iso_path).await?;

        let mac_address = generate_mac();
        let vnc_password = generate_vnc_password();

        let meta = VmMetadata {
            name: params.name.clone(),
            owner: params.owner.clone(),
            image: params.image.clone(),
            arch: params
                .arch
                .clone()
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            volume,
            mac_address,
            ip_address: String::new(),
            cpu: params.cpu.clone(),
            memory: params.memory.clone(),
            disk: params.disk.clone(),
            tag: params.tag.clone(),
            lock: false,
            vnc_password,
            vnc_port: String::new(),
            user_data: params.user_data.clone(),
            cloud_init_iso: iso_path,
            extra_volumes: Vec::new(),
        };

        self.metadata.save(&meta)?;
        info!(vm = %meta.name, "vm created");

        self.start_locked(&meta.name).await
    }

    /// start(name): requires status == stopped. Prepares the tap,
    /// materializes ifup/ifdown, launches QEMU, queries the VNC port via
    /// QMP, updates metadata.
    pub async fn start(&self, name: &str) -> Result<VmView> {
        let lock = self.vm_lock(name);
        let _guard = lock.lock().await;
        self.start_locked(name).await
    }

    async fn start_locked(&self, name: &str) -> Result<VmView> {
        let mut meta = self.metadata.load(name)?;
        let status = self.query_status(name).await;
        if status != VmStatus::Stopped {
            return Err(VmError::WrongState {
                name: name.to_string(),
                state: status.to_string(),
                expected: "stopped".to_string(),
            });
        }

        self.network.prepare_vm_if(name).await?;
        self.qemu.launch(&meta).await?;
        tokio::time::sleep(crate::qemu::DAEMONIZE_SETTLE).await;

        let qmp_socket = self.qemu.qmp_socket(name);
        let mut qmp = QmpClient::connect(name, &qmp_socket).await?;
        let vnc_port = qmp
            .query_vnc()
            .await?
            .unwrap_or_default();

        meta.vnc_port = vnc_port;
        self.metadata.save(&meta)?;

        info!(vm = name, "vm started");
        Ok(VmView {
            status: VmStatus::Running,
            metadata: meta,
        })
    }

    /// stop(name): no-op if already stopped. Otherwise `system_powerdown`
    /// with a 10s deadline; on failure, `quit`; then close the QMP session
    /// and await the disconnect signal.
    pub async fn stop(&self, name: &str) -> Result<VmView> {
        let lock = self.vm_lock(name);
        let _guard = lock.lock().await;

        let mut meta = self.metadata.load(name)?;
        let status = self.query_status(name).await;
        if status == VmStatus::Stopped {
            return Ok(VmView { metadata: meta, status });
        }

        let qmp_socket = self.qemu.qmp_socket(name);
        if let Ok(mut qmp) = QmpClient::connect(name, &qmp_socket).await {
            let powerdown = qmp.system_powerdown().await;
            if powerdown.is_err() {
                let _ = qmp.quit().await;
            }
            qmp.close().await?;
        }

        meta.vnc_port = String::new();
        self.metadata.save(&meta)?;

        info!(vm = name, "vm stopped");
        Ok(VmView {
            metadata: meta,
            status: VmStatus::Stopped,
        })
    }

    /// resize(name, cpu?, memory?, disk?): metadata-only; non-empty fields
    /// overwrite, takes effect at next start.
    pub async fn resize(&self, name: &str, params: ResizeParams) -> Result<VmView> {
        let lock = self.vm_lock(name);
        let _guard = lock.lock().await;

        let mut meta = self.metadata.load(name)?;
        if let Some(cpu) = params.cpu {
            meta.cpu = cpu;
        }
        if let Some(memory) = params.memory {
            meta.memory = memory;
        }
        if let Some(disk) = params.disk {
            meta.disk = disk;
        }
        self.metadata.save(&meta)?;
        let status = self.query_status(name).await;
        Ok(VmView { metadata: meta, status })
    }

    /// lock(name) / unlock(name): toggle the lock flag guarding destructive
    /// operations.
    pub async fn lock(&self, name: &str) -> Result<VmView> {
        self.set_lock(name, true).await
    }

    pub async fn unlock(&self, name: &str) -> Result<VmView> {
        self.set_lock(name, false).await
    }

    async fn set_lock(&self, name: &str, locked: bool) -> Result<VmView> {
        let guard = self.vm_lock(name);
        let _g = guard.lock().await;
        let mut meta = self.metadata.load(name)?;
        meta.lock = locked;
        self.metadata.save(&meta)?;
        let status = self.query_status(name).await;
        Ok(VmView { metadata: meta, status })
    }

    /// add_volume(name, size): allocates the lowest unused name from
    /// `extra-volume1..extra-volume256` by linear scan, creates the qcow2,
    /// appends the entry, persists. On metadata-save failure the created
    /// file is deleted.
    pub async fn add_volume(&self, name: &str, size: &str) -> Result<VmView> {
        let guard = self.vm_lock(name);
        let _g = guard.lock().await;

        let mut meta = self.metadata.load(name)?;
        if meta.extra_volumes.len() >= crate::types::MAX_EXTRA_VOLUMES {
            return Err(VmError::MaxVolumesReached {
                name: name.to_string(),
                max: crate::types::MAX_EXTRA_VOLUMES,
            });
        }

        let vol_name = next_volume_name(&meta.extra_volumes)?;
        let vm_dir = self.config.vm_dir(name);
        let path = self.images.create_image(&vol_name, size, "", &vm_dir).await?;

        meta.extra_volumes.push(ExtraVolume {
            name: vol_name.clone(),
            path: path.clone(),
            size: size.to_string(),
        });

        if let Err(e) = self.metadata.save(&meta) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        let status = self.query_status(name).await;
        Ok(VmView { metadata: meta, status })
    }

    /// remove_volume(name, vol_name): rejects when locked; removes the file
    /// and the metadata entry.
    pub async fn remove_volume(&self, name: &str, vol_name: &str) -> Result<VmView> {
        let guard = self.vm_lock(name);
        let _g = guard.lock().await;

        let mut meta = self.metadata.load(name)?;
        if meta.lock {
            return Err(VmError::VmLocked {
                name: name.to_string(),
            });
        }

        let pos = meta
            .extra_volumes
            .iter()
            .position(|v| v.name == vol_name)
            .ok_or_else(|| VmError::VolumeNotFound {
                vm: name.to_string(),
                name: vol_name.to_string(),
            })?;

        let vol = meta.extra_volumes.remove(pos);
        self.metadata.save(&meta)?;
        let _ = std::fs::remove_file(&vol.path);

        let status = self.query_status(name).await;
        Ok(VmView { metadata: meta, status })
    }

    /// get(name): loads metadata and overlays a freshly computed status.
    pub async fn get(&self, name: &str) -> Result<VmView> {
        let metadata = self.metadata.load(name)?;
        let status = self.query_status(name).await;
        Ok(VmView { metadata, status })
    }

    /// list(): same as `get` for every VM.
    pub async fn list(&self) -> Result<Vec<VmView>> {
        let all = self.metadata.list()?;
        let mut out = Vec::with_capacity(all.len());
        for metadata in all {
            let status = self.query_status(&metadata.name).await;
            out.push(VmView { metadata, status });
        }
        Ok(out)
    }

    /// get_by_mac(mac): linear search of `list()`.
    pub async fn get_by_mac(&self, mac: &str) -> Result<VmView> {
        self.list()
            .await?
            .into_iter()
            .find(|v| v.metadata.mac_address.eq_ignore_ascii_case(mac))
            .ok_or_else(|| VmError::VmNotFound {
                name: format!("mac:{mac}"),
            })
    }

    /// remove(name): rejects when locked. Stops the VM, cleans up the tap
    /// with bounded retry, removes the VM directory.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let guard = self.vm_lock(name);
        let _g = guard.lock().await;

        let meta = self.metadata.load(name)?;
        if meta.lock {
            return Err(VmError::VmLocked {
                name: name.to_string(),
            });
        }

        let status = self.query_status(name).await;
        if status != VmStatus::Stopped {
            let qmp_socket = self.qemu.qmp_socket(name);
            if let Ok(mut qmp) = QmpClient::connect(name, &qmp_socket).await {
                let powerdown = qmp.system_powerdown().await;
                if powerdown.is_err() {
                    let _ = qmp.quit().await;
                }
                qmp.close().await?;
            }
        }

        self.network.cleanup_vm_if(name).await?;

        for rule in self.forwarder.list(Some(name)) {
            self.forwarder.remove(&rule.id).await?;
        }

        self.metadata.purge_dir(name);
        self.vm_locks.remove(name);
        info!(vm = name, "vm removed");
        Ok(())
    }

    /// A long-lived consumer of the DHCP IP-update channel. For each
    /// `{mac, ip}`, resolves the owning VM, writes `ip_address`, and notifies
    /// the forwarder. Errors are logged and skipped, never terminate the
    /// loop (spec.md §4.8, §7).
    pub async fn ip_address_update_worker(&self, mut updates: mpsc::Receiver<IpUpdate>) {
        while let Some(update) = updates.recv().await {
            if let Err(e) = self.apply_ip_update(&update).await {
                warn!(mac = %update.mac, ip = %update.ip, error = %e, "failed to apply ip update");
            }
        }
    }

    async fn apply_ip_update(&self, update: &IpUpdate) -> Result<()> {
        let view = self.get_by_mac(&update.mac).await?;
        let guard = self.vm_lock(&view.metadata.name);
        let _g = guard.lock().await;

        let mut meta = self.metadata.load(&view.metadata.name)?;
        meta.ip_address = update.ip.to_string();
        self.metadata.save(&meta)?;

        self.forwarder.update_ip(&meta.name, update.ip).await?;
        Ok(())
    }

    /// QMP-derived status. Connection failure is `stopped`; any other QMP
    /// error after connecting is `unknown` (spec.md §7, §9).
    async fn query_status(&self, name: &str) -> VmStatus {
        let qmp_socket = self.qemu.qmp_socket(name);
        if !qmp_socket.exists() {
            return VmStatus::Stopped;
        }
        let mut qmp = match QmpClient::connect(name, &qmp_socket).await {
            Ok(c) => c,
            Err(_) => return VmStatus::Stopped,
        };
        match qmp.query_status().await {
            Ok(s) if s == "paused" => VmStatus::Paused,
            Ok(_) => VmStatus::Running,
            Err(_) => VmStatus::Unknown,
        }
    }
}

/// Allocate the lowest unused name from `extra-volume1..extra-volume256`
/// (spec.md §4.8; O(n^2) over the cap, acceptable per design note §9).
fn next_volume_name(existing: &[ExtraVolume]) -> Result<String> {
    for i in 1..=crate::types::MAX_EXTRA_VOLUMES {
        let candidate = format!("extra-volume{i}");
        if !existing.iter().any(|v| v.name == candidate) {
            return Ok(candidate);
        }
    }
    Err(VmError::MaxVolumesReached {
        name: String::new(),
        max: crate::types::MAX_EXTRA_VOLUMES,
    })
}

/// Generate a locally-administered MAC with vendor prefix `52:54:00` and 24
/// random bits (spec.md §3).
fn generate_mac() -> String {
    let mut tail = [0u8; 3];
    rand::thread_rng().fill_bytes(&mut tail);
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2]
    )
}

/// Generate an 8-byte URL-safe base64 VNC password (11 chars, no padding),
/// per spec.md §3 and the end-to-end scenario in §8.
fn generate_vnc_password() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExec;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            state_root: dir.to_path_buf(),
            agents: vec![],
            subnet_cidr: "192.168.100.0/24".into(),
            name_servers: vec!["8.8.8.8".into()],
            no_kvm: true,
            vnc_keyboard_layout: "en-us".into(),
        }
    }

    fn supervisor(dir: &std::path::Path) -> VmSupervisor<FakeExec> {
        let exec = FakeExec::new();
        let cfg = config(dir);
        let forwarder = Arc::new(Forwarder::new(exec.clone(), cfg.clone()));
        VmSupervisor::new(exec, cfg, forwarder)
    }

    #[test]
    fn mac_has_locally_administered_prefix() {
        let mac = generate_mac();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
    }

    #[test]
    fn vnc_password_is_eleven_chars() {
        let pw = generate_vnc_password();
        assert_eq!(pw.len(), 11);
    }

    #[test]
    fn next_volume_name_finds_lowest_free_slot() {
        let existing = vec![ExtraVolume {
            name: "extra-volume1".into(),
            path: "/tmp/x".into(),
            size: "5Gi".into(),
        }];
        assert_eq!(next_volume_name(&existing).unwrap(), "extra-volume2");
    }

    #[tokio::test]
    async fn create_fails_if_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());

        let vm_dir = sup.config.vm_dir("vm1");
        std::fs::create_dir_all(&vm_dir).unwrap();
        std::fs::write(vm_dir.join("metadata.json"), b"{}").unwrap();

        let err = sup
            .create(CreateParams {
                name: "vm1".into(),
                owner: "alice".into(),
                image: String::new(),
                arch: None,
                cpu: "2".into(),
                memory: "1Gi".into(),
                disk: "10Gi".into(),
                user_data: String::new(),
                tag: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::VmAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn create_rejects_invalid_name() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let err = sup
            .create(CreateParams {
                name: "bad name!".into(),
                owner: "alice".into(),
                image: String::new(),
                arch: None,
                cpu: "2".into(),
                memory: "1Gi".into(),
                disk: "10Gi".into(),
                user_data: String::new(),
                tag: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidName { .. }));
    }

    #[tokio::test]
    async fn remove_rejects_locked_vm() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let mut meta = VmMetadata {
            name: "vm1".into(),
            owner: "alice".into(),
            image: String::new(),
            arch: "x86_64".into(),
            volume: "/tmp/vm1.qcow2".into(),
            mac_address: "52:54:00:aa:bb:cc".into(),
            ip_address: String::new(),
            cpu: "2".into(),
            memory: "1Gi".into(),
            disk: "10Gi".into(),
            tag: String::new(),
            lock: true,
            vnc_password: "abcdefgh123".into(),
            vnc_port: String::new(),
            user_data: String::new(),
            cloud_init_iso: "/tmp/vm1.iso".into(),
            extra_volumes: vec![],
        };
        sup.metadata.save(&meta).unwrap();
        let err = sup.remove("vm1").await.unwrap_err();
        assert!(matches!(err, VmError::VmLocked { .. }));

        meta.lock = false;
        sup.metadata.save(&meta).unwrap();
        sup.remove("vm1").await.unwrap();
    }

    #[tokio::test]
    async fn get_by_mac_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let err = sup.get_by_mac("00:00:00:00:00:00").await.unwrap_err();
        assert!(matches!(err, VmError::VmNotFound { .. }));
    }
}
