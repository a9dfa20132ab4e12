//! End-to-end lifecycle coverage across modules: create, a simulated DHCP
//! lease, forwarder reconciliation, volumes, locking, stop, and remove — all
//! against `FakeExec`, so no real `ip`/`qemu-img`/`qemu-system-*` is ever
//! invoked. The one piece `Exec` doesn't cover is QMP itself (a real Unix
//! socket), so a tiny stub server stands in for QEMU's control socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use vm_manager::dhcp::LeaseTable;
use vm_manager::exec::fake::FakeExec;
use vm_manager::forwarder::Forwarder;
use vm_manager::{Config, CreateParams, IpUpdate, Protocol, VmError, VmStatus, VmSupervisor};

fn test_config(state_root: PathBuf) -> Config {
    Config {
        state_root,
        agents: vec![],
        subnet_cidr: "192.168.100.0/24".into(),
        name_servers: vec!["8.8.8.8".into()],
        no_kvm: true,
        vnc_keyboard_layout: "en-us".into(),
    }
}

async fn handle_qmp_conn(mut stream: UnixStream) {
    let _ = stream.write_all(b"{\"QMP\": {\"version\": {}}}\n").await;
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        let reply: &[u8] = if text.contains("query-vnc") {
            b"{\"return\": {\"enabled\": true, \"service\": \"5901\"}}\n"
        } else if text.contains("query-status") {
            b"{\"return\": {\"status\": \"running\"}}\n"
        } else {
            b"{\"return\": {}}\n"
        };
        if stream.write_all(reply).await.is_err() {
            break;
        }
    }
}

/// Stands in for QEMU's `-qmp unix:...,server,nowait` socket. Binds only
/// after a delay so the supervisor's pre-launch status probe still sees no
/// socket at all (a VM that has never started), matching `query_status`'s
/// `!qmp_socket.exists()` fast path in supervisor.rs.
async fn spawn_qmp_stub(path: PathBuf) {
    tokio::time::sleep(Duration::from_millis(120)).await;
    let listener = UnixListener::bind(&path).unwrap();
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_qmp_conn(stream));
            }
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn full_lifecycle_create_dhcp_forward_volume_lock_stop_remove() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path().to_path_buf());
    let vm_name = "vm1";

    std::fs::create_dir_all(config.vm_dir(vm_name)).unwrap();
    let qmp_path = config.vm_dir(vm_name).join("qmp.socket");
    tokio::spawn(spawn_qmp_stub(qmp_path));

    let exec = FakeExec::new();
    let forwarder = Arc::new(Forwarder::new(exec.clone(), config.clone()));
    let supervisor = VmSupervisor::new(exec.clone(), config.clone(), forwarder.clone());

    // create → starts the VM as part of the same call.
    let created = supervisor
        .create(CreateParams {
            name: vm_name.to_string(),
            owner: "alice".into(),
            image: String::new(),
            arch: Some("x86_64".into()),
            cpu: "2".into(),
            memory: "1Gi".into(),
            disk: "10Gi".into(),
            user_data: "#cloud-config\n".into(),
            tag: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(created.status, VmStatus::Running);
    assert!(!created.metadata.vnc_port.is_empty(), "vnc_port set at start");

    // A forward rule exists before the guest has an address yet.
    forwarder
        .add(vm_name, Protocol::Tcp, "0.0.0.0", 2222, 22, "")
        .await
        .unwrap();

    // DHCP lease → IpUpdate → supervisor worker → forwarder.
    let leases = LeaseTable::with_default_ttl(config.subnet().unwrap());
    let leased_ip = leases.allocate(&created.metadata.mac_address).unwrap();

    let (tx, rx) = mpsc::channel(1);
    tx.send(IpUpdate {
        mac: created.metadata.mac_address.clone(),
        ip: leased_ip,
    })
    .await
    .unwrap();
    drop(tx);
    supervisor.ip_address_update_worker(rx).await;

    let after_dhcp = supervisor.get(vm_name).await.unwrap();
    assert_eq!(after_dhcp.metadata.ip_address, leased_ip.to_string());
    let rules = forwarder.list(Some(vm_name));
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].guest_ip, leased_ip.to_string());

    // A stale rule for a VM that no longer exists, to exercise reconcile's
    // pruning. A fresh Forwarder mimics a process restart: empty in-memory
    // state, rules loaded from disk only.
    forwarder
        .add("ghost", Protocol::Tcp, "0.0.0.0", 3333, 80, "10.0.0.9")
        .await
        .unwrap();
    let reconciler = Forwarder::new(exec.clone(), config.clone());
    reconciler
        .reconcile_on_startup(&[vm_name.to_string()])
        .await
        .unwrap();
    assert_eq!(reconciler.list(Some(vm_name)).len(), 1);
    assert!(reconciler.list(Some("ghost")).is_empty());
    assert!(!config.forwards_dir().join("ghost").exists());

    // add_volume
    let with_volume = supervisor.add_volume(vm_name, "5Gi").await.unwrap();
    assert_eq!(with_volume.metadata.extra_volumes.len(), 1);
    assert_eq!(with_volume.metadata.extra_volumes[0].name, "extra-volume1");

    // lock → stop (stop doesn't consult the lock) → remove rejected → unlock → remove.
    supervisor.lock(vm_name).await.unwrap();

    let stopped = supervisor.stop(vm_name).await.unwrap();
    assert_eq!(stopped.status, VmStatus::Stopped);
    assert!(stopped.metadata.vnc_port.is_empty(), "vnc_port cleared at stop");

    let locked_err = supervisor.remove(vm_name).await.unwrap_err();
    assert!(matches!(locked_err, VmError::VmLocked { .. }));

    supervisor.unlock(vm_name).await.unwrap();
    supervisor.remove(vm_name).await.unwrap();

    let gone = supervisor.get(vm_name).await.unwrap_err();
    assert!(matches!(gone, VmError::VmNotFound { .. }));
    assert!(forwarder.list(Some(vm_name)).is_empty());
    assert!(!config.vm_dir(vm_name).exists());
}
