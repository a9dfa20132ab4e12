use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, VmError};
use crate::exec::Exec;
use crate::types::{ForwardRule, Protocol};

/// NAT/proxy table exposing guest ports on host-reachable endpoints
/// (spec.md §4.5). Rules are persisted as one JSON file per rule under
/// `<state-root>/forwards/<vm-name>/<id>.json`; the dataplane is realized via
/// host `iptables` NAT, following the pattern in
/// `6d81a979_saltyskip-cthulu`'s `setup_nat`.
pub struct Forwarder<E: Exec> {
    exec: E,
    config: Config,
    rules: RwLock<HashMap<String, ForwardRule>>,
}

impl<E: Exec> Forwarder<E> {
    pub fn new(exec: E, config: Config) -> Self {
        Self {
            exec,
            config,
            rules: RwLock::new(HashMap::new()),
        }
    }

    fn rule_path(&self, vm_name: &str, id: &str) -> std::path::PathBuf {
        self.config
            .forwards_dir()
            .join(vm_name)
            .join(format!("{id}.json"))
    }

    /// Load all persisted rules into memory and reconcile them to the
    /// dataplane. Rules whose VM directory no longer exists are dropped
    /// (spec.md §4.5).
    pub async fn reconcile_on_startup(&self, known_vms: &[String]) -> Result<()> {
        let dir = self.config.forwards_dir();
        if !dir.exists() {
            return Ok(());
        }
        let known: std::collections::HashSet<&str> = known_vms.iter().map(String::as_str).collect();

        let mut loaded = Vec::new();
        for vm_entry in std::fs::read_dir(&dir).map_err(|e| VmError::io("read forwards dir", e))? {
            let vm_entry = vm_entry.map_err(|e| VmError::io("read forwards dir entry", e))?;
            if !vm_entry.path().is_dir() {
                continue;
            }
            let vm_name = vm_entry.file_name().to_string_lossy().into_owned();
            if !known.contains(vm_name.as_str()) {
                warn!(vm = %vm_name, "dropping stale forwarder rules for removed vm");
                let _ = std::fs::remove_dir_all(vm_entry.path());
                continue;
            }
            for rule_entry in
                std::fs::read_dir(vm_entry.path()).map_err(|e| VmError::io("read vm forwards dir", e))?
            {
                let rule_entry = rule_entry.map_err(|e| VmError::io("read rule file entry", e))?;
                let path = rule_entry.path();
                match std::fs::read(&path)
                    .map_err(|e| VmError::io(format!("read {}", path.display()), e))
                    .and_then(|bytes| {
                        serde_json::from_slice::<ForwardRule>(&bytes)
                            .map_err(|e| VmError::json("parse forward rule", e))
                    }) {
                    Ok(rule) => loaded.push(rule),
                    Err(e) => warn!(error = %e, "skipping unreadable forwarder rule"),
                }
            }
        }

        for rule in &loaded {
            self.install_dataplane(rule).await;
        }

        let mut guard = self.rules.write().unwrap();
        for rule in loaded {
            guard.insert(rule.id.clone(), rule);
        }
        Ok(())
    }

    /// Persist a new rule, resolve `guest_ip` from current metadata, and
    /// install the dataplane. Fails if the listen triple is already bound.
    pub async fn add(
        &self,
        vm_name: &str,
        proto: Protocol,
        listen_host: &str,
        listen_port: u16,
        guest_port: u16,
        guest_ip: &str,
    ) -> Result<ForwardRule> {
        {
            let guard = self.rules.read().unwrap();
            if guard.values().any(|r| {
                r.proto == proto && r.listen_host == listen_host && r.listen_port == listen_port
            }) {
                return Err(VmError::ListenBound {
                    proto: proto.to_string(),
                    host: listen_host.to_string(),
                    port: listen_port,
                });
            }
        }

        let rule = ForwardRule {
            id: Uuid::new_v4().to_string(),
            vm_name: vm_name.to_string(),
            proto,
            listen_host: listen_host.to_string(),
            listen_port,
            guest_port,
            guest_ip: guest_ip.to_string(),
        };

        self.persist(&rule)?;
        self.install_dataplane(&rule).await;
        self.rules
            .write()
            .unwrap()
            .insert(rule.id.clone(), rule.clone());

        info!(vm = vm_name, id = %rule.id, listen_port, guest_port, "forwarder rule added");
        Ok(rule)
    }

    /// Idempotent: remove the persisted rule and its dataplane state.
    pub async fn remove(&self, rule_id: &str) -> Result<()> {
        let rule = self.rules.write().unwrap().remove(rule_id);
        let Some(rule) = rule else {
            return Ok(());
        };

        self.uninstall_dataplane(&rule).await;
        let path = self.rule_path(&rule.vm_name, &rule.id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(VmError::io(format!("remove {}", path.display()), e)),
        }
        Ok(())
    }

    pub fn list(&self, vm_name: Option<&str>) -> Vec<ForwardRule> {
        let guard = self.rules.read().unwrap();
        let mut out: Vec<ForwardRule> = guard
            .values()
            .filter(|r| vm_name.is_none_or(|v| r.vm_name == v))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Rewrite every rule for `vm_name` to target `new_ip`, called whenever
    /// DHCP learns a new address (spec.md §4.5, §4.8).
    pub async fn update_ip(&self, vm_name: &str, new_ip: Ipv4Addr) -> Result<()> {
        let ids: Vec<String> = {
            let guard = self.rules.read().unwrap();
            guard
                .values()
                .filter(|r| r.vm_name == vm_name)
                .map(|r| r.id.clone())
                .collect()
        };

        for id in ids {
            let updated = {
                let mut guard = self.rules.write().unwrap();
                match guard.get_mut(&id) {
                    Some(rule) => {
                        rule.guest_ip = new_ip.to_string();
                        rule.clone()
                    }
                    None => continue,
                }
            };
            self.persist(&updated)?;
            self.install_dataplane(&updated).await;
        }
        Ok(())
    }

    fn persist(&self, rule: &ForwardRule) -> Result<()> {
        let path = self.rule_path(&rule.vm_name, &rule.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VmError::io("create forwards dir", e))?;
        }
        let payload = serde_json::to_vec_pretty(rule)
            .map_err(|e| VmError::json("serialize forward rule", e))?;
        std::fs::write(&path, payload).map_err(|e| VmError::io(format!("write {}", path.display()), e))
    }

    async fn install_dataplane(&self, rule: &ForwardRule) {
        let proto = rule.proto.to_string();
        let listen_port = rule.listen_port.to_string();
        let dest = format!("{}:{}", rule.guest_ip, rule.guest_port);
        self.exec
            .run_ignore_errors(
                "iptables",
                &[
                    "-t",
                    "nat",
                    "-D",
                    "PREROUTING",
                    "-p",
                    &proto,
                    "--dport",
                    &listen_port,
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &dest,
                ],
            )
            .await;
        let out = self
            .exec
            .run(
                "iptables",
                &[
                    "-t",
                    "nat",
                    "-A",
                    "PREROUTING",
                    "-p",
                    &proto,
                    "--dport",
                    &listen_port,
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &dest,
                ],
            )
            .await;
        if let Err(e) = out {
            warn!(rule = %rule.id, error = %e, "failed to install forwarder dataplane rule");
        }
    }

    async fn uninstall_dataplane(&self, rule: &ForwardRule) {
        let proto = rule.proto.to_string();
        let listen_port = rule.listen_port.to_string();
        let dest = format!("{}:{}", rule.guest_ip, rule.guest_port);
        self.exec
            .run_ignore_errors(
                "iptables",
                &[
                    "-t",
                    "nat",
                    "-D",
                    "PREROUTING",
                    "-p",
                    &proto,
                    "--dport",
                    &listen_port,
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &dest,
                ],
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExec;

    fn forwarder() -> (tempfile::TempDir, Forwarder<FakeExec>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            state_root: dir.path().to_path_buf(),
            agents: vec![],
            subnet_cidr: String::new(),
            name_servers: vec![],
            no_kvm: false,
            vnc_keyboard_layout: "en-us".into(),
        };
        (dir, Forwarder::new(FakeExec::new(), config))
    }

    #[tokio::test]
    async fn add_then_list_returns_rule() {
        let (_dir, fwd) = forwarder();
        let rule = fwd
            .add("vm1", Protocol::Tcp, "0.0.0.0", 8080, 80, "192.168.100.1")
            .await
            .unwrap();
        let rules = fwd.list(Some("vm1"));
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, rule.id);
    }

    #[tokio::test]
    async fn add_rejects_duplicate_listen_triple() {
        let (_dir, fwd) = forwarder();
        fwd.add("vm1", Protocol::Tcp, "0.0.0.0", 8080, 80, "192.168.100.1")
            .await
            .unwrap();
        let err = fwd
            .add("vm2", Protocol::Tcp, "0.0.0.0", 8080, 81, "192.168.100.2")
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::ListenBound { .. }));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (_dir, fwd) = forwarder();
        let rule = fwd
            .add("vm1", Protocol::Tcp, "0.0.0.0", 8080, 80, "192.168.100.1")
            .await
            .unwrap();
        fwd.remove(&rule.id).await.unwrap();
        fwd.remove(&rule.id).await.unwrap();
        assert!(fwd.list(None).is_empty());
    }

    #[tokio::test]
    async fn update_ip_rewrites_all_rules_for_vm() {
        let (_dir, fwd) = forwarder();
        fwd.add("vm1", Protocol::Tcp, "0.0.0.0", 8080, 80, "192.168.100.1")
            .await
            .unwrap();
        fwd.add("vm1", Protocol::Udp, "0.0.0.0", 8081, 81, "192.168.100.1")
            .await
            .unwrap();
        fwd.update_ip("vm1", "192.168.100.42".parse().unwrap())
            .await
            .unwrap();
        for rule in fwd.list(Some("vm1")) {
            assert_eq!(rule.guest_ip, "192.168.100.42");
        }
    }
}
