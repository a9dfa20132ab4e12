use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;

use ipnetwork::Ipv4Network;
use tracing::info;

use crate::config::Config;
use crate::error::{Result, VmError};
use crate::exec::Exec;

const NETNS: &str = "minivmm";
const VETH_HOST: &str = "minivmm";
const VETH_PEER: &str = "minivmm-peer";
const BRIDGE: &str = "br-minivmm";

const IFUP_SCRIPT: &str = "/tmp/ifup";
const IFDOWN_SCRIPT: &str = "/tmp/ifdown";

/// Owns the dedicated network namespace, the bridge within it, and the
/// veth pair joining host and namespace (spec.md §4.2).
pub struct NetworkSubstrate<E: Exec> {
    exec: E,
    config: Config,
}

impl<E: Exec> NetworkSubstrate<E> {
    pub fn new(exec: E, config: Config) -> Self {
        Self { exec, config }
    }

    pub fn tap_name(name: &str) -> String {
        format!("tap-{name}")
    }

    /// Idempotent: create namespace, veth pair, move peer in, create bridge,
    /// enslave peer. Every step tolerates "already exists" failures.
    pub async fn init_netns(&self) -> Result<()> {
        self.exec
            .run_ignore_errors("ip", &["netns", "add", NETNS])
            .await;
        self.exec
            .run_ignore_errors(
                "ip",
                &["link", "add", VETH_HOST, "type", "veth", "peer", "name", VETH_PEER],
            )
            .await;
        self.exec
            .run_ignore_errors("ip", &["link", "set", VETH_PEER, "netns", NETNS])
            .await;
        self.exec
            .run_ignore_errors(
                "ip",
                &["netns", "exec", NETNS, "ip", "link", "add", BRIDGE, "type", "bridge"],
            )
            .await;
        self.exec
            .run_ignore_errors(
                "ip",
                &["netns", "exec", NETNS, "ip", "link", "set", VETH_PEER, "master", BRIDGE],
            )
            .await;
        Ok(())
    }

    /// Bring links up and address the host-side veth. Idempotent steps
    /// (link up, promiscuous) tolerate errors; address/route assignment is
    /// strict, first-error-wins, per the split resolved in spec.md §9.
    pub async fn start_network(&self) -> Result<()> {
        self.exec
            .run_ignore_errors("ip", &["link", "set", VETH_HOST, "up"])
            .await;
        self.exec
            .run_ignore_errors(
                "ip",
                &["netns", "exec", NETNS, "ip", "link", "set", VETH_PEER, "up"],
            )
            .await;
        self.exec
            .run_ignore_errors(
                "ip",
                &["netns", "exec", NETNS, "ip", "link", "set", BRIDGE, "up"],
            )
            .await;
        self.exec
            .run_ignore_errors(
                "ip",
                &["netns", "exec", NETNS, "ip", "link", "set", VETH_PEER, "promisc", "on"],
            )
            .await;

        let subnet = self.config.subnet()?;
        let gateway = last_host_address(subnet)?;
        let gateway_cidr = format!("{gateway}/{}", subnet.prefix());

        self.exec
            .run("ip", &["addr", "add", &gateway_cidr, "dev", VETH_HOST])
            .await?
            .check(format!("ip addr add {gateway_cidr} dev {VETH_HOST}"))?;

        let subnet_str = subnet.to_string();
        self.exec
            .run(
                "ip",
                &["route", "replace", &subnet_str, "dev", VETH_HOST],
            )
            .await?
            .check(format!("ip route replace {subnet_str} dev {VETH_HOST}"))?;

        info!(gateway = %gateway, subnet = %subnet_str, "network substrate up");
        Ok(())
    }

    /// Reverse of `init_netns`. Non-fatal on partial/absent state.
    pub async fn reset_netns(&self) -> Result<()> {
        self.exec
            .run_ignore_errors("ip", &["link", "del", VETH_HOST])
            .await;
        self.exec
            .run_ignore_errors("ip", &["netns", "del", NETNS])
            .await;
        Ok(())
    }

    /// Create a tap device in the root namespace; QEMU's ifup script moves it
    /// into `minivmm` and enslaves it to the bridge.
    pub async fn prepare_vm_if(&self, name: &str) -> Result<()> {
        let tap = Self::tap_name(name);
        write_hook_scripts()?;
        self.exec
            .run(
                "ip",
                &["tuntap", "add", "dev", &tap, "mode", "tap"],
            )
            .await?
            .check(format!("ip tuntap add dev {tap}"))?;
        Ok(())
    }

    /// Delete the tap. The ifup hook moves it into `minivmm` on bring-up, so
    /// a running VM's tap lives there, not in the root namespace; try both,
    /// since a VM that never finished starting may still have it in root.
    /// QEMU may hold a reference briefly after shutdown, so retry up to 30
    /// times at 3s intervals before failing (spec.md §4.2).
    pub async fn cleanup_vm_if(&self, name: &str) -> Result<()> {
        let tap = Self::tap_name(name);
        const ATTEMPTS: u32 = 30;
        for attempt in 1..=ATTEMPTS {
            let in_netns = self
                .exec
                .run("ip", &["netns", "exec", NETNS, "ip", "link", "del", &tap])
                .await;
            if matches!(in_netns, Ok(out) if out.success()) {
                return Ok(());
            }

            let in_root = self.exec.run("ip", &["link", "del", &tap]).await;
            if matches!(in_root, Ok(out) if out.success()) {
                return Ok(());
            }

            if attempt == ATTEMPTS {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        }
        Err(VmError::TapCleanupTimeout {
            name: name.to_string(),
            attempts: ATTEMPTS,
        })
    }
}

/// Materialize the ifup/ifdown scripts QEMU invokes on tap up/down, mode 0755
/// (spec.md §4.2).
fn write_hook_scripts() -> Result<()> {
    let ifup = format!(
        "#!/bin/sh\nip link set \"$1\" netns {NETNS}\nip netns exec {NETNS} ip link set \"$1\" master {BRIDGE}\nip netns exec {NETNS} ip link set \"$1\" up\n"
    );
    let ifdown = "#!/bin/sh\ntrue\n".to_string();

    write_executable(IFUP_SCRIPT, &ifup)?;
    write_executable(IFDOWN_SCRIPT, &ifdown)?;
    Ok(())
}

fn write_executable(path: &str, contents: &str) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| VmError::io(format!("write {path}"), e))?;
    let mut perms = std::fs::metadata(path)
        .map_err(|e| VmError::io(format!("stat {path}"), e))?
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).map_err(|e| VmError::io(format!("chmod {path}"), e))
}

/// The last usable host address of a CIDR (used as the gateway), per
/// spec.md §4.2.
fn last_host_address(net: Ipv4Network) -> Result<Ipv4Addr> {
    let broadcast = net.broadcast();
    let last = u32::from(broadcast).wrapping_sub(1);
    if last <= u32::from(net.network()) {
        return Err(VmError::InvalidCidr {
            value: net.to_string(),
            reason: "subnet too small to hold a gateway address".into(),
        });
    }
    Ok(Ipv4Addr::from(last))
}

/// The first usable host address, i.e. the start of the DHCP-leasable range
/// (spec.md §4.4).
pub fn first_host_address(net: Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(net.network()) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExec;

    fn config(cidr: &str) -> Config {
        Config {
            state_root: "/tmp".into(),
            agents: vec![],
            subnet_cidr: cidr.to_string(),
            name_servers: vec![],
            no_kvm: false,
            vnc_keyboard_layout: "en-us".into(),
        }
    }

    #[test]
    fn gateway_is_last_host_address() {
        let net: Ipv4Network = "192.168.100.0/24".parse().unwrap();
        assert_eq!(last_host_address(net).unwrap(), "192.168.100.254".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn first_address_is_network_plus_one() {
        let net: Ipv4Network = "192.168.100.0/24".parse().unwrap();
        assert_eq!(first_host_address(net), "192.168.100.1".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn init_netns_only_makes_ignore_errors_calls() {
        let exec = FakeExec::new();
        let substrate = NetworkSubstrate::new(exec.clone(), config("192.168.100.0/24"));
        substrate.init_netns().await.unwrap();
        assert!(!exec.calls().is_empty());
    }

    #[tokio::test]
    async fn start_network_propagates_strict_failure() {
        let exec = FakeExec::new();
        exec.set_response(
            "ip",
            crate::exec::CmdOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "RTNETLINK answers: File exists".into(),
            },
        );
        let substrate = NetworkSubstrate::new(exec, config("192.168.100.0/24"));
        let err = substrate.start_network().await.unwrap_err();
        assert!(matches!(err, VmError::ExecFailed { .. }));
    }

    #[tokio::test]
    async fn cleanup_vm_if_retries_then_succeeds() {
        let exec = FakeExec::new();
        let substrate = NetworkSubstrate::new(exec, config("192.168.100.0/24"));
        substrate.cleanup_vm_if("vm1").await.unwrap();
    }
}
