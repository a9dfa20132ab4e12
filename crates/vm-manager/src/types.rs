use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Maximum number of extra volumes a single VM may carry (spec.md §3: `extra-volume1..256`).
pub const MAX_EXTRA_VOLUMES: usize = 256;

/// Persisted VM metadata (spec.md §3). Deliberately excludes `status`: status
/// is runtime-derived and never written to disk (see SPEC_FULL.md §1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMetadata {
    pub name: String,
    pub owner: String,
    pub image: String,
    #[serde(default = "default_arch")]
    pub arch: String,
    pub volume: PathBuf,
    pub mac_address: String,
    #[serde(default)]
    pub ip_address: String,
    pub cpu: String,
    pub memory: String,
    pub disk: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub lock: bool,
    pub vnc_password: String,
    #[serde(default)]
    pub vnc_port: String,
    pub user_data: String,
    pub cloud_init_iso: PathBuf,
    #[serde(default)]
    pub extra_volumes: Vec<ExtraVolume>,
}

fn default_arch() -> String {
    std::env::consts::ARCH.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtraVolume {
    pub name: String,
    pub path: PathBuf,
    pub size: String,
}

/// Runtime status, never persisted — always freshly derived (spec.md §3, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Paused => "paused",
            VmStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A `VmMetadata` plus its freshly-computed status — what `get`/`list` return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmView {
    #[serde(flatten)]
    pub metadata: VmMetadata,
    pub status: VmStatus,
}

/// Forwarder rule (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRule {
    pub id: String,
    pub vm_name: String,
    pub proto: Protocol,
    pub listen_host: String,
    pub listen_port: u16,
    pub guest_port: u16,
    pub guest_ip: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// In-memory DHCP lease (spec.md §3).
#[derive(Debug, Clone)]
pub struct Lease {
    pub ip: std::net::Ipv4Addr,
    pub expiry: std::time::SystemTime,
}

/// An observed MAC/IP pair flowing from the DHCP responder to the supervisor
/// (spec.md §4.4, §4.8).
#[derive(Debug, Clone)]
pub struct IpUpdate {
    pub mac: String,
    pub ip: std::net::Ipv4Addr,
}

/// Parameters accepted by `VmSupervisor::create` (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub name: String,
    pub owner: String,
    pub image: String,
    pub arch: Option<String>,
    pub cpu: String,
    pub memory: String,
    pub disk: String,
    pub user_data: String,
    pub tag: String,
}

/// Parameters accepted by `VmSupervisor::resize`. Empty fields are no-ops (spec.md §4.8).
#[derive(Debug, Clone, Default)]
pub struct ResizeParams {
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub disk: Option<String>,
}
