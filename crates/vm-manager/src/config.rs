use std::path::PathBuf;

use ipnetwork::Ipv4Network;

use crate::error::{Result, VmError};

/// Process-wide configuration, read once at startup from the environment
/// (spec.md §6). Missing variables default to empty, mirroring the source's
/// "missing = empty" policy rather than failing fast; individual operations
/// that need a value validate it at point of use.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_root: PathBuf,
    pub agents: Vec<String>,
    pub subnet_cidr: String,
    pub name_servers: Vec<String>,
    pub no_kvm: bool,
    pub vnc_keyboard_layout: String,
}

impl Config {
    /// Load configuration from `VMM_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            state_root: state_root_from_env(),
            agents: split_csv(&env_or_empty("VMM_AGENTS")),
            subnet_cidr: env_or_empty("VMM_SUBNET_CIDR"),
            name_servers: split_csv(&env_or_empty("VMM_NAME_SERVERS")),
            no_kvm: env_flag("VMM_NO_KVM"),
            vnc_keyboard_layout: {
                let v = env_or_empty("VMM_VNC_KEYBOARD_LAYOUT");
                if v.is_empty() { "en-us".to_string() } else { v }
            },
        }
    }

    pub fn vms_dir(&self) -> PathBuf {
        self.state_root.join("vms")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.state_root.join("images")
    }

    pub fn forwards_dir(&self) -> PathBuf {
        self.state_root.join("forwards")
    }

    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.vms_dir().join(name)
    }

    /// Parse `subnet_cidr` into a usable network, surfacing an `Invalid` error.
    pub fn subnet(&self) -> Result<Ipv4Network> {
        self.subnet_cidr
            .parse::<Ipv4Network>()
            .map_err(|e| VmError::InvalidCidr {
                value: self.subnet_cidr.clone(),
                reason: e.to_string(),
            })
    }
}

/// `VMM_DIR` with a `dirs::data_dir()`-derived fallback, following the
/// teacher's image-cache fallback pattern.
fn state_root_from_env() -> PathBuf {
    match std::env::var("VMM_DIR") {
        Ok(v) if !v.is_empty() => PathBuf::from(v),
        _ => dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("vmm"),
    }
}

fn env_or_empty(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

fn env_flag(key: &str) -> bool {
    matches!(env_or_empty(key).as_str(), "1" | "true" | "yes")
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
