use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Error taxonomy for the VM manager core.
///
/// Each variant maps to one of the five response classes external callers
/// (the HTTP layer, the CLI) translate into: NotFound, Conflict, Invalid,
/// Upstream, Timeout.
#[derive(Error, Diagnostic, Debug)]
pub enum VmError {
    #[error("vm '{name}' not found")]
    #[diagnostic(code(vmm::not_found::vm))]
    VmNotFound { name: String },

    #[error("image '{name}' not found")]
    #[diagnostic(code(vmm::not_found::image))]
    ImageNotFound { name: String },

    #[error("forwarder rule '{id}' not found")]
    #[diagnostic(code(vmm::not_found::rule))]
    RuleNotFound { id: String },

    #[error("extra volume '{name}' not found on vm '{vm}'")]
    #[diagnostic(code(vmm::not_found::volume))]
    VolumeNotFound { vm: String, name: String },

    #[error("vm '{name}' already exists")]
    #[diagnostic(code(vmm::conflict::vm_exists))]
    VmAlreadyExists { name: String },

    #[error("vm '{name}' is locked")]
    #[diagnostic(code(vmm::conflict::locked))]
    VmLocked { name: String },

    #[error("vm '{name}' is {state}, expected {expected}")]
    #[diagnostic(code(vmm::conflict::wrong_state))]
    WrongState {
        name: String,
        state: String,
        expected: String,
    },

    #[error("listen endpoint {host}:{port}/{proto} is already bound")]
    #[diagnostic(code(vmm::conflict::listen_bound))]
    ListenBound {
        proto: String,
        host: String,
        port: u16,
    },

    #[error("vm '{name}' has reached the maximum of {max} extra volumes")]
    #[diagnostic(code(vmm::conflict::max_volumes))]
    MaxVolumesReached { name: String, max: usize },

    #[error("invalid vm name '{name}': {reason}")]
    #[diagnostic(code(vmm::invalid::name))]
    InvalidName { name: String, reason: String },

    #[error("invalid size '{value}': {reason}")]
    #[diagnostic(code(vmm::invalid::size))]
    InvalidSize { value: String, reason: String },

    #[error("invalid CIDR '{value}': {reason}")]
    #[diagnostic(code(vmm::invalid::cidr))]
    InvalidCidr { value: String, reason: String },

    #[error("invalid configuration: {0}")]
    #[diagnostic(code(vmm::invalid::config))]
    InvalidConfig(String),

    #[error("{context}: {source}")]
    #[diagnostic(code(vmm::upstream::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    #[diagnostic(code(vmm::upstream::json))]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("command '{command}' failed (exit {code:?}): {stderr}")]
    #[diagnostic(code(vmm::upstream::exec))]
    ExecFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to spawn '{command}': {source}")]
    #[diagnostic(code(vmm::upstream::spawn))]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("QMP error on '{vm}': {detail}")]
    #[diagnostic(code(vmm::upstream::qmp))]
    Qmp { vm: String, detail: String },

    #[error("{0}")]
    #[diagnostic(code(vmm::upstream::other))]
    Upstream(String),

    #[error("QMP command '{command}' on '{vm}' timed out after {deadline_secs}s")]
    #[diagnostic(code(vmm::timeout::qmp))]
    QmpTimeout {
        vm: String,
        command: String,
        deadline_secs: u64,
    },

    #[error("tap cleanup for '{name}' did not complete after {attempts} attempts")]
    #[diagnostic(code(vmm::timeout::tap_cleanup))]
    TapCleanupTimeout { name: String, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, VmError>;

impl VmError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        VmError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        VmError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Validate a VM name against spec.md §3: path-safe, 1-64 chars.
pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(VmError::InvalidName {
            name: name.to_string(),
            reason: "must be 1-64 characters".into(),
        });
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !ok {
        return Err(VmError::InvalidName {
            name: name.to_string(),
            reason: "must contain only alphanumerics, '-' and '_'".into(),
        });
    }
    Ok(())
}

/// Helper: build an absolute path error context string with a file name.
pub fn io_ctx(action: &str, path: &PathBuf) -> String {
    format!("{action} {}", path.display())
}
