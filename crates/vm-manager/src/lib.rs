//! Lightweight multi-tenant QEMU/KVM VM manager: lifecycle engine and
//! host-networking substrate.
//!
//! The supervisor (`supervisor::VmSupervisor`) is the sole writer of VM
//! metadata and composes the image store, network substrate, QMP client,
//! and forwarder. The DHCP responder feeds IP updates into the supervisor
//! over an unbuffered channel; the forwarder tracks those updates in its
//! NAT/proxy table.

pub mod cloudinit;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod exec;
pub mod forwarder;
pub mod image;
pub mod lock;
pub mod metadata;
pub mod network;
pub mod qemu;
pub mod qmp;
pub mod supervisor;
pub mod types;

pub use config::Config;
pub use error::{Result, VmError};
pub use exec::{Exec, SystemExec};
pub use supervisor::VmSupervisor;
pub use types::{
    CreateParams, ExtraVolume, ForwardRule, IpUpdate, Protocol, ResizeParams, VmMetadata,
    VmStatus, VmView,
};
