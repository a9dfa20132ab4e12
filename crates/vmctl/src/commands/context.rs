//! Wiring shared by every subcommand: build a `VmSupervisor<SystemExec>` over
//! the on-disk config, reconciling the forwarder's dataplane against the
//! VMs currently on record before handing back control.

use std::sync::Arc;

use miette::{IntoDiagnostic, Result};
use vm_manager::{Config, SystemExec, VmSupervisor};
use vm_manager::forwarder::Forwarder;
use vm_manager::metadata::MetadataStore;

pub async fn supervisor() -> Result<VmSupervisor<SystemExec>> {
    let config = Config::from_env();
    let exec = SystemExec;

    let forwarder = Arc::new(Forwarder::new(exec, config.clone()));
    let known_vms = MetadataStore::new(config.clone())
        .list()
        .into_diagnostic()?
        .into_iter()
        .map(|meta| meta.name)
        .collect::<Vec<_>>();
    forwarder
        .reconcile_on_startup(&known_vms)
        .await
        .into_diagnostic()?;

    Ok(VmSupervisor::new(exec, config, forwarder))
}
