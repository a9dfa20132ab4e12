use clap::Args;
use miette::{IntoDiagnostic, Result};

use super::context;
use super::print_vm_view;

#[derive(Args)]
pub struct GetArgs {
    /// VM name
    name: String,
}

#[derive(Args)]
pub struct GetByMacArgs {
    /// MAC address, e.g. `52:54:00:aa:bb:cc`
    mac: String,
}

pub async fn run_get(args: GetArgs) -> Result<()> {
    let supervisor = context::supervisor().await?;
    let view = supervisor.get(&args.name).await.into_diagnostic()?;
    print_vm_view(&view);
    Ok(())
}

pub async fn run_get_by_mac(args: GetByMacArgs) -> Result<()> {
    let supervisor = context::supervisor().await?;
    let view = supervisor.get_by_mac(&args.mac).await.into_diagnostic()?;
    print_vm_view(&view);
    Ok(())
}
