use clap::Args;
use miette::{IntoDiagnostic, Result};

use super::context;
use super::print_vm_view;

#[derive(Args)]
pub struct LockArgs {
    /// VM name
    name: String,
}

#[derive(Args)]
pub struct UnlockArgs {
    /// VM name
    name: String,
}

pub async fn run_lock(args: LockArgs) -> Result<()> {
    let supervisor = context::supervisor().await?;
    let view = supervisor.lock(&args.name).await.into_diagnostic()?;
    print_vm_view(&view);
    Ok(())
}

pub async fn run_unlock(args: UnlockArgs) -> Result<()> {
    let supervisor = context::supervisor().await?;
    let view = supervisor.unlock(&args.name).await.into_diagnostic()?;
    print_vm_view(&view);
    Ok(())
}
