use clap::Args;
use miette::{IntoDiagnostic, Result};

use super::context;
use super::print_vm_view;

#[derive(Args)]
pub struct StopArgs {
    /// VM name
    name: String,
}

pub async fn run(args: StopArgs) -> Result<()> {
    let supervisor = context::supervisor().await?;
    let view = supervisor.stop(&args.name).await.into_diagnostic()?;
    print_vm_view(&view);
    Ok(())
}
