use clap::Args;
use miette::{IntoDiagnostic, Result};
use vm_manager::ResizeParams;

use super::context;
use super::print_vm_view;

#[derive(Args)]
pub struct ResizeArgs {
    /// VM name
    name: String,

    /// New vCPU count
    #[arg(long)]
    cpu: Option<String>,

    /// New memory size, e.g. `2Gi`
    #[arg(long)]
    memory: Option<String>,

    /// New root disk size, e.g. `20Gi`
    #[arg(long)]
    disk: Option<String>,
}

pub async fn run(args: ResizeArgs) -> Result<()> {
    let supervisor = context::supervisor().await?;
    let view = supervisor
        .resize(
            &args.name,
            ResizeParams {
                cpu: args.cpu,
                memory: args.memory,
                disk: args.disk,
            },
        )
        .await
        .into_diagnostic()?;
    print_vm_view(&view);
    Ok(())
}
