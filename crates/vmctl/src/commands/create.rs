use clap::Args;
use miette::{IntoDiagnostic, Result};
use vm_manager::CreateParams;

use super::context;
use super::print_vm_view;

#[derive(Args)]
pub struct CreateArgs {
    /// VM name
    name: String,

    /// Owning user or team
    #[arg(long)]
    owner: String,

    /// Base image name (see `vmctl image list`)
    #[arg(long)]
    image: String,

    /// Guest architecture (defaults to the host's)
    #[arg(long)]
    arch: Option<String>,

    /// vCPU count
    #[arg(long, default_value = "1")]
    cpu: String,

    /// Memory size, e.g. `1Gi`
    #[arg(long, default_value = "1Gi")]
    memory: String,

    /// Root disk size, e.g. `10Gi`
    #[arg(long, default_value = "10Gi")]
    disk: String,

    /// cloud-init user-data, inline
    #[arg(long, default_value = "")]
    user_data: String,

    /// Free-form tag
    #[arg(long, default_value = "")]
    tag: String,
}

pub async fn run(args: CreateArgs) -> Result<()> {
    let supervisor = context::supervisor().await?;

    let view = supervisor
        .create(CreateParams {
            name: args.name,
            owner: args.owner,
            image: args.image,
            arch: args.arch,
            cpu: args.cpu,
            memory: args.memory,
            disk: args.disk,
            user_data: args.user_data,
            tag: args.tag,
        })
        .await
        .into_diagnostic()?;

    print_vm_view(&view);
    Ok(())
}
