use clap::{Args, Subcommand};
use miette::{IntoDiagnostic, Result};

use super::context;
use super::print_vm_view;

#[derive(Args)]
pub struct VolumeCommand {
    #[command(subcommand)]
    action: VolumeAction,
}

#[derive(Subcommand)]
enum VolumeAction {
    /// Attach a new extra volume to a VM
    Add(AddArgs),
    /// Detach an extra volume from a VM
    Remove(RemoveArgs),
}

#[derive(Args)]
struct AddArgs {
    /// VM name
    name: String,

    /// Volume size, e.g. `5Gi`
    size: String,
}

#[derive(Args)]
struct RemoveArgs {
    /// VM name
    name: String,

    /// Volume name, e.g. `extra-volume1`
    volume: String,
}

pub async fn run(args: VolumeCommand) -> Result<()> {
    let supervisor = context::supervisor().await?;

    let view = match args.action {
        VolumeAction::Add(add) => supervisor
            .add_volume(&add.name, &add.size)
            .await
            .into_diagnostic()?,
        VolumeAction::Remove(remove) => supervisor
            .remove_volume(&remove.name, &remove.volume)
            .await
            .into_diagnostic()?,
    };

    print_vm_view(&view);
    Ok(())
}
