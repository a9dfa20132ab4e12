use clap::{Args, Subcommand};
use miette::{IntoDiagnostic, Result};
use vm_manager::image::ImageStore;
use vm_manager::{Config, SystemExec};

#[derive(Args)]
pub struct ImageCommand {
    #[command(subcommand)]
    action: ImageAction,
}

#[derive(Subcommand)]
enum ImageAction {
    /// List the base images available to `vmctl create --image`
    List,
}

pub async fn run(args: ImageCommand) -> Result<()> {
    match args.action {
        ImageAction::List => {
            let store = ImageStore::new(SystemExec, Config::from_env());
            let images = store.list().into_diagnostic()?;

            if images.is_empty() {
                println!("No base images found.");
                return Ok(());
            }

            for name in images {
                println!("{name}");
            }
        }
    }

    Ok(())
}
