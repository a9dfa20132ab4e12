use clap::Args;
use miette::{IntoDiagnostic, Result};

use super::context;

#[derive(Args)]
pub struct ListArgs;

pub async fn run(_args: ListArgs) -> Result<()> {
    let supervisor = context::supervisor().await?;
    let mut views = supervisor.list().await.into_diagnostic()?;

    if views.is_empty() {
        println!("No VMs found.");
        return Ok(());
    }

    views.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    println!(
        "{:<20} {:<10} {:<16} {:<16} {:<16} OWNER",
        "NAME", "STATUS", "IMAGE", "IP", "MAC"
    );
    println!("{}", "-".repeat(100));

    for view in views {
        println!(
            "{:<20} {:<10} {:<16} {:<16} {:<16} {}",
            view.metadata.name,
            view.status,
            view.metadata.image,
            view.metadata.ip_address,
            view.metadata.mac_address,
            view.metadata.owner,
        );
    }

    Ok(())
}
