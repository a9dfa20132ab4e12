use clap::Args;
use miette::{IntoDiagnostic, Result};

use super::context;

#[derive(Args)]
pub struct RemoveArgs {
    /// VM name
    name: String,
}

pub async fn run(args: RemoveArgs) -> Result<()> {
    let supervisor = context::supervisor().await?;
    supervisor.remove(&args.name).await.into_diagnostic()?;
    println!("VM '{}' removed", args.name);
    Ok(())
}
