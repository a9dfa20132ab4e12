use clap::Args;
use miette::{IntoDiagnostic, Result};
use vm_manager::Config;

use super::context;

#[derive(Args)]
pub struct ConsoleArgs {
    /// VM name
    name: String,
}

/// Reports where to reach a running VM's console, rather than bridging it
/// itself: VNC isn't a byte-stream console, and exposing it over TCP is the
/// HTTP layer's concern, not this CLI's.
pub async fn run(args: ConsoleArgs) -> Result<()> {
    let supervisor = context::supervisor().await?;
    let view = supervisor.get(&args.name).await.into_diagnostic()?;

    let config = Config::from_env();
    let socket = config.vm_dir(&args.name).join("vnc.socket");

    println!("VNC socket: {}", socket.display());
    if !view.metadata.vnc_port.is_empty() {
        println!("VNC port:   {}", view.metadata.vnc_port);
    }
    println!("VNC password: {}", view.metadata.vnc_password);

    Ok(())
}
