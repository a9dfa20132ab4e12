mod context;

pub mod console;
pub mod create;
pub mod get;
pub mod image;
pub mod list;
pub mod lock;
pub mod remove;
pub mod resize;
pub mod start;
pub mod stop;
pub mod volume;

use clap::{Parser, Subcommand};
use miette::Result;
use vm_manager::VmView;

#[derive(Parser)]
#[command(name = "vmctl", about = "Manage virtual machines", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new VM and start it
    Create(create::CreateArgs),
    /// Start a stopped VM
    Start(start::StartArgs),
    /// Stop a running VM
    Stop(stop::StopArgs),
    /// Resize a VM's cpu/memory/disk
    Resize(resize::ResizeArgs),
    /// Prevent a VM from being modified or removed
    Lock(lock::LockArgs),
    /// Clear a VM's lock
    Unlock(lock::UnlockArgs),
    /// Remove a VM and clean up all of its resources
    Remove(remove::RemoveArgs),
    /// Show a single VM by name
    Get(get::GetArgs),
    /// Show a single VM by its MAC address
    GetByMac(get::GetByMacArgs),
    /// List all VMs
    List(list::ListArgs),
    /// Attach or detach an extra volume
    Volume(volume::VolumeCommand),
    /// Report how to reach a VM's console
    Console(console::ConsoleArgs),
    /// Manage the base-image library
    Image(image::ImageCommand),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Create(args) => create::run(args).await,
            Command::Start(args) => start::run(args).await,
            Command::Stop(args) => stop::run(args).await,
            Command::Resize(args) => resize::run(args).await,
            Command::Lock(args) => lock::run_lock(args).await,
            Command::Unlock(args) => lock::run_unlock(args).await,
            Command::Remove(args) => remove::run(args).await,
            Command::Get(args) => get::run_get(args).await,
            Command::GetByMac(args) => get::run_get_by_mac(args).await,
            Command::List(args) => list::run(args).await,
            Command::Volume(args) => volume::run(args).await,
            Command::Console(args) => console::run(args).await,
            Command::Image(args) => image::run(args).await,
        }
    }
}

/// Shared table-row printer for any command returning a single `VmView`.
fn print_vm_view(view: &VmView) {
    println!("Name:     {}", view.metadata.name);
    println!("Status:   {}", view.status);
    println!("Owner:    {}", view.metadata.owner);
    println!("Image:    {}", view.metadata.image);
    println!("Arch:     {}", view.metadata.arch);
    println!("CPU:      {}", view.metadata.cpu);
    println!("Memory:   {}", view.metadata.memory);
    println!("Disk:     {}", view.metadata.disk);
    println!("MAC:      {}", view.metadata.mac_address);
    if !view.metadata.ip_address.is_empty() {
        println!("IP:       {}", view.metadata.ip_address);
    }
    if !view.metadata.tag.is_empty() {
        println!("Tag:      {}", view.metadata.tag);
    }
    println!("Locked:   {}", view.metadata.lock);
    println!("Volume:   {}", view.metadata.volume.display());
    for vol in &view.metadata.extra_volumes {
        println!("Volume:   {} ({}, {})", vol.name, vol.path.display(), vol.size);
    }
}
