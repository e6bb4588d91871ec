use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};

use netfleet_core::model::{Connectivity, Device, DeviceFamily};
use netfleet_kernel::Kernel;

use super::{print_json, Env};

#[derive(Subcommand)]
pub enum DevicesCmd {
    /// Register a device or update its identity
    Add(AddArgs),
    /// List the inventory
    List(ListArgs),
    /// Record observed state (connectivity, running firmware)
    Set(SetArgs),
}

#[derive(Args)]
pub struct AddArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    model: String,
    /// onu|edgeOs|switch|airMax|airFiber
    #[arg(long)]
    family: String,
    /// Display name (defaults to the id)
    #[arg(long)]
    name: Option<String>,
    /// Management address reachable over ssh
    #[arg(long)]
    address: Option<String>,
    /// Parent OLT for ONUs
    #[arg(long)]
    parent: Option<String>,
    #[arg(long)]
    site: Option<String>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Emit raw JSON instead of formatted text
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
pub struct SetArgs {
    id: String,
    /// connected|disconnected|unknown
    #[arg(long)]
    connectivity: Option<String>,
    /// Firmware version string as the device reports it
    #[arg(long)]
    firmware: Option<String>,
}

pub fn run(cmd: DevicesCmd, env: &Env) -> Result<()> {
    match cmd {
        DevicesCmd::Add(args) => {
            let device = add(&env.kernel, &args)?;
            println!("{} ({}, {})", device.id, device.model, device.family);
        }
        DevicesCmd::List(args) => {
            let devices = env.kernel.list_devices()?;
            if args.json {
                print_json(&serde_json::to_value(&devices)?, false);
            } else {
                for d in &devices {
                    println!(
                        "{:<16}  {:<10}  {:<8}  {:<12}  {}",
                        d.id,
                        d.family.as_str(),
                        d.model,
                        d.connectivity.as_str(),
                        d.firmware_version.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
        DevicesCmd::Set(args) => {
            let device = set(&env.kernel, &args)?;
            println!("{} {}", device.id, device.connectivity.as_str());
        }
    }
    Ok(())
}

/// Upsert identity fields, keeping observed state of an existing record.
pub fn add(kernel: &Kernel, args: &AddArgs) -> Result<Device> {
    let family: DeviceFamily = args.family.parse()?;
    let mut device = kernel
        .get_device(&args.id)?
        .unwrap_or_else(|| Device::new(args.id.as_str(), args.model.as_str(), family));
    device.model = args.model.clone();
    device.family = family;
    if let Some(name) = &args.name {
        device.name = name.clone();
    }
    device.address = args.address.clone().or(device.address);
    device.parent_id = args.parent.clone().or(device.parent_id);
    device.site_id = args.site.clone().or(device.site_id);
    kernel.upsert_device(&device)?;
    Ok(device)
}

pub fn set(kernel: &Kernel, args: &SetArgs) -> Result<Device> {
    let mut device = kernel
        .get_device(&args.id)?
        .ok_or_else(|| anyhow!("unknown device {}", args.id))?;
    if let Some(raw) = &args.connectivity {
        device.connectivity = raw.parse::<Connectivity>()?;
    }
    if let Some(version) = &args.firmware {
        device.firmware_version = Some(version.clone());
    }
    kernel.upsert_device(&device)?;
    Ok(device)
}
