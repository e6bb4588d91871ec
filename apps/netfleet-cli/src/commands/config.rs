use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use netfleet_core::config::{config_schema_json, write_schema_file};
use netfleet_core::load_config;

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Print (or write) the JSON schema of the config file
    Schema(SchemaArgs),
    /// Validate a config file against the schema
    Check(CheckArgs),
}

#[derive(Args)]
pub struct SchemaArgs {
    /// Write the schema to this path instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Config file to validate
    path: PathBuf,
}

pub fn run(cmd: ConfigCmd) -> Result<()> {
    match cmd {
        ConfigCmd::Schema(args) => match args.out {
            Some(path) => {
                write_schema_file(&path)?;
                println!("wrote {}", path.display());
            }
            None => super::print_json(&config_schema_json()?, true),
        },
        ConfigCmd::Check(args) => {
            let cfg = load_config(&args.path)?;
            println!(
                "{}: ok ({} firmware entries, upgrade concurrency {})",
                args.path.display(),
                cfg.firmware.len(),
                cfg.queue.upgrade_concurrency()
            );
        }
    }
    Ok(())
}
