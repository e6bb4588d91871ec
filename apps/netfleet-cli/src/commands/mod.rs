pub mod config;
pub mod devices;
pub mod tasks;

pub use config::ConfigCmd;
pub use devices::DevicesCmd;
pub use tasks::TasksCmd;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use netfleet_core::{load_config, Config};
use netfleet_kernel::Kernel;

/// Config plus the store the daemon reads from.
pub struct Env {
    pub config: Config,
    pub kernel: Kernel,
}

impl Env {
    pub fn open(config: Option<&Path>, state_dir: Option<&Path>) -> Result<Self> {
        let config = resolve_config(config)?;
        let dir = state_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.runtime.state_dir());
        let kernel =
            Kernel::open(&dir).with_context(|| format!("open state in {}", dir.display()))?;
        Ok(Self { config, kernel })
    }
}

/// `--config`, else `NETFLEET_CONFIG`, else `./netfleet.toml` when present, else defaults.
pub fn resolve_config(explicit: Option<&Path>) -> Result<Config> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("NETFLEET_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let local = PathBuf::from("netfleet.toml");
            local.exists().then_some(local)
        });
    match path {
        Some(path) => load_config(&path),
        None => Ok(Config::default()),
    }
}

pub(crate) fn print_json(value: &serde_json::Value, pretty: bool) {
    if pretty {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        );
    } else {
        println!("{}", value);
    }
}
