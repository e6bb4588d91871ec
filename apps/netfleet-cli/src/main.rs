use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

use commands::{ConfigCmd, DevicesCmd, Env, TasksCmd};

#[derive(Parser)]
#[command(name = "netfleet-cli", version, about = "Fleet firmware upgrade operator CLI")]
struct Cli {
    /// Config file; falls back to NETFLEET_CONFIG, then ./netfleet.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding netfleet.sqlite (overrides the config)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upgrade tasks
    Tasks {
        #[command(subcommand)]
        cmd: TasksCmd,
    },
    /// Device inventory
    Devices {
        #[command(subcommand)]
        cmd: DevicesCmd,
    },
    /// Config file helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

fn main() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Config { cmd } => commands::config::run(cmd),
        Commands::Tasks { cmd } => Env::open(cli.config.as_deref(), cli.state_dir.as_deref())
            .and_then(|env| commands::tasks::run(cmd, &env)),
        Commands::Devices { cmd } => Env::open(cli.config.as_deref(), cli.state_dir.as_deref())
            .and_then(|env| commands::devices::run(cmd, &env)),
    };
    if let Err(e) = result {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
