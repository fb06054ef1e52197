//! CLI command definitions and dispatch.

mod channels;
mod config;
pub mod replay;
mod version;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::input;

/// lngate - RPC interception and channel identity tooling for LND.
#[derive(Parser)]
#[command(name = "lngate", version, about)]
pub struct Cli {
    /// Configuration file (.yaml, .yml or .json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Log filter used when RUST_LOG is unset
    pub fn log_level(&self) -> String {
        input::load_config(self.config.as_deref())
            .map(|config| config.log_level.to_string())
            .unwrap_or_else(|_| "warn".to_string())
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Replay recorded interception frames through the hub
    Replay(replay::ReplayArgs),
    /// Replay channel events through the identity resolver
    Channels(channels::ChannelsArgs),
    /// Print the effective configuration
    Config(config::ConfigArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = input::load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Replay(args) => replay::execute(args, config).await,
        Command::Channels(args) => channels::execute(args, config).await,
        Command::Config(args) => config::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}
