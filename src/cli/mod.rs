//! Command-line interface.

mod config;
mod doctor;
mod pending;
mod serve;
mod sites;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use self::doctor::run_doctor_command;
pub use self::serve::run_serve;

use crate::config::Config;
use crate::error::ConfigError;

#[derive(Parser, Debug)]
#[command(
    name = "walletgate",
    version,
    about = "Approval broker between websites and a non-custodial wallet"
)]
pub struct Cli {
    /// TOML config file (default: ~/.walletgate/config.toml)
    #[arg(long, global = true, env = "WALLETGATE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway and broker (default)
    Serve,

    /// Inspect or revoke connected sites
    #[command(subcommand)]
    Sites(SitesCommand),

    /// Inspect or clear pending approval slots
    #[command(subcommand)]
    Pending(PendingCommand),

    /// Probe configuration, store and gateway
    Doctor {
        /// Exit non-zero when any check fails
        #[arg(long)]
        strict: bool,
    },

    /// Manage the TOML config file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
pub enum SitesCommand {
    /// List trusted origins
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Forget a trusted origin
    Revoke {
        /// Origin, e.g. https://app.example.com
        origin: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum PendingCommand {
    /// Show occupied slots
    List {
        #[arg(long)]
        json: bool,
    },
    /// Empty a slot regardless of its state
    Clear {
        /// connection, transaction or signature
        kind: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write a config file with the current settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print every setting as `path = value`
    List,
}

/// Dispatch a parsed command. `config` is the already-resolved runtime
/// config; commands that can run without one (doctor, config) tolerate
/// its failure.
pub async fn run(cli: Cli, config: Result<Config, ConfigError>) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(config?).await,
        Command::Sites(cmd) => sites::run_sites_command(cmd, &config?).await,
        Command::Pending(cmd) => pending::run_pending_command(cmd, &config?).await,
        Command::Doctor { strict } => run_doctor_command(config, strict).await,
        Command::Config(cmd) => self::config::run_config_command(cmd, cli.config.as_deref()),
    }
}
