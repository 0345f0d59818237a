//! Clap derive structures for the `hearth` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// hearth -- inspect hub configuration and stored device state
#[derive(Debug, Parser)]
#[command(
    name = "hearth",
    version,
    about = "Inspect hearth hub configuration and device stores",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "HEARTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "plain", global = true)]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Plain,
    /// Pretty-printed JSON
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show or create the configuration file
    Config(ConfigArgs),

    /// Inspect a store snapshot
    Store(StoreArgs),

    /// Load a family from a store snapshot and run CLI commands against it
    Shell(ShellArgs),
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Print the effective configuration (defaults, file and environment)
    Show,

    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    #[command(subcommand)]
    pub command: StoreCommand,
}

#[derive(Debug, Subcommand)]
pub enum StoreCommand {
    /// Row counts per table
    Summary {
        /// JSON snapshot written by the in-memory store
        file: PathBuf,
    },
}

#[derive(Debug, Args)]
pub struct ShellArgs {
    /// JSON snapshot written by the in-memory store
    pub file: PathBuf,

    /// Family whose devices are loaded
    #[arg(long, short = 'f', default_value = "1")]
    pub family: u32,

    /// Commands, run in order against the same session
    #[arg(required = true, num_args = 1..)]
    pub commands: Vec<String>,
}
