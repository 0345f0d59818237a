mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hearth_config::{Config, LogFormat};

use crate::cli::{Cli, Command};
use crate::error::CliError;

fn main() {
    let cli = Cli::parse();

    // A broken config file is reported by `run`; logging falls back to defaults.
    let config_path = cli
        .global
        .config
        .clone()
        .unwrap_or_else(hearth_config::config_path);
    let config = hearth_config::load_config_from(&config_path);
    init_tracing(
        cli.global.verbose,
        config.as_ref().unwrap_or(&Config::default()),
    );

    if let Err(err) = run(cli, config) {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, config: &Config) {
    let filter = match verbosity {
        0 => config.logging.level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match config.logging.format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(cli: Cli, config: Result<Config, hearth_config::ConfigError>) -> Result<(), CliError> {
    tracing::debug!(command = ?cli.command, "dispatching command");
    match cli.command {
        Command::Config(args) => commands::config_cmd::handle(args, &cli.global, config),
        Command::Store(args) => commands::store::handle(args, &cli.global),
        Command::Shell(args) => commands::shell::handle(args, &cli.global, &config?),
    }
}
