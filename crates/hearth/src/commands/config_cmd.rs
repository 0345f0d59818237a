//! Config subcommand handlers.

use hearth_config::{Config, ConfigError};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::error::CliError;

pub fn handle(
    args: ConfigArgs,
    global: &GlobalOpts,
    config: Result<Config, ConfigError>,
) -> Result<(), CliError> {
    let path = global
        .config
        .clone()
        .unwrap_or_else(hearth_config::config_path);

    match args.command {
        ConfigCommand::Path => {
            println!("{}", path.display());
            Ok(())
        }

        ConfigCommand::Show => {
            let config = config?;
            let rendered = match global.output {
                OutputFormat::Plain => toml::to_string_pretty(&config)?,
                OutputFormat::Json => serde_json::to_string_pretty(&config)?,
            };
            println!("{}", rendered.trim_end());
            Ok(())
        }

        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(CliError::AlreadyExists {
                    path: path.display().to_string(),
                });
            }
            hearth_config::save_config_to(&Config::default(), &path)?;
            tracing::info!(path = %path.display(), "config written");
            println!("{}", path.display());
            Ok(())
        }
    }
}
