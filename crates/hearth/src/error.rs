//! CLI error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use hearth_config::ConfigError;
use hearth_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Files ────────────────────────────────────────────────────────

    #[error("File not found: {path}")]
    #[diagnostic(
        code(hearth::not_found),
        help("Check the path. Store snapshots are JSON files written by the in-memory store.")
    )]
    FileNotFound { path: String },

    #[error("Configuration file already exists: {path}")]
    #[diagnostic(
        code(hearth::conflict),
        help("Use --force to overwrite it.")
    )]
    AlreadyExists { path: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error(transparent)]
    #[diagnostic(
        code(hearth::config),
        help("Check the config file and HEARTH_* environment variables.")
    )]
    Config(#[from] ConfigError),

    // ── Core ─────────────────────────────────────────────────────────

    #[error("{source}")]
    #[diagnostic(code(hearth::core))]
    Core {
        #[source]
        source: CoreError,
        #[help]
        help: Option<String>,
    },

    // ── IO / Serialization ───────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Cannot render output: {0}")]
    #[diagnostic(code(hearth::json))]
    Json(#[from] serde_json::Error),

    #[error("Cannot render config: {0}")]
    #[diagnostic(code(hearth::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::FileNotFound { .. } => exit_code::NOT_FOUND,
            Self::AlreadyExists { .. } => exit_code::CONFLICT,
            Self::Config(ConfigError::Validation { .. }) => exit_code::USAGE,
            Self::Core { source, .. } if source.is_not_found() => exit_code::NOT_FOUND,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(source: CoreError) -> Self {
        let help = match &source {
            CoreError::Storage { .. } => {
                Some("The store snapshot could not be read or is not valid JSON.".to_owned())
            }
            _ if source.is_not_found() => Some("Run: hearth shell <file> help".to_owned()),
            _ => None,
        };
        Self::Core { source, help }
    }
}
