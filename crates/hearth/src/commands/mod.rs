//! Subcommand handlers.

pub mod config_cmd;
pub mod shell;
pub mod store;

use std::path::Path;

use crate::error::CliError;

/// Fail with a not-found diagnostic unless `path` is an existing file.
fn require_file(path: &Path) -> Result<(), CliError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CliError::FileNotFound {
            path: path.display().to_string(),
        })
    }
}
