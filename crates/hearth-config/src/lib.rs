//! Configuration for the hearth hub.
//!
//! One TOML file plus `HEARTH_`-prefixed environment overrides, layered on
//! top of built-in defaults and translated into `hearth_core::CoreConfig`.
//! Nested keys use a double underscore: `HEARTH_PIPELINE__CAPACITY=500`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hearth_core::CoreConfig;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub service_messages: ServiceMessagesSection,

    #[serde(default)]
    pub family: FamilySection,

    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PipelineSection {
    /// Ring-buffer slots per interface; one slot always stays empty.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Dispatch time above which a packet is reported as slow.
    #[serde(default = "default_slow_packet_ms")]
    pub slow_packet_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            slow_packet_ms: default_slow_packet_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceMessagesSection {
    #[serde(default = "default_unreach_resend_limit")]
    pub unreach_resend_limit: u32,
}

impl Default for ServiceMessagesSection {
    fn default() -> Self {
        Self {
            unreach_resend_limit: default_unreach_resend_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FamilySection {
    #[serde(default = "default_save_lock_timeout_ms")]
    pub save_lock_timeout_ms: u64,

    #[serde(default = "default_unsubscribe_poll_ms")]
    pub unsubscribe_poll_ms: u64,
}

impl Default for FamilySection {
    fn default() -> Self {
        Self {
            save_lock_timeout_ms: default_save_lock_timeout_ms(),
            unsubscribe_poll_ms: default_unsubscribe_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,

    /// Filter used when neither `-v` nor `RUST_LOG` is given.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

fn default_capacity() -> usize {
    1000
}
fn default_slow_packet_ms() -> u64 {
    1000
}
fn default_unreach_resend_limit() -> u32 {
    3
}
fn default_save_lock_timeout_ms() -> u64 {
    5000
}
fn default_unsubscribe_poll_ms() -> u64 {
    1
}
fn default_level() -> String {
    "warn".into()
}

impl Config {
    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.capacity < 2 {
            return Err(ConfigError::Validation {
                field: "pipeline.capacity".into(),
                reason: format!("must be at least 2, got {}", self.pipeline.capacity),
            });
        }
        if self.family.unsubscribe_poll_ms == 0 {
            return Err(ConfigError::Validation {
                field: "family.unsubscribe_poll_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }

    /// Runtime settings for `HubContext::new`.
    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            pipeline_capacity: self.pipeline.capacity,
            slow_packet_threshold: Duration::from_millis(self.pipeline.slow_packet_ms),
            unreach_resend_limit: self.service_messages.unreach_resend_limit,
            save_lock_timeout: Duration::from_millis(self.family.save_lock_timeout_ms),
            unsubscribe_poll_interval: Duration::from_millis(self.family.unsubscribe_poll_ms),
        }
    }
}

impl From<&Config> for CoreConfig {
    fn from(config: &Config) -> Self {
        config.core_config()
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "hearth", "hearth").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("hearth");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load defaults, then `path` (if it exists), then the environment.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HEARTH_").split("__"));

    let config: Config = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Load the config from the canonical path.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`, creating parent
/// directories as needed.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}
