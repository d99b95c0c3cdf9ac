//! Murmur configuration system.
//!
//! TOML-based configuration for the voice engine. Every section uses
//! `serde(default)` so partial configs work out of the box.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use murmur_config::load_config;
//!
//! let config = load_config().expect("failed to load config");
//! println!("ice restarts: {}", config.negotiation.ice_restart_max_attempts);
//! ```

pub mod schema;
pub mod toml_loader;
pub mod validation;

pub use schema::{
    LogLevel, LoggingConfig, MurmurConfig, NegotiationConfig, VadConfig, VoiceConfig,
    CONFIG_SCHEMA_VERSION,
};
pub use toml_loader::{load_default, load_from_path, CONFIG_PATH_ENV};

use murmur_common::ConfigError;

/// Load config from the platform default path and validate it strictly.
pub fn load_config() -> Result<MurmurConfig, ConfigError> {
    let config = toml_loader::load_default()?;
    validation::validate(&config)?;
    Ok(config)
}

/// Serialize a config to TOML, e.g. for `--print-config` style output.
pub fn config_to_toml(config: &MurmurConfig) -> String {
    toml::to_string_pretty(config)
        .unwrap_or_else(|e| format!("# failed to serialize config: {e}\n"))
}
