//! Where the config file lives, and writing the commented template there.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use murmur_common::ConfigError;
use tracing::info;

use super::template::default_config_toml;

/// Overrides the platform config location when set.
pub const CONFIG_PATH_ENV: &str = "MURMUR_CONFIG";

/// `$MURMUR_CONFIG`, else `<config_dir>/murmur/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join("murmur").join("config.toml"))
        .ok_or_else(|| ConfigError::ParseError("no platform config directory".into()))
}

/// Write the template to `path`. An existing file is left untouched.
pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    let io_error = |what: &str, e: std::io::Error| {
        ConfigError::ParseError(format!("{what} {}: {e}", path.display()))
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| io_error("cannot create directory for", e))?;
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => return Err(io_error("cannot create", e)),
    };
    file.write_all(default_config_toml().as_bytes())
        .map_err(|e| io_error("cannot write", e))?;

    info!(path = %path.display(), "Wrote default config");
    Ok(())
}
