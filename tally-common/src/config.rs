//! Configuration loading and database path resolution
//!
//! Resolution priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use std::path::PathBuf;

/// Environment variable overriding the database path
pub const DATABASE_ENV_VAR: &str = "TALLY_DATABASE";

/// Environment variable overriding the listen port
pub const PORT_ENV_VAR: &str = "TALLY_PORT";

/// Default listen port for tally-server
pub const DEFAULT_PORT: u16 = 5730;

/// Resolve the SQLite database path
pub fn resolve_database_path(cli_arg: Option<&str>) -> Result<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Ok(PathBuf::from(path));
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
        return Ok(PathBuf::from(path));
    }

    // Priority 3: TOML config file
    if let Ok(config_path) = find_config_file() {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str::<toml::Value>(&toml_content) {
                if let Some(database) = config.get("database").and_then(|v| v.as_str()) {
                    return Ok(PathBuf::from(database));
                }
            }
        }
    }

    // Priority 4: OS-dependent compiled default
    Ok(default_data_dir().join("tally.db"))
}

/// Resolve the listen port
pub fn resolve_port(cli_arg: Option<u16>) -> Result<u16> {
    if let Some(port) = cli_arg {
        return Ok(port);
    }

    if let Ok(value) = std::env::var(PORT_ENV_VAR) {
        return value
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("Invalid {}: {}", PORT_ENV_VAR, e)));
    }

    if let Ok(config_path) = find_config_file() {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str::<toml::Value>(&toml_content) {
                if let Some(port) = config.get("port").and_then(|v| v.as_integer()) {
                    return u16::try_from(port)
                        .map_err(|_| Error::Config(format!("Port out of range: {}", port)));
                }
            }
        }
    }

    Ok(DEFAULT_PORT)
}

/// Locate the platform config file (`<config dir>/tally/config.toml`)
fn find_config_file() -> Result<PathBuf> {
    let path = dirs::config_dir()
        .map(|d| d.join("tally").join("config.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    if path.exists() {
        Ok(path)
    } else {
        Err(Error::Config(format!("Config file not found: {:?}", path)))
    }
}

/// OS-dependent default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("tally"))
        .unwrap_or_else(|| PathBuf::from("./tally_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_argument_wins() {
        let path = resolve_database_path(Some("/tmp/custom.db")).expect("resolve");
        assert_eq!(path, PathBuf::from("/tmp/custom.db"));

        let port = resolve_port(Some(9000)).expect("resolve");
        assert_eq!(port, 9000);
    }

    #[test]
    fn default_path_falls_back_to_data_dir() {
        // No CLI arg; the env var and config file tiers may or may not be
        // present in the test environment, so only assert the file name.
        if std::env::var(DATABASE_ENV_VAR).is_err() {
            let path = resolve_database_path(None).expect("resolve");
            assert!(path.to_string_lossy().ends_with(".db"));
        }
    }

    #[test]
    fn config_file_values_parse() {
        let config: toml::Value =
            toml::from_str("database = \"/srv/tally/tally.db\"\nport = 8080\n").expect("parse");
        assert_eq!(
            config.get("database").and_then(|v| v.as_str()),
            Some("/srv/tally/tally.db")
        );
        assert_eq!(config.get("port").and_then(|v| v.as_integer()), Some(8080));
    }
}
