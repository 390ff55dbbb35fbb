use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fleet_orchestration::{FleetSettings, SupervisorSettings};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BIND: &str = "127.0.0.1:8765";
pub const CONFIG_FILE_NAME: &str = "fleetd.toml";
pub const DATA_DIR_ENV: &str = "FLEETD_DATA_DIR";
pub const CONFIG_ENV: &str = "FLEETD_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Contents of `fleetd.toml`. Every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub supervisor: SupervisorSettings,
    pub fleet: FleetSettings,
    pub server: ServerSettings,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Explicit path, else `$FLEETD_CONFIG`, else `<data_dir>/fleetd.toml`
    /// when it exists; defaults otherwise.
    pub fn resolve(explicit: Option<&Path>, data_dir: &Path) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| {
                let candidate = data_dir.join(CONFIG_FILE_NAME);
                candidate.is_file().then_some(candidate)
            });
        match path {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }
}

/// `--data-dir`, else `$FLEETD_DATA_DIR`, else `~/.fleetd`.
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .or_else(|| std::env::var_os("USERPROFILE"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".fleetd")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "[supervisor]\nstop_grace_ms = 500\n\n[server]\nbind = \"0.0.0.0:9000\"\n",
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.supervisor.stop_grace_ms, 500);
        assert_eq!(
            config.supervisor.log_rotate_bytes,
            SupervisorSettings::default().log_rotate_bytes
        );
        assert_eq!(config.fleet, FleetSettings::default());
        assert_eq!(config.server.bind, "0.0.0.0:9000");
    }

    #[test]
    fn config_in_data_dir_is_picked_up() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[fleet]\nbroadcast_interval_ms = 750\n",
        )
        .unwrap();
        let config = DaemonConfig::resolve(None, dir.path()).unwrap();
        assert_eq!(config.fleet.broadcast_interval_ms, 750);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[supervisor\n").unwrap();
        let err = DaemonConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse"));
    }
}
