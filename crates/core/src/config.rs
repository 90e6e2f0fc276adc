use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionOptions;
use crate::snapshot::SNAPSHOT_FILE_NAME;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const IN_MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabulaConfig {
    /// Database file for the embedded engine, `:memory:` for a throwaway one.
    pub embedded_path: String,
    pub baseline_extensions: Vec<String>,
    pub snapshot_path: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for TabulaConfig {
    fn default() -> Self {
        Self {
            embedded_path: IN_MEMORY_PATH.to_string(),
            baseline_extensions: SessionOptions::default().baseline_extensions,
            snapshot_path: None,
            log_filter: "info".to_string(),
        }
    }
}

impl TabulaConfig {
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_from_path(default_config_dir()?.join(CONFIG_FILE_NAME))
    }

    /// Missing or blank files yield the defaults.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn resolved_snapshot_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.snapshot_path {
            Some(path) => Ok(path.clone()),
            None => Ok(default_config_dir()?.join(SNAPSHOT_FILE_NAME)),
        }
    }

    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            baseline_extensions: self.baseline_extensions.clone(),
        }
    }
}

pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    if let Some(custom) = env::var_os("TABULA_CONFIG_DIR") {
        return Ok(PathBuf::from(custom));
    }

    let base_dir = if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(ConfigError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(ConfigError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };
    Ok(base_dir.join("tabula"))
}
