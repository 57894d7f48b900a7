//! Configuration for the sync engine.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Minutes before a cached entity is considered stale.
  #[serde(default = "default_stale_minutes")]
  pub stale_minutes: u32,
  /// Minutes before the saved-library snapshot is considered stale.
  #[serde(default = "default_stale_minutes")]
  pub library_stale_minutes: u32,
  /// Retry schedule for transient remote failures, in milliseconds.
  #[serde(default = "default_backoff_ms")]
  pub backoff_ms: Vec<u64>,
}

fn default_stale_minutes() -> u32 {
  5
}

fn default_backoff_ms() -> Vec<u64> {
  vec![250, 500, 500, 2000, 5000]
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      stale_minutes: default_stale_minutes(),
      library_stale_minutes: default_stale_minutes(),
      backoff_ms: default_backoff_ms(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// Cache database location. Defaults to the platform data directory.
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file, falling back to defaults when none is
  /// found.
  ///
  /// Search order:
  /// 1. Explicit path if provided (an error if it does not exist)
  /// 2. ./mixtape.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mixtape/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Config(format!("config file not found: {}", p.display())));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("mixtape.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mixtape").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("failed to read config file {}: {}", path.display(), e)))?;

    serde_yaml::from_str(&contents)
      .map_err(|e| Error::Config(format!("failed to parse config file {}: {}", path.display(), e)))
  }

  /// Entity staleness threshold as a chrono duration.
  pub fn stale_after(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.sync.stale_minutes as i64)
  }

  /// Library-snapshot staleness threshold as a chrono duration.
  pub fn library_stale_after(&self) -> chrono::Duration {
    chrono::Duration::minutes(self.sync.library_stale_minutes as i64)
  }
}
