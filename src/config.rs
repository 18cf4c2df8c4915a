use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::RequestKey;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub app: AppConfig,
  pub cache: CacheConfig,
  /// Activate a successful install immediately instead of waiting for an
  /// explicit activate event. Whichever way this is set, it applies to every
  /// install.
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  /// Host-side cadence for posting run-check messages, in seconds
  pub check_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Origin the app is served from; asset paths resolve against this
  pub base_url: String,
  /// Static assets cached at install. Any single failure fails the install.
  pub assets: Vec<String>,
  /// Document served when a navigation has neither network nor a cached copy
  #[serde(default = "default_offline_document")]
  pub offline_document: String,
  /// Well-known cache path where the main app publishes filter records
  #[serde(default = "default_snapshot_path")]
  pub snapshot_path: String,
  /// App-relative icon attached to notifications
  pub icon: Option<String>,
  /// App-relative badge attached to notifications
  pub badge: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Cache generation name, bumped per release
  pub version: String,
  /// Override for the cache database and log location
  pub data_dir: Option<PathBuf>,
}

fn default_true() -> bool {
  true
}

fn default_offline_document() -> String {
  "index.html".to_string()
}

fn default_snapshot_path() -> String {
  "data/filters.json".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./filterd.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/filterd/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/filterd/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("filterd.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("filterd").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Resolve an app-relative path into a request key.
  pub fn request_key(&self, path: &str) -> Result<RequestKey> {
    let base = Url::parse(&self.app.base_url)
      .map_err(|e| eyre!("Invalid base_url {}: {}", self.app.base_url, e))?;
    let url = base
      .join(path)
      .map_err(|e| eyre!("Invalid asset path {}: {}", path, e))?;

    RequestKey::get(url.as_str())
  }

  /// Request keys for the full asset manifest, in manifest order.
  pub fn asset_keys(&self) -> Result<Vec<RequestKey>> {
    self
      .app
      .assets
      .iter()
      .map(|asset| self.request_key(asset))
      .collect()
  }

  /// Directory holding the cache database and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.cache.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("filterd"))
  }
}
