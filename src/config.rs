use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::stale_time::DEFAULT_BUFFER_MINUTES;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub session: SessionConfig,
  #[serde(default)]
  pub export: ExportConfig,
  #[serde(default)]
  pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the portal API, e.g. https://portail.example.com/api/
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Minutes before local midnight at which cached data goes stale
  #[serde(default = "default_stale_buffer")]
  pub stale_buffer_minutes: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_buffer_minutes: DEFAULT_BUFFER_MINUTES,
    }
  }
}

fn default_stale_buffer() -> i64 {
  DEFAULT_BUFFER_MINUTES
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
  /// Where the login blob lives (default: $XDG_DATA_HOME/releve/session.json)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportConfig {
  /// Where downloads are saved (default: the user's download directory)
  pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  #[serde(default = "default_bind")]
  pub bind: SocketAddr,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: default_bind(),
    }
  }
}

fn default_bind() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 3000))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./releve.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/releve/config.yaml
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
        "No configuration file found. Create one at ~/.config/releve/config.yaml\n\
                 with at least:\n\n  api:\n    url: https://portail.example.com/api/"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("releve.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("releve").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the bearer token from the RELEVE_API_TOKEN environment variable.
  pub fn get_api_token() -> Option<String> {
    std::env::var("RELEVE_API_TOKEN")
      .ok()
      .map(|t| t.trim().to_string())
      .filter(|t| !t.is_empty())
  }

  pub fn session_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.session.path {
      return Ok(path.clone());
    }
    dirs::data_dir()
      .map(|d| d.join("releve").join("session.json"))
      .ok_or_else(|| eyre!("No data directory; set session.path in the config file"))
  }

  pub fn export_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.export.directory {
      return Ok(dir.clone());
    }
    dirs::download_dir()
      .or_else(dirs::home_dir)
      .ok_or_else(|| eyre!("No download directory; set export.directory in the config file"))
  }
}
