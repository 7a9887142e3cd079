use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Origin used when neither a config file nor OSP_WORKER_ORIGIN sets one.
const DEFAULT_ORIGIN: &str = "http://localhost:8080/";

/// Static files cached at install time, relative to the origin.
const DEFAULT_STATIC_FILES: &[&str] = &[
  "./",
  "./index.html",
  "./manifest.json",
  "./css/mobile-common.css",
  "./js/mobile-common.js",
  "./js/barcode-scanner.js",
  "./m_9_1_0.html",
  "./m_9_2_0.html",
  "./m_9_3_0.html",
  "./m_9_4_0.html",
  "./m_9_5_0.html",
  "./m_9_5_1_0.html",
  "./m_9_6_0.html",
  "./m_9_7_0.html",
  "./m_9_scan.html",
  "./offline.html",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin all relative URLs are resolved against
  pub origin: Url,
  pub cache: CacheConfig,
  pub routing: RoutingConfig,
  pub install: InstallConfig,
  pub notifications: NotificationConfig,
  pub network: NetworkConfig,
  pub pending: PendingConfig,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse(DEFAULT_ORIGIN).expect("DEFAULT_ORIGIN is a valid absolute URL"),
      cache: CacheConfig::default(),
      routing: RoutingConfig::default(),
      install: InstallConfig::default(),
      notifications: NotificationConfig::default(),
      network: NetworkConfig::default(),
      pending: PendingConfig::default(),
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Namespace shared by every cache this worker owns
  pub prefix: String,
  /// Current deployment generation
  pub version: String,
  /// SQLite database path (defaults to the data directory)
  pub database_path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "ksi-osp".to_string(),
      version: "v1.0.0".to_string(),
      database_path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Regex patterns for URLs that are never intercepted
  pub exclude: Vec<String>,
  /// Path segment marking API requests
  pub api_segment: String,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      exclude: vec!["chrome-extension".to_string(), "extensions".to_string()],
      api_segment: "/api/".to_string(),
    }
  }
}

impl RoutingConfig {
  /// Compile the exclusion patterns.
  pub fn exclude_patterns(&self) -> Result<Vec<Regex>> {
    self
      .exclude
      .iter()
      .map(|p| Regex::new(p).map_err(|e| eyre!("Invalid exclude pattern '{}': {}", p, e)))
      .collect()
  }
}

/// What to do when a static asset cannot be cached during install.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstallPolicy {
  /// Log the failure and keep the worker waiting for a later activation
  #[default]
  Lenient,
  /// Fail the install and discard the worker
  Strict,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
  pub policy: InstallPolicy,
  pub static_files: Vec<String>,
  /// Document served when a navigation cannot be satisfied
  pub offline_document: String,
}

impl Default for InstallConfig {
  fn default() -> Self {
    Self {
      policy: InstallPolicy::default(),
      static_files: DEFAULT_STATIC_FILES.iter().map(|s| s.to_string()).collect(),
      offline_document: "./offline.html".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  /// Substring identifying windows that belong to this app
  pub app_identifier: String,
  pub default_title: String,
  pub default_body: String,
  pub default_url: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Message sent to clients after pending data is flushed
  pub sync_complete_message: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      app_identifier: "ksi-osp".to_string(),
      default_title: "KSI OSP".to_string(),
      default_body: "You have a new notification.".to_string(),
      default_url: "./index.html".to_string(),
      icon: "./icons/icon-192x192.png".to_string(),
      badge: "./icons/badge-72x72.png".to_string(),
      vibrate: vec![100, 50, 100],
      sync_complete_message: "Data synchronization is complete.".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Upper bound for a single network fetch
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 15 }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PendingConfig {
  /// Where the page-side pending queue is persisted
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Also write logs to a daily file in this directory
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./osp-worker.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/osp-worker/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Some(origin) = Self::origin_override()? {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("osp-worker.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("osp-worker").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Origin override from the OSP_WORKER_ORIGIN environment variable.
  fn origin_override() -> Result<Option<Url>> {
    match std::env::var("OSP_WORKER_ORIGIN") {
      Ok(raw) => Url::parse(&raw)
        .map(Some)
        .map_err(|e| eyre!("Invalid OSP_WORKER_ORIGIN '{}': {}", raw, e)),
      Err(_) => Ok(None),
    }
  }

  fn validate(&self) -> Result<()> {
    self.routing.exclude_patterns()?;

    if self.cache.prefix.is_empty() || self.cache.version.is_empty() {
      return Err(eyre!("Cache prefix and version must not be empty"));
    }

    for file in &self.install.static_files {
      self.resolve(file)?;
    }
    self.resolve(&self.install.offline_document)?;

    Ok(())
  }

  /// Resolve a possibly relative URL against the origin.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin
      .join(url)
      .map_err(|e| eyre!("Failed to resolve '{}' against {}: {}", url, self.origin, e))
  }

  /// Directory for the cache database and pending queue.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("osp-worker"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.cache.database_path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }

  pub fn pending_path(&self) -> Result<PathBuf> {
    match &self.pending.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("pending.json")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_deployment() {
    let config = Config::default();
    assert_eq!(config.cache.prefix, "ksi-osp");
    assert_eq!(config.install.static_files.len(), 16);
    assert_eq!(config.install.policy, InstallPolicy::Lenient);
    assert_eq!(config.notifications.vibrate, vec![100, 50, 100]);
  }

  #[test]
  fn test_default_origin() {
    assert_eq!(Config::default().origin.as_str(), DEFAULT_ORIGIN);
    let from_empty_file = Config::from_yaml("{}").unwrap();
    assert_eq!(from_empty_file.origin.as_str(), DEFAULT_ORIGIN);
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
origin: "https://osp.example.com/mobile/"
cache:
  version: v2.0.0
install:
  policy: strict
"#,
    )
    .unwrap();

    assert_eq!(config.cache.version, "v2.0.0");
    assert_eq!(config.cache.prefix, "ksi-osp");
    assert_eq!(config.install.policy, InstallPolicy::Strict);
    assert_eq!(config.install.offline_document, "./offline.html");
  }

  #[test]
  fn test_resolve_relative_to_origin() {
    let config = Config::from_yaml("origin: \"https://osp.example.com/mobile/\"").unwrap();
    let url = config.resolve("./css/mobile-common.css").unwrap();
    assert_eq!(url.as_str(), "https://osp.example.com/mobile/css/mobile-common.css");
  }

  #[test]
  fn test_invalid_exclude_pattern_rejected() {
    let config = Config::from_yaml("routing:\n  exclude: [\"(unclosed\"]").unwrap();
    assert!(config.validate().is_err());
  }
}
