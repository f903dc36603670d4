use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Simulated delay of every data source call, in milliseconds
  pub latency_ms: u64,
  /// Age after which cached data is refetched on read (never, if unset)
  pub stale_time_secs: Option<u64>,
  /// Titles the posts source starts with
  pub seed_titles: Vec<String>,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      latency_ms: 1000,
      stale_time_secs: None,
      seed_titles: vec!["Post 1".to_string(), "Post 2".to_string()],
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive used when RUST_LOG is not set (e.g. "info", "querykit=debug")
  #[serde(deserialize_with = "deserialize_lowercase")]
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

fn deserialize_lowercase<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let s = String::deserialize(deserializer)?;
  Ok(s.to_lowercase())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./querykit.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/querykit/config.yaml
  ///
  /// Defaults are used when no file is found.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("querykit.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("querykit").join("config.yaml");
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

  fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is a valid "use the defaults"
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  pub fn latency(&self) -> Duration {
    Duration::from_millis(self.latency_ms)
  }

  pub fn stale_time(&self) -> Option<Duration> {
    self.stale_time_secs.map(Duration::from_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_full_config() {
    let config = Config::from_yaml(
      r#"
latency_ms: 250
stale_time_secs: 30
seed_titles: ["First", "Second", "Third"]
log:
  level: DEBUG
  file: /tmp/querykit.log
"#,
    )
    .unwrap();

    assert_eq!(config.latency(), Duration::from_millis(250));
    assert_eq!(config.stale_time(), Some(Duration::from_secs(30)));
    assert_eq!(config.seed_titles.len(), 3);
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.log.file, Some(PathBuf::from("/tmp/querykit.log")));
  }

  #[test]
  fn test_missing_fields_use_defaults() {
    let config = Config::from_yaml("latency_ms: 0").unwrap();

    assert_eq!(config.latency(), Duration::ZERO);
    assert_eq!(config.stale_time(), None);
    assert_eq!(config.seed_titles, vec!["Post 1", "Post 2"]);
    assert_eq!(config.log.level, "info");
    assert!(config.log.file.is_none());
  }

  #[test]
  fn test_empty_file_is_default() {
    let config = Config::from_yaml("\n").unwrap();
    assert_eq!(config.latency_ms, 1000);
  }

  #[test]
  fn test_invalid_yaml_is_an_error() {
    assert!(Config::from_yaml("latency_ms: soon").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
