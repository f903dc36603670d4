//! Tracing subscriber setup for the binary.

use color_eyre::{eyre::eyre, Result};
use std::ffi::OsStr;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. When a log file is configured
/// the returned guard must be kept alive to flush it.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e))?;

  let Some(path) = &config.file else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .try_init()
      .map_err(|e| eyre!("Failed to install logger: {}", e))?;
    return Ok(None);
  };

  let (dir, file_name) = split_log_path(path)?;
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::never(dir, file_name);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  Ok(Some(guard))
}

/// Split a log file path into its directory (current one if bare) and file name.
fn split_log_path(path: &Path) -> Result<(&Path, &OsStr)> {
  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
  let dir = path
    .parent()
    .filter(|dir| !dir.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));
  Ok((dir, file_name))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_split_nested_path() {
    let (dir, name) = split_log_path(Path::new("/var/log/querykit.log")).unwrap();
    assert_eq!(dir, Path::new("/var/log"));
    assert_eq!(name, "querykit.log");
  }

  #[test]
  fn test_split_bare_file_name() {
    let (dir, name) = split_log_path(Path::new("querykit.log")).unwrap();
    assert_eq!(dir, Path::new("."));
    assert_eq!(name, "querykit.log");
  }

  #[test]
  fn test_split_rejects_directory_only() {
    assert!(split_log_path(Path::new("/")).is_err());
  }
}
