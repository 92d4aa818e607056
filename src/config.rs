//! Host configuration and on-disk locations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mpv::LaunchSettings;
use crate::session::Timeouts;

/// Overrides the data directory when set.
pub const DATA_DIR_ENV: &str = "MPV_HOST_DIR";
pub const CONFIG_FILE: &str = "config.json";
pub const SESSION_FILE: &str = "session.json";
pub const LOG_FILE: &str = "native_host.log";
pub const COMPLETION_SCRIPT: &str = "on_completion.lua";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Failed to read config: {0}")]
  Io(#[from] std::io::Error),
  #[error("Failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("Invalid config: {0}")]
  Invalid(String),
}

/// Host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
  /// Custom MPV executable path (None = auto-detect).
  #[serde(default, alias = "mpv_path")]
  pub mpv_path: Option<String>,

  /// Additional MPV command-line arguments.
  #[serde(default)]
  pub mpv_args: Vec<String>,

  #[serde(default = "default_log_level")]
  pub log_level: String,

  /// How long a liveness probe waits for mpv to answer.
  #[serde(default = "default_probe_timeout_ms")]
  pub probe_timeout_ms: u64,

  /// Connect/write bound for IPC commands.
  #[serde(default = "default_ipc_timeout_ms")]
  pub ipc_timeout_ms: u64,

  /// How long each shutdown stage waits for the player to exit.
  #[serde(default = "default_shutdown_timeout_ms")]
  pub shutdown_timeout_ms: u64,

  /// Lua script loaded into mpv (None = `on_completion.lua` in the data dir).
  #[serde(default)]
  pub completion_script: Option<String>,
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_probe_timeout_ms() -> u64 {
  500
}

fn default_ipc_timeout_ms() -> u64 {
  2000
}

fn default_shutdown_timeout_ms() -> u64 {
  5000
}

impl Default for HostConfig {
  fn default() -> Self {
    Self {
      mpv_path: None,
      mpv_args: Vec::new(),
      log_level: default_log_level(),
      probe_timeout_ms: default_probe_timeout_ms(),
      ipc_timeout_ms: default_ipc_timeout_ms(),
      shutdown_timeout_ms: default_shutdown_timeout_ms(),
      completion_script: None,
    }
  }
}

impl HostConfig {
  /// Read the config at `path`. A missing file yields the defaults.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    if !path.exists() {
      return Ok(Self::default());
    }
    let contents = std::fs::read_to_string(path)?;
    let config: Self = serde_json::from_str(&contents)?;
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), String> {
    if self.log_level.parse::<LevelFilter>().is_err() {
      return Err(format!("Unknown log level '{}'", self.log_level));
    }
    if !(50..=10_000).contains(&self.probe_timeout_ms) {
      return Err("Probe timeout must be between 50 and 10000 ms".to_string());
    }
    if !(100..=30_000).contains(&self.ipc_timeout_ms) {
      return Err("IPC timeout must be between 100 and 30000 ms".to_string());
    }
    if !(500..=60_000).contains(&self.shutdown_timeout_ms) {
      return Err("Shutdown timeout must be between 500 and 60000 ms".to_string());
    }
    Ok(())
  }

  pub fn log_filter(&self) -> LevelFilter {
    self.log_level.parse().unwrap_or(LevelFilter::Info)
  }

  pub fn ipc_timeout(&self) -> Duration {
    Duration::from_millis(self.ipc_timeout_ms)
  }

  pub fn timeouts(&self) -> Timeouts {
    Timeouts {
      probe: Duration::from_millis(self.probe_timeout_ms),
      shutdown: Duration::from_millis(self.shutdown_timeout_ms),
    }
  }

  pub fn launch_settings(&self, data_dir: &Path) -> LaunchSettings {
    let completion_script = self
      .completion_script
      .as_ref()
      .filter(|s| !s.is_empty())
      .map(PathBuf::from)
      .unwrap_or_else(|| data_dir.join(COMPLETION_SCRIPT));
    LaunchSettings {
      mpv_path: self
        .mpv_path
        .as_ref()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from),
      extra_args: self.mpv_args.clone(),
      completion_script: Some(completion_script),
    }
  }
}

/// Directory holding the config, session record and log file.
pub fn data_dir() -> PathBuf {
  if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
    return PathBuf::from(dir);
  }
  dirs::data_local_dir()
    .unwrap_or_else(std::env::temp_dir)
    .join("mpv-playlist-host")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_missing_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = HostConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
    assert_eq!(config.log_level, "info");
    assert_eq!(config.timeouts().probe, Duration::from_millis(500));
    assert_eq!(config.timeouts().shutdown, Duration::from_secs(5));
    assert_eq!(config.ipc_timeout(), Duration::from_secs(2));
  }

  #[test]
  fn test_partial_file_keeps_other_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE);
    std::fs::write(
      &path,
      r#"{"mpv_path": "/opt/mpv", "mpvArgs": ["--mute"], "logLevel": "debug"}"#,
    )
    .unwrap();

    let config = HostConfig::load(&path).unwrap();
    assert_eq!(config.mpv_path.as_deref(), Some("/opt/mpv"));
    assert_eq!(config.mpv_args, vec!["--mute"]);
    assert_eq!(config.log_filter(), LevelFilter::Debug);
    assert_eq!(config.shutdown_timeout_ms, 5000);
  }

  #[test]
  fn test_invalid_files_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE);

    std::fs::write(&path, "{").unwrap();
    assert!(matches!(HostConfig::load(&path), Err(ConfigError::Parse(_))));

    std::fs::write(&path, r#"{"logLevel": "chatty"}"#).unwrap();
    assert!(matches!(HostConfig::load(&path), Err(ConfigError::Invalid(_))));

    std::fs::write(&path, r#"{"probeTimeoutMs": 0}"#).unwrap();
    assert!(matches!(HostConfig::load(&path), Err(ConfigError::Invalid(_))));
  }

  #[test]
  fn test_launch_settings() {
    let dir = tempfile::tempdir().unwrap();
    let config = HostConfig {
      mpv_path: Some(String::new()),
      ..Default::default()
    };

    // The script path is kept even before the file exists; launch decides.
    let settings = config.launch_settings(dir.path());
    assert_eq!(settings.mpv_path, None);
    assert_eq!(
      settings.completion_script,
      Some(dir.path().join(COMPLETION_SCRIPT))
    );

    let custom = HostConfig {
      completion_script: Some("/opt/scripts/done.lua".to_string()),
      ..Default::default()
    };
    assert_eq!(
      custom.launch_settings(dir.path()).completion_script,
      Some(PathBuf::from("/opt/scripts/done.lua"))
    );
  }
}
