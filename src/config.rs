//! C1: read-only process configuration.
//!
//! Loaded once at startup from a YAML file, with a handful of values
//! overridable via CLI flag or environment variable (see [`Cli`]). Nothing in
//! this module hot-reloads; a `Config` is immutable for the life of the
//! process, matching the Clock & configuration component's contract.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// CLI entry point / environment-variable overrides.
///
/// Only the handful of values operators tune most (bind address, database
/// path, ffmpeg path) get a dedicated env var; everything else lives only in
/// `config.yaml`.
#[derive(Debug, Parser)]
#[command(name = "exstreamtv-core", about = "Virtual IPTV headend playout engine")]
pub struct Cli {
    /// Path to the YAML config file.
    #[arg(long, env = "EXSTREAMTV_CONFIG", default_value = "./config.yaml")]
    pub config: PathBuf,

    #[arg(long, env = "EXSTREAMTV_HOST")]
    pub host: Option<IpAddr>,

    #[arg(long, env = "EXSTREAMTV_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "EXSTREAMTV_DB_PATH")]
    pub db_path: Option<PathBuf>,

    #[arg(long, env = "EXSTREAMTV_FFMPEG_PATH")]
    pub ffmpeg_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 7777,
            public_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./exstreamtv.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HdhomerunConfig {
    pub enabled: bool,
    pub device_id: Option<String>,
    pub friendly_name: String,
    pub tuner_count: u32,
    pub enable_ssdp: bool,
}

impl Default for HdhomerunConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_id: None,
            friendly_name: "exstreamtv".to_string(),
            tuner_count: 4,
            enable_ssdp: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    pub build_days: u32,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self { build_days: 2 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FfmpegConfig {
    pub path: PathBuf,
    pub default_hwaccel: Option<String>,
    pub startup_timeout_secs: u64,
    pub stall_timeout_secs: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ffmpeg"),
            default_hwaccel: None,
            startup_timeout_secs: 15,
            stall_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessPoolConfig {
    pub max_processes: usize,
    pub memory_budget_bytes: u64,
    pub fd_budget: u64,
    pub max_age_seconds: u64,
}

impl Default for ProcessPoolConfig {
    fn default() -> Self {
        Self {
            max_processes: 16,
            memory_budget_bytes: 4 * 1024 * 1024 * 1024,
            fd_budget: 512,
            max_age_seconds: 6 * 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    pub max_sessions_per_channel: usize,
    pub idle_timeout_seconds: u64,
    pub channel_idle_grace_seconds: u64,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_channel: 32,
            idle_timeout_seconds: 30,
            channel_idle_grace_seconds: 5,
        }
    }
}

impl SessionManagerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn channel_idle_grace(&self) -> Duration {
        Duration::from_secs(self.channel_idle_grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelfHealConfig {
    pub enabled: bool,
    pub max_auto_fixes_per_hour: u32,
    pub max_consecutive_failures: u32,
    pub require_approval_above_risk: u8,
    pub use_error_screen_fallback: bool,
}

impl Default for SelfHealConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_auto_fixes_per_hour: 12,
            max_consecutive_failures: 3,
            require_approval_above_risk: 2,
            use_error_screen_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseBackupConfig {
    pub enabled: bool,
    pub interval_hours: u32,
    pub keep_count: u32,
    pub keep_days: u32,
    pub compress: bool,
}

impl Default for DatabaseBackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: 24,
            keep_count: 7,
            keep_days: 30,
            compress: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub hdhomerun: HdhomerunConfig,
    pub playout: PlayoutConfig,
    pub ffmpeg: FfmpegConfig,
    pub process_pool: ProcessPoolConfig,
    pub session_manager: SessionManagerConfig,
    pub self_heal: SelfHealConfig,
    pub database_backup: DatabaseBackupConfig,
    /// Directory credential salts and other process state live in. Defaults
    /// to the parent directory of `database.path`.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            hdhomerun: HdhomerunConfig::default(),
            playout: PlayoutConfig::default(),
            ffmpeg: FfmpegConfig::default(),
            process_pool: ProcessPoolConfig::default(),
            session_manager: SessionManagerConfig::default(),
            self_heal: SelfHealConfig::default(),
            database_backup: DatabaseBackupConfig::default(),
            data_dir: None,
        }
    }
}

impl Config {
    /// Load from `path`, falling back to all-defaults if the file is absent.
    /// A file that exists but fails to parse is still an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Config::default()
        };
        config.apply_env_defaults();
        Ok(config)
    }

    /// Apply the CLI/env overrides named in SPEC_FULL.md §6 on top of whatever
    /// the YAML file specified.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = cli.host {
            self.server.host = host;
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(db_path) = &cli.db_path {
            self.database.path = db_path.clone();
        }
        if let Some(ffmpeg_path) = &cli.ffmpeg_path {
            self.ffmpeg.path = ffmpeg_path.clone();
        }
    }

    fn apply_env_defaults(&mut self) {
        // clap's `env` attribute only covers Cli; apply_cli is always called
        // right after load() in main, so this is a no-op placeholder kept for
        // the rare case callers construct a Config without going through Cli.
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            self.database
                .path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = Config::default();
        assert_eq!(config.server.port, 7777);
        assert_eq!(config.session_manager.idle_timeout_seconds, 30);
        assert_eq!(config.session_manager.channel_idle_grace_seconds, 5);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/config.yaml")).unwrap();
        assert_eq!(config.server.port, 7777);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server:\n  port: 9000\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.ffmpeg.stall_timeout_secs, 10);
    }

    #[test]
    fn data_dir_defaults_to_db_parent() {
        let mut config = Config::default();
        config.database.path = PathBuf::from("/var/lib/exstreamtv/db.sqlite");
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/exstreamtv"));
    }
}
