//! Daemon configuration.
//!
//! Everything has a usable default; `~/.histd/config.toml` (or the file named
//! by `HISTD_CONFIG`) only overrides what it mentions.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const HISTD_DIR: &str = ".histd";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_ENV: &str = "HISTD_CONFIG";
const SOCKET_ENV: &str = "HISTD_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const HISTORY_FILE: &str = "history.log";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub log_path: Option<PathBuf>,
    pub max_corrupt_lines: usize,
    /// Logs at least this large are trusted on their own; smaller ones are
    /// topped up from the native shell history files.
    pub bootstrap_min_bytes: u64,
    pub bash_history_path: Option<PathBuf>,
    pub zsh_history_path: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            max_corrupt_lines: 10,
            bootstrap_min_bytes: 2 * 1024 * 1024,
            bash_history_path: None,
            zsh_history_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-subscriber inbox size. 0 makes every send a rendezvous.
    pub channel_capacity: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl DispatchConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Resolved file locations for one daemon instance.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub socket: PathBuf,
    pub history_log: PathBuf,
    pub bash_history: PathBuf,
    pub zsh_history: PathBuf,
}

impl DaemonPaths {
    pub fn resolve(config: &DaemonConfig) -> Result<Self, String> {
        let home = home_dir()?;
        let socket = match env::var(SOCKET_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => home.join(HISTD_DIR).join(SOCKET_NAME),
        };
        let history_log = config
            .history
            .log_path
            .clone()
            .unwrap_or_else(|| home.join(HISTD_DIR).join(HISTORY_FILE));
        let bash_history = config
            .history
            .bash_history_path
            .clone()
            .unwrap_or_else(|| home.join(".bash_history"));
        let zsh_history = config
            .history
            .zsh_history_path
            .clone()
            .unwrap_or_else(|| home.join(".zsh_history"));

        Ok(Self {
            socket,
            history_log,
            bash_history,
            zsh_history,
        })
    }
}

fn home_dir() -> Result<PathBuf, String> {
    dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())
}

pub fn default_config_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(home_dir()?.join(HISTD_DIR).join(CONFIG_FILE))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse config {}: {}",
            config_path.display(),
            err
        )
    })
}
