use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            unix_socket: None,
            host: Some("127.0.0.1:8080".to_string()),
            path: "/api/v1".to_string(),
            timeout: 30,
        }
    }
}

/// Identities used for device ownership.
///
/// Any owner equal to `rpc_identity` is rewritten to `identity` before it is
/// stored or compared.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ModuleConfig {
    pub identity: String,
    pub rpc_identity: String,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            identity: "gpios".to_string(),
            rpc_identity: "rpcserver".to_string(),
        }
    }
}

impl ModuleConfig {
    pub fn normalize_owner(&self, owner: &str) -> String {
        if owner == self.rpc_identity {
            self.identity.clone()
        } else {
            owner.to_string()
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BoardConfig {
    pub chip: String,
    pub revision: u32,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            chip: "/dev/gpiochip0".to_string(),
            revision: 3,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    /// Consecutive reads a new level must survive before it is accepted.
    pub debounce_ticks: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            debounce_ticks: 1,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub module: ModuleConfig,
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub devices_path: Option<String>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_event_history_capacity() -> usize {
    32
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            module: ModuleConfig::default(),
            board: BoardConfig::default(),
            watcher: WatcherConfig::default(),
            devices_path: None,
            broadcast_capacity: default_broadcast_capacity(),
            event_history_capacity: default_event_history_capacity(),
        }
    }
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;

        if config.broadcast_capacity == 0 {
            return Err(AppError::Config(
                "broadcast_capacity must be greater than 0".into(),
            ));
        }
        if config.module.identity.is_empty() {
            return Err(AppError::Config("module identity must not be empty".into()));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_take_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.module.identity, "gpios");
        assert_eq!(config.board.revision, 3);
        assert_eq!(config.watcher.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.broadcast_capacity, 64);
        assert!(config.devices_path.is_none());
    }

    #[test]
    fn rpc_owner_is_normalized() {
        let module = ModuleConfig::default();

        assert_eq!(module.normalize_owner("rpcserver"), "gpios");
        assert_eq!(module.normalize_owner("sensors"), "sensors");
    }

    #[test]
    fn zero_broadcast_capacity_is_rejected() {
        let path = std::env::temp_dir().join(format!("gpios-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"broadcast_capacity": 0}"#).unwrap();

        assert!(matches!(
            AppConfig::load_from_file(&path),
            Err(AppError::Config(_))
        ));
        let _ = fs::remove_file(&path);
    }
}
