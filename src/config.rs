// =====================================================
// RUNTIME CONFIGURATION
// Global defaults loaded from config.json plus environment overrides
// =====================================================

use crate::connection::strategy::{ConnectionStrategy, DEFAULT_STRATEGY_ORDER};
use crate::models::HttpMethod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR_NAME: &str = "sqlbridge";
const CONFIG_ENV: &str = "SQLBRIDGE_CONFIG";
const API_KEY_ENV: &str = "SQLBRIDGE_API_KEY";
const API_URL_ENV: &str = "SQLBRIDGE_API_URL";
const DB_PATH_ENV: &str = "SQLBRIDGE_DB_PATH";
const LOG_ENV: &str = "SQLBRIDGE_LOG";

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub api: ApiSettings,
    pub connection: ConnectionSettings,
    pub query: QuerySettings,
    pub scheduler: SchedulerSettings,
    pub storage: StorageSettings,
    pub log_level: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    /// Prefix for task destinations given as relative paths.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub default_method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub strip_embedded_timestamps: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            default_method: HttpMethod::Post,
            headers: BTreeMap::new(),
            request_timeout_secs: 60,
            max_retries: 3,
            backoff_base_ms: 1000,
            strip_embedded_timestamps: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    pub strategies: Vec<ConnectionStrategy>,
    /// Driver identifiers (case-insensitive substrings) known to start slowly.
    pub slow_drivers: Vec<String>,
    pub slow_timeout_secs: u64,
    pub default_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            strategies: DEFAULT_STRATEGY_ORDER.to_vec(),
            slow_drivers: vec![
                "progress".to_string(),
                "openedge".to_string(),
                "firebird".to_string(),
                "informix".to_string(),
                "access".to_string(),
            ],
            slow_timeout_secs: 60,
            default_timeout_secs: 30,
        }
    }
}

impl ConnectionSettings {
    pub fn timeout_for_driver(&self, driver: &str) -> Duration {
        let normalized = driver.to_ascii_lowercase();
        let slow = self
            .slow_drivers
            .iter()
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .any(|value| normalized.contains(&value));
        if slow {
            Duration::from_secs(self.slow_timeout_secs)
        } else {
            Duration::from_secs(self.default_timeout_secs)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct QuerySettings {
    pub timeout_secs: Option<u64>,
    pub preview_row_limit: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            timeout_secs: Some(300),
            preview_row_limit: 100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleTimezone {
    #[default]
    Utc,
    Local,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    pub system_sync_enabled: bool,
    pub system_sync_interval_minutes: u64,
    pub timezone: ScheduleTimezone,
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            system_sync_enabled: false,
            system_sync_interval_minutes: 60,
            timezone: ScheduleTimezone::Utc,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub database_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub history_retention_days: i64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            key_path: None,
            history_retention_days: 30,
        }
    }
}

impl SyncConfig {
    /// Reads `$SQLBRIDGE_CONFIG` or `<data dir>/sqlbridge/config.json`, then
    /// applies environment overrides. A missing file yields defaults.
    pub fn load() -> Result<Self, String> {
        let path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| app_data_dir().join("config.json"));
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            log::info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, String> {
        serde_json::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(key) = env_value(API_KEY_ENV) {
            self.api.api_key = Some(key);
        }
        if let Some(url) = env_value(API_URL_ENV) {
            self.api.base_url = Some(url);
        }
        if let Some(path) = env_value(DB_PATH_ENV) {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(level) = env_value(LOG_ENV) {
            self.log_level = Some(level);
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.api.request_timeout_secs == 0 {
            return Err("api.requestTimeoutSecs must be > 0".to_string());
        }
        if self.connection.strategies.is_empty() {
            return Err("connection.strategies must list at least one strategy".to_string());
        }
        if self.connection.default_timeout_secs == 0 || self.connection.slow_timeout_secs == 0 {
            return Err("connection timeouts must be > 0".to_string());
        }
        if self.scheduler.system_sync_enabled && self.scheduler.system_sync_interval_minutes == 0 {
            return Err("scheduler.systemSyncIntervalMinutes must be > 0".to_string());
        }
        if self.storage.history_retention_days < 1 {
            return Err("storage.historyRetentionDays must be >= 1".to_string());
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| app_data_dir().join("sqlbridge.db"))
    }

    pub fn key_path(&self) -> PathBuf {
        self.storage
            .key_path
            .clone()
            .unwrap_or_else(|| app_data_dir().join("encryption.key"))
    }

    pub fn log_filter(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }
}

pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
