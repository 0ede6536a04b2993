// =====================================================
// DRIVER LAYER
// Connection-string driver seam and the registry resolving driver identifiers
// =====================================================

use crate::db_types::{RowSet, SqlDialect};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Live session opened from a connection string.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    /// Cheap round-trip used as a liveness probe.
    async fn ping(&self) -> Result<(), String>;

    /// Runs one statement and returns its first result set.
    async fn query(&self, sql: &str) -> Result<RowSet, String>;

    async fn close(&self);
}

#[async_trait]
pub trait SourceDriver: Send + Sync {
    /// Lowercase identifiers this driver answers to, e.g. `"sql server"`.
    fn identifiers(&self) -> &[&'static str];

    async fn connect(&self, connection_string: &str) -> Result<Box<dyn SourceConnection>, String>;
}

pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn SourceDriver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in SQL Server and SQLite drivers.
    pub async fn with_defaults() -> Self {
        let registry = Self::new();
        registry
            .register(Arc::new(crate::mssql::MssqlDriver::new()))
            .await;
        registry
            .register(Arc::new(crate::sqlite::SqliteDriver::new()))
            .await;
        registry
    }

    pub async fn register(&self, driver: Arc<dyn SourceDriver>) {
        let mut drivers = self.drivers.write().await;
        for identifier in driver.identifiers() {
            drivers.insert(normalize_identifier(identifier), driver.clone());
        }
        log::debug!("Registered driver for {:?}", driver.identifiers());
    }

    /// Exact match on the normalized identifier, then the longest registered
    /// identifier contained in it (`"ODBC Driver 17 for SQL Server"` → `sql server`).
    pub async fn resolve(&self, identifier: &str) -> Option<Arc<dyn SourceDriver>> {
        let normalized = normalize_identifier(identifier);
        if normalized.is_empty() {
            return None;
        }

        let drivers = self.drivers.read().await;
        if let Some(driver) = drivers.get(&normalized) {
            return Some(driver.clone());
        }

        drivers
            .iter()
            .filter(|(key, _)| normalized.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, driver)| driver.clone())
    }

    pub async fn identifiers(&self) -> Vec<String> {
        let drivers = self.drivers.read().await;
        let mut keys: Vec<String> = drivers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_identifier(identifier: &str) -> String {
    identifier
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

/// Splits a `key=value;key=value` string into lowercase keys. Values may be
/// wrapped in braces to carry `;` or `=`.
pub fn parse_connection_string(input: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut chars = input.chars().peekable();

    loop {
        let mut key = String::new();
        let mut has_value = false;
        for c in chars.by_ref() {
            if c == '=' {
                has_value = true;
                break;
            }
            if c == ';' {
                key.clear();
                continue;
            }
            key.push(c);
        }
        if !has_value {
            break;
        }

        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            while let Some(c) = chars.next() {
                if c == '}' {
                    if chars.peek() == Some(&'}') {
                        chars.next();
                        value.push('}');
                        continue;
                    }
                    break;
                }
                value.push(c);
            }
            for c in chars.by_ref() {
                if c == ';' {
                    break;
                }
            }
        } else {
            for c in chars.by_ref() {
                if c == ';' {
                    break;
                }
                value.push(c);
            }
        }

        let key = key.trim().to_ascii_lowercase();
        if !key.is_empty() {
            out.insert(key, value.trim().to_string());
        }

        if chars.peek().is_none() {
            break;
        }
    }

    out
}

/// First non-empty value among `keys`.
pub fn first_value<'a>(params: &'a BTreeMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| params.get(*key))
        .map(String::as_str)
        .find(|value| !value.is_empty())
}
