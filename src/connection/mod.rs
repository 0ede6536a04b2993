// =====================================================
// CONNECTION RESOLVER
// Ordered connection-string candidates and the per-profile handle cache
// =====================================================

pub mod strategy;

use crate::config::ConnectionSettings;
use crate::db_types::SqlDialect;
use crate::driver::{parse_connection_string, DriverRegistry, SourceConnection, SourceDriver};
use crate::models::ConnectionProfile;
use crate::security::{redact_connection_string, redact_sensitive_text};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::timeout;

use self::strategy::{build_candidates, ConnectionStrategy};

/// Live session for one profile plus how it was obtained.
pub struct ConnectionHandle {
    pub profile_id: String,
    pub strategy: ConnectionStrategy,
    /// 1-based position of the winning candidate.
    pub attempt_index: usize,
    /// Redacted.
    pub connection_string: String,
    pub dialect: SqlDialect,
    pub connected_at: DateTime<Utc>,
    connection: Box<dyn SourceConnection>,
}

impl ConnectionHandle {
    pub fn new(
        profile_id: &str,
        strategy: ConnectionStrategy,
        attempt_index: usize,
        connection_string: String,
        connection: Box<dyn SourceConnection>,
    ) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            strategy,
            attempt_index,
            connection_string,
            dialect: connection.dialect(),
            connected_at: Utc::now(),
            connection,
        }
    }

    pub fn connection(&self) -> &dyn SourceConnection {
        self.connection.as_ref()
    }

    pub fn diagnostics(&self) -> ConnectionDiagnostics {
        ConnectionDiagnostics {
            profile_id: self.profile_id.clone(),
            strategy: self.strategy,
            attempt_index: self.attempt_index,
            connection_string: self.connection_string.clone(),
            dialect: self.dialect,
            connected_at: self.connected_at,
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("profile_id", &self.profile_id)
            .field("strategy", &self.strategy)
            .field("attempt_index", &self.attempt_index)
            .field("connection_string", &self.connection_string)
            .field("dialect", &self.dialect)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDiagnostics {
    pub profile_id: String,
    pub strategy: ConnectionStrategy,
    pub attempt_index: usize,
    pub connection_string: String,
    pub dialect: SqlDialect,
    pub connected_at: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub index: usize,
    pub strategy: ConnectionStrategy,
    pub connection_string: String,
    pub error: String,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DriverUnavailable,
    ServerUnreachable,
    CredentialsRejected,
    DatabaseNotFound,
    Timeout,
    Unknown,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DriverUnavailable => "driver_unavailable",
            Self::ServerUnreachable => "server_unreachable",
            Self::CredentialsRejected => "credentials_rejected",
            Self::DatabaseNotFound => "database_not_found",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    pub fn classify(error: &str) -> Self {
        let lower = error.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

        if has(&["timed out", "timeout"]) {
            Self::Timeout
        } else if has(&["login failed", "authentication", "access denied", "password", "18456"]) {
            Self::CredentialsRejected
        } else if has(&[
            "cannot open database",
            "unknown database",
            "unable to open database",
            "database file path",
            "does not exist",
            "4060",
        ]) {
            Self::DatabaseNotFound
        } else if has(&[
            "data source name",
            "no driver",
            "driver not found",
            "not configured on this host",
        ]) {
            Self::DriverUnavailable
        } else if has(&[
            "connection refused",
            "no such host",
            "could not resolve",
            "failed to lookup",
            "unreachable",
            "does not name a server",
            "connection reset",
            "os error",
        ]) {
            Self::ServerUnreachable
        } else {
            Self::Unknown
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::DriverUnavailable => {
                "Install the database driver or configure the data source name on this host."
            }
            Self::ServerUnreachable => {
                "Check the host, port and firewall rules, and that the database service is running."
            }
            Self::CredentialsRejected => "Verify the username and password for this connection.",
            Self::DatabaseNotFound => "Verify the database name or file path.",
            Self::Timeout => {
                "The server did not answer in time; check network latency or raise the timeout."
            }
            Self::Unknown => "Review the attempt log for the driver's error message.",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("No driver registered for '{driver}' (connection '{profile_id}')")]
    UnknownDriver { profile_id: String, driver: String },
    #[error("Connection '{profile_id}' has no usable connection settings")]
    NoCandidates { profile_id: String },
    #[error(
        "All {} connection attempt(s) for '{profile_id}' failed ({}): {last_error}",
        .attempts.len(),
        .reason.as_str()
    )]
    Exhausted {
        profile_id: String,
        reason: FailureReason,
        last_error: String,
        attempts: Vec<AttemptRecord>,
    },
}

type HandleSlot = Arc<Mutex<Option<Arc<ConnectionHandle>>>>;

pub struct ConnectionResolver {
    registry: Arc<DriverRegistry>,
    settings: ConnectionSettings,
    slots: Mutex<HashMap<String, HandleSlot>>,
}

impl ConnectionResolver {
    pub fn new(registry: Arc<DriverRegistry>, settings: ConnectionSettings) -> Self {
        Self {
            registry,
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached handle for `profile` when it still answers a probe,
    /// otherwise connects through the candidate list and caches the result.
    pub async fn resolve(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let slot = self.slot(&profile.id).await;
        let mut cached = slot.lock().await;

        if let Some(handle) = cached.as_ref() {
            let probe_timeout = self.settings.timeout_for_driver(&profile.driver);
            match timeout(probe_timeout, handle.connection().ping()).await {
                Ok(Ok(())) => return Ok(handle.clone()),
                Ok(Err(e)) => log::warn!(
                    "Cached connection for '{}' failed liveness probe: {}",
                    profile.id,
                    mask_secrets(&e, profile)
                ),
                Err(_) => log::warn!(
                    "Cached connection for '{}' did not answer liveness probe within {:?}",
                    profile.id,
                    probe_timeout
                ),
            }
            if let Some(stale) = cached.take() {
                stale.connection().close().await;
            }
        }

        let handle = Arc::new(self.connect(profile).await?);
        *cached = Some(handle.clone());
        Ok(handle)
    }

    /// Connects without touching the cache, probes, then closes.
    pub async fn probe_profile(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<ConnectionDiagnostics, ConnectionError> {
        let handle = self.connect(profile).await?;
        let probe = handle.connection().ping().await;
        let diagnostics = handle.diagnostics();
        handle.connection().close().await;

        match probe {
            Ok(()) => Ok(diagnostics),
            Err(e) => {
                let error = mask_secrets(&e, profile);
                Err(ConnectionError::Exhausted {
                    profile_id: profile.id.clone(),
                    reason: FailureReason::classify(&error),
                    last_error: error.clone(),
                    attempts: vec![AttemptRecord {
                        index: diagnostics.attempt_index,
                        strategy: diagnostics.strategy,
                        connection_string: diagnostics.connection_string,
                        error,
                    }],
                })
            }
        }
    }

    pub async fn invalidate(&self, profile_id: &str) -> bool {
        let slot = self.slots.lock().await.get(profile_id).cloned();
        let Some(slot) = slot else {
            return false;
        };
        let stale = slot.lock().await.take();
        match stale {
            Some(handle) => {
                handle.connection().close().await;
                log::info!("Invalidated cached connection for '{}'", profile_id);
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let slots: Vec<(String, HandleSlot)> = self.slots.lock().await.drain().collect();
        for (profile_id, slot) in slots {
            if let Some(handle) = slot.lock().await.take() {
                handle.connection().close().await;
                log::debug!("Closed connection for '{}'", profile_id);
            }
        }
    }

    /// Profiles with a cached handle. Slots busy connecting are not reported.
    pub async fn cached_profile_ids(&self) -> Vec<String> {
        let slots = self.slots.lock().await;
        let mut ids: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.try_lock().map(|h| h.is_some()).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn slot(&self, profile_id: &str) -> HandleSlot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(profile_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn driver_for(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Arc<dyn SourceDriver>, ConnectionError> {
        let identifier = if profile.driver.trim().is_empty() {
            profile
                .connection_string
                .as_deref()
                .map(parse_connection_string)
                .and_then(|params| params.get("driver").cloned())
                .unwrap_or_default()
        } else {
            profile.driver.clone()
        };

        self.registry
            .resolve(&identifier)
            .await
            .ok_or_else(|| ConnectionError::UnknownDriver {
                profile_id: profile.id.clone(),
                driver: identifier,
            })
    }

    async fn connect(&self, profile: &ConnectionProfile) -> Result<ConnectionHandle, ConnectionError> {
        let driver = self.driver_for(profile).await?;
        let candidates = build_candidates(profile, &self.settings.strategies);
        if candidates.is_empty() {
            return Err(ConnectionError::NoCandidates {
                profile_id: profile.id.clone(),
            });
        }

        let attempt_timeout = self.settings.timeout_for_driver(&profile.driver);
        let total = candidates.len();
        let mut attempts: Vec<AttemptRecord> = Vec::with_capacity(total);

        for (position, candidate) in candidates.into_iter().enumerate() {
            let index = position + 1;
            let redacted = mask_secrets(
                &redact_connection_string(&candidate.connection_string),
                profile,
            );
            log::debug!(
                "Connecting '{}' attempt {}/{} via {}: {}",
                profile.id,
                index,
                total,
                candidate.strategy.as_str(),
                redacted
            );

            let error = match timeout(attempt_timeout, driver.connect(&candidate.connection_string)).await {
                Ok(Ok(connection)) => {
                    log::info!(
                        "Connected '{}' on attempt {}/{} via {}",
                        profile.id,
                        index,
                        total,
                        candidate.strategy.as_str()
                    );
                    return Ok(ConnectionHandle::new(
                        &profile.id,
                        candidate.strategy,
                        index,
                        redacted,
                        connection,
                    ));
                }
                Ok(Err(e)) => mask_secrets(&e, profile),
                Err(_) => format!("Connection attempt timed out after {}s", attempt_timeout.as_secs()),
            };

            log::warn!(
                "Connection attempt {}/{} for '{}' via {} failed: {}",
                index,
                total,
                profile.id,
                candidate.strategy.as_str(),
                error
            );
            attempts.push(AttemptRecord {
                index,
                strategy: candidate.strategy,
                connection_string: redacted,
                error,
            });
        }

        let last_error = attempts
            .last()
            .map(|attempt| attempt.error.clone())
            .unwrap_or_default();
        let reason = FailureReason::classify(&last_error);
        log::error!(
            "All {} connection attempt(s) for '{}' failed ({}). {}",
            attempts.len(),
            profile.id,
            reason.as_str(),
            reason.suggestion()
        );

        Err(ConnectionError::Exhausted {
            profile_id: profile.id.clone(),
            reason,
            last_error,
            attempts,
        })
    }
}

/// Redacts key=value secrets and any literal occurrence of the profile password.
fn mask_secrets(text: &str, profile: &ConnectionProfile) -> String {
    let redacted = redact_sensitive_text(text);
    match profile.password.as_deref() {
        Some(password) if !password.is_empty() => redacted.replace(password, "[REDACTED]"),
        _ => redacted,
    }
}

#[cfg(test)]
mod tests;
