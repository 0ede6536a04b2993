// =====================================================
// CONFIGURATION STORE
// Profiles, queries, mappings, tasks and run history in SQLite
// =====================================================

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::crypto::{decrypt_secret_with_key, encrypt_secret_with_key};
use crate::models::{
    ColumnMapping, ConnectionProfile, DeliveryErrorKind, DeliveryOutcome, HttpMethod, LogLevel,
    OutputFormat, QueryDefinition, RunStatus, ScheduledTask, SyncLogEntry,
};
use crate::security::redact_sensitive_text;
use crate::transform::validate_mapping;

const ENCRYPTED_PREFIX: &str = "enc:v1:";
const RETENTION_DAYS_MIN: i64 = 1;
const RETENTION_DAYS_MAX: i64 = 3650;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    Invalid(String),
    #[error("Storage error: {0}")]
    Backend(String),
}

impl From<String> for StoreError {
    fn from(message: String) -> Self {
        Self::Backend(message)
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PurgeHistoryResult {
    pub retention_days: i64,
    pub cutoff_at: DateTime<Utc>,
    pub deleted_outcomes: i64,
    pub deleted_logs: i64,
}

/// What a sync firing reads and writes.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_connection_profile(&self, id: &str) -> Result<ConnectionProfile, StoreError>;
    async fn get_query_definition(&self, id: &str) -> Result<QueryDefinition, StoreError>;
    async fn get_column_mapping(&self, id: &str) -> Result<ColumnMapping, StoreError>;
    async fn get_column_mapping_for_query(
        &self,
        query_id: &str,
    ) -> Result<Option<ColumnMapping>, StoreError>;
    async fn get_scheduled_task(&self, id: &str) -> Result<ScheduledTask, StoreError>;
    async fn get_active_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError>;
    async fn record_last_run(
        &self,
        task_id: &str,
        at: DateTime<Utc>,
        status: RunStatus,
    ) -> Result<(), StoreError>;
    async fn append_log(
        &self,
        level: LogLevel,
        message: &str,
        task_id: Option<&str>,
    ) -> Result<(), StoreError>;
    async fn append_delivery_outcome(&self, outcome: &DeliveryOutcome) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct SqliteConfigStore {
    pool: Pool<Sqlite>,
    key: Option<Vec<u8>>,
}

impl SqliteConfigStore {
    /// Wraps an existing pool and creates the schema. Secrets are encrypted
    /// at rest when `key` is given.
    pub async fn new(pool: Pool<Sqlite>, key: Option<Vec<u8>>) -> Result<Self, String> {
        let store = Self { pool, key };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path, key: Option<Vec<u8>>) -> Result<Self, String> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
        }

        // sqlx requires the file to exist for a plain sqlite: URL
        if !db_path.exists() {
            fs::File::create(db_path).map_err(|e| e.to_string())?;
        }
        let db_url = format!("sqlite:{}", db_path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(|e| format!("Failed to open configuration store: {}", e))?;

        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(|e| format!("Failed to set WAL mode: {}", e))?;

        log::info!("Opened configuration store at {}", db_path.display());
        Self::new(pool, key).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<(), String> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connection_profiles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                driver TEXT NOT NULL,
                host TEXT NOT NULL DEFAULT '',
                port INTEGER,
                database_name TEXT NOT NULL DEFAULT '',
                username TEXT NOT NULL DEFAULT '',
                password TEXT,
                extra_params TEXT NOT NULL DEFAULT '{}',
                connection_string TEXT,
                dsn TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS query_definitions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                sql_text TEXT NOT NULL,
                connection_id TEXT NOT NULL,
                output_format TEXT NOT NULL DEFAULT 'rows',
                transformation_hint TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS column_mappings (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                query_id TEXT NOT NULL,
                columns TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                cron_expression TEXT NOT NULL,
                query_id TEXT NOT NULL,
                mapping_id TEXT,
                destination_url TEXT NOT NULL,
                method TEXT,
                headers TEXT NOT NULL DEFAULT '{}',
                api_key TEXT,
                max_retries INTEGER,
                active INTEGER NOT NULL DEFAULT 1,
                last_run_at INTEGER,
                last_run_status TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS delivery_outcomes (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                record_count INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL,
                status_code INTEGER,
                error_kind TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS sync_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                task_id TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_column_mappings_query ON column_mappings(query_id, updated_at DESC);
            CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_active ON scheduled_tasks(active);
            CREATE INDEX IF NOT EXISTS idx_delivery_outcomes_task_created ON delivery_outcomes(task_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_sync_logs_created ON sync_logs(created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to init configuration schema: {}", e))?;

        Ok(())
    }

    // --- Secrets ---

    fn seal(&self, secret: Option<&str>) -> Result<Option<String>, String> {
        match (secret, &self.key) {
            (None, _) => Ok(None),
            (Some(value), Some(key)) if !value.is_empty() => Ok(Some(format!(
                "{}{}",
                ENCRYPTED_PREFIX,
                encrypt_secret_with_key(value, key)?
            ))),
            (Some(value), _) => Ok(Some(value.to_string())),
        }
    }

    fn open_secret(&self, stored: Option<String>) -> Result<Option<String>, String> {
        let Some(stored) = stored else {
            return Ok(None);
        };
        match stored.strip_prefix(ENCRYPTED_PREFIX) {
            Some(sealed) => {
                let key = self
                    .key
                    .as_ref()
                    .ok_or_else(|| "Stored secret is encrypted but no key is loaded".to_string())?;
                decrypt_secret_with_key(sealed, key).map(Some)
            }
            None => Ok(Some(stored)),
        }
    }

    // --- Connection Profiles ---

    pub async fn save_connection_profile(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<ConnectionProfile, StoreError> {
        profile.validate().map_err(StoreError::Invalid)?;
        let now = Utc::now().timestamp_millis();
        let extra_params = serde_json::to_string(&profile.extra_params)
            .map_err(|e| format!("Failed to encode extra params: {}", e))?;

        sqlx::query(
            r#"
            INSERT INTO connection_profiles (
                id, name, driver, host, port, database_name, username, password,
                extra_params, connection_string, dsn, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                driver = excluded.driver,
                host = excluded.host,
                port = excluded.port,
                database_name = excluded.database_name,
                username = excluded.username,
                password = excluded.password,
                extra_params = excluded.extra_params,
                connection_string = excluded.connection_string,
                dsn = excluded.dsn,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.name)
        .bind(&profile.driver)
        .bind(&profile.host)
        .bind(profile.port.map(i64::from))
        .bind(&profile.database)
        .bind(&profile.username)
        .bind(self.seal(profile.password.as_deref())?)
        .bind(extra_params)
        .bind(self.seal(profile.connection_string.as_deref())?)
        .bind(&profile.dsn)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to save connection profile: {}", e))?;

        log::info!("Saved connection profile '{}'", profile.id);
        Ok(profile.clone())
    }

    pub async fn list_connection_profiles(&self) -> Result<Vec<ConnectionProfile>, StoreError> {
        let rows = sqlx::query("SELECT * FROM connection_profiles ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to list connection profiles: {}", e))?;
        rows.iter()
            .map(|row| self.row_to_profile(row).map_err(StoreError::from))
            .collect()
    }

    pub async fn delete_connection_profile(&self, id: &str) -> Result<bool, StoreError> {
        self.delete_by_id("connection_profiles", id).await
    }

    // --- Query Definitions ---

    pub async fn save_query_definition(
        &self,
        query: &QueryDefinition,
    ) -> Result<QueryDefinition, StoreError> {
        query.validate().map_err(StoreError::Invalid)?;
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO query_definitions (
                id, name, sql_text, connection_id, output_format, transformation_hint,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                sql_text = excluded.sql_text,
                connection_id = excluded.connection_id,
                output_format = excluded.output_format,
                transformation_hint = excluded.transformation_hint,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&query.id)
        .bind(&query.name)
        .bind(&query.sql)
        .bind(&query.connection_id)
        .bind(query.output_format.as_str())
        .bind(&query.transformation_hint)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to save query definition: {}", e))?;

        Ok(query.clone())
    }

    pub async fn list_query_definitions(&self) -> Result<Vec<QueryDefinition>, StoreError> {
        let rows = sqlx::query("SELECT * FROM query_definitions ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to list query definitions: {}", e))?;
        rows.iter()
            .map(|row| Self::row_to_query(row).map_err(StoreError::from))
            .collect()
    }

    /// Deletes the query together with the mappings it owns.
    pub async fn delete_query_definition(&self, id: &str) -> Result<bool, StoreError> {
        sqlx::query("DELETE FROM column_mappings WHERE query_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to delete mappings of query: {}", e))?;
        self.delete_by_id("query_definitions", id).await
    }

    // --- Column Mappings ---

    pub async fn save_column_mapping(
        &self,
        mapping: &ColumnMapping,
    ) -> Result<ColumnMapping, StoreError> {
        if mapping.id.trim().is_empty() {
            return Err(StoreError::Invalid("Mapping id is required".to_string()));
        }
        validate_mapping(mapping).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let now = Utc::now().timestamp_millis();
        let columns = serde_json::to_string(&mapping.columns)
            .map_err(|e| format!("Failed to encode mapping columns: {}", e))?;

        sqlx::query(
            r#"
            INSERT INTO column_mappings (id, name, query_id, columns, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                query_id = excluded.query_id,
                columns = excluded.columns,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&mapping.id)
        .bind(&mapping.name)
        .bind(&mapping.query_id)
        .bind(columns)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to save column mapping: {}", e))?;

        Ok(mapping.clone())
    }

    pub async fn list_column_mappings(&self) -> Result<Vec<ColumnMapping>, StoreError> {
        let rows = sqlx::query("SELECT * FROM column_mappings ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to list column mappings: {}", e))?;
        rows.iter()
            .map(|row| Self::row_to_mapping(row).map_err(StoreError::from))
            .collect()
    }

    pub async fn delete_column_mapping(&self, id: &str) -> Result<bool, StoreError> {
        self.delete_by_id("column_mappings", id).await
    }

    // --- Scheduled Tasks ---

    pub async fn save_scheduled_task(
        &self,
        task: &ScheduledTask,
    ) -> Result<ScheduledTask, StoreError> {
        task.validate().map_err(StoreError::Invalid)?;
        let now = Utc::now().timestamp_millis();
        let headers = serde_json::to_string(&task.headers)
            .map_err(|e| format!("Failed to encode task headers: {}", e))?;

        // Last-run fields belong to the scheduler and are kept on update.
        sqlx::query(
            r#"
            INSERT INTO scheduled_tasks (
                id, name, cron_expression, query_id, mapping_id, destination_url, method,
                headers, api_key, max_retries, active, last_run_at, last_run_status,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                cron_expression = excluded.cron_expression,
                query_id = excluded.query_id,
                mapping_id = excluded.mapping_id,
                destination_url = excluded.destination_url,
                method = excluded.method,
                headers = excluded.headers,
                api_key = excluded.api_key,
                max_retries = excluded.max_retries,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(task.cron_expression.trim())
        .bind(&task.query_id)
        .bind(&task.mapping_id)
        .bind(task.destination_url.trim())
        .bind(task.method.map(|m| m.as_str()))
        .bind(headers)
        .bind(self.seal(task.api_key.as_deref())?)
        .bind(task.max_retries.map(i64::from))
        .bind(task.active)
        .bind(task.last_run_at.map(|at| at.timestamp_millis()))
        .bind(task.last_run_status.as_ref().map(|s| s.as_str()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to save scheduled task: {}", e))?;

        log::info!("Saved scheduled task '{}' ({})", task.id, task.cron_expression);
        self.get_scheduled_task(&task.id).await
    }

    pub async fn list_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to list scheduled tasks: {}", e))?;
        rows.iter()
            .map(|row| self.row_to_task(row).map_err(StoreError::from))
            .collect()
    }

    pub async fn delete_scheduled_task(&self, id: &str) -> Result<bool, StoreError> {
        self.delete_by_id("scheduled_tasks", id).await
    }

    // --- History ---

    pub async fn list_delivery_outcomes(
        &self,
        task_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<DeliveryOutcome>, StoreError> {
        let limit = limit.clamp(1, 1000);
        let rows = match task_id {
            Some(task_id) => {
                sqlx::query(
                    "SELECT * FROM delivery_outcomes WHERE task_id = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(task_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM delivery_outcomes ORDER BY created_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| format!("Failed to list delivery outcomes: {}", e))?;

        rows.iter()
            .map(|row| Self::row_to_outcome(row).map_err(StoreError::from))
            .collect()
    }

    pub async fn list_logs(&self, limit: i64) -> Result<Vec<SyncLogEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sync_logs ORDER BY id DESC LIMIT ?")
            .bind(limit.clamp(1, 5000))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to list sync logs: {}", e))?;

        rows.iter()
            .map(|row| Self::row_to_log(row).map_err(StoreError::from))
            .collect()
    }

    pub async fn purge_history(&self, retention_days: i64) -> Result<PurgeHistoryResult, StoreError> {
        if !(RETENTION_DAYS_MIN..=RETENTION_DAYS_MAX).contains(&retention_days) {
            return Err(StoreError::Invalid(format!(
                "retention_days must be between {} and {}",
                RETENTION_DAYS_MIN, RETENTION_DAYS_MAX
            )));
        }

        let cutoff_at = Utc::now() - Duration::days(retention_days);
        let cutoff_ms = cutoff_at.timestamp_millis();

        let deleted_outcomes = sqlx::query("DELETE FROM delivery_outcomes WHERE created_at < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to purge delivery outcomes: {}", e))?;

        let deleted_logs = sqlx::query("DELETE FROM sync_logs WHERE created_at < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to purge sync logs: {}", e))?;

        Ok(PurgeHistoryResult {
            retention_days,
            cutoff_at,
            deleted_outcomes: deleted_outcomes.rows_affected() as i64,
            deleted_logs: deleted_logs.rows_affected() as i64,
        })
    }

    async fn delete_by_id(&self, table: &str, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", table))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to delete from {}: {}", table, e))?;
        Ok(result.rows_affected() > 0)
    }

    // --- Row decoding ---

    fn row_to_profile(&self, row: &sqlx::sqlite::SqliteRow) -> Result<ConnectionProfile, String> {
        let extra_params_str: String = row
            .try_get("extra_params")
            .unwrap_or_else(|_| "{}".to_string());
        let extra_params: BTreeMap<String, String> = serde_json::from_str(&extra_params_str)
            .map_err(|e| format!("Failed to decode extra params: {}", e))?;
        let port: Option<i64> = row.try_get("port").map_err(|e| e.to_string())?;

        Ok(ConnectionProfile {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            name: row.try_get("name").map_err(|e| e.to_string())?,
            driver: row.try_get("driver").map_err(|e| e.to_string())?,
            host: row.try_get("host").map_err(|e| e.to_string())?,
            port: port.and_then(|p| u16::try_from(p).ok()),
            database: row.try_get("database_name").map_err(|e| e.to_string())?,
            username: row.try_get("username").map_err(|e| e.to_string())?,
            password: self.open_secret(row.try_get("password").map_err(|e| e.to_string())?)?,
            extra_params,
            connection_string: self
                .open_secret(row.try_get("connection_string").map_err(|e| e.to_string())?)?,
            dsn: row.try_get("dsn").map_err(|e| e.to_string())?,
        })
    }

    fn row_to_query(row: &sqlx::sqlite::SqliteRow) -> Result<QueryDefinition, String> {
        Ok(QueryDefinition {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            name: row.try_get("name").map_err(|e| e.to_string())?,
            sql: row.try_get("sql_text").map_err(|e| e.to_string())?,
            connection_id: row.try_get("connection_id").map_err(|e| e.to_string())?,
            output_format: OutputFormat::from_db(
                &row.try_get::<String, _>("output_format")
                    .map_err(|e| e.to_string())?,
            )?,
            transformation_hint: row.try_get("transformation_hint").map_err(|e| e.to_string())?,
        })
    }

    fn row_to_mapping(row: &sqlx::sqlite::SqliteRow) -> Result<ColumnMapping, String> {
        let columns_str: String = row.try_get("columns").unwrap_or_else(|_| "[]".to_string());
        Ok(ColumnMapping {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            name: row.try_get("name").map_err(|e| e.to_string())?,
            query_id: row.try_get("query_id").map_err(|e| e.to_string())?,
            columns: serde_json::from_str(&columns_str)
                .map_err(|e| format!("Failed to decode mapping columns: {}", e))?,
        })
    }

    fn row_to_task(&self, row: &sqlx::sqlite::SqliteRow) -> Result<ScheduledTask, String> {
        let headers_str: String = row.try_get("headers").unwrap_or_else(|_| "{}".to_string());
        let method = row
            .try_get::<Option<String>, _>("method")
            .map_err(|e| e.to_string())?
            .map(|value| HttpMethod::from_db(&value))
            .transpose()?;
        let last_run_status = row
            .try_get::<Option<String>, _>("last_run_status")
            .ok()
            .flatten()
            .map(|value| RunStatus::from_db(&value))
            .transpose()?;
        let last_run_at = row
            .try_get::<Option<i64>, _>("last_run_at")
            .ok()
            .flatten()
            .map(millis_to_datetime);
        let max_retries: Option<i64> = row.try_get("max_retries").map_err(|e| e.to_string())?;

        Ok(ScheduledTask {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            name: row.try_get("name").map_err(|e| e.to_string())?,
            cron_expression: row.try_get("cron_expression").map_err(|e| e.to_string())?,
            query_id: row.try_get("query_id").map_err(|e| e.to_string())?,
            mapping_id: row.try_get("mapping_id").map_err(|e| e.to_string())?,
            destination_url: row.try_get("destination_url").map_err(|e| e.to_string())?,
            method,
            headers: serde_json::from_str(&headers_str)
                .map_err(|e| format!("Failed to decode task headers: {}", e))?,
            api_key: self.open_secret(row.try_get("api_key").map_err(|e| e.to_string())?)?,
            max_retries: max_retries.and_then(|n| u32::try_from(n).ok()),
            active: row.try_get("active").map_err(|e| e.to_string())?,
            last_run_at,
            last_run_status,
        })
    }

    fn row_to_outcome(row: &sqlx::sqlite::SqliteRow) -> Result<DeliveryOutcome, String> {
        let error_kind = row
            .try_get::<Option<String>, _>("error_kind")
            .map_err(|e| e.to_string())?
            .map(|value| DeliveryErrorKind::from_db(&value))
            .transpose()?;
        let status_code: Option<i64> = row.try_get("status_code").map_err(|e| e.to_string())?;
        let record_count: i64 = row.try_get("record_count").map_err(|e| e.to_string())?;
        let retry_count: i64 = row.try_get("retry_count").map_err(|e| e.to_string())?;
        let attempts: i64 = row.try_get("attempts").map_err(|e| e.to_string())?;

        Ok(DeliveryOutcome {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            task_id: row.try_get("task_id").map_err(|e| e.to_string())?,
            timestamp: millis_to_datetime(row.try_get("created_at").map_err(|e| e.to_string())?),
            record_count: record_count.max(0) as usize,
            success: row.try_get("success").map_err(|e| e.to_string())?,
            status_code: status_code.and_then(|code| u16::try_from(code).ok()),
            error_kind,
            error_message: row.try_get("error_message").map_err(|e| e.to_string())?,
            retry_count: retry_count.max(0) as u32,
            attempts: attempts.max(0) as u32,
            duration_ms: row.try_get("duration_ms").map_err(|e| e.to_string())?,
        })
    }

    fn row_to_log(row: &sqlx::sqlite::SqliteRow) -> Result<SyncLogEntry, String> {
        Ok(SyncLogEntry {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            level: LogLevel::from_db(
                &row.try_get::<String, _>("level").map_err(|e| e.to_string())?,
            )?,
            message: row.try_get("message").map_err(|e| e.to_string())?,
            task_id: row.try_get("task_id").map_err(|e| e.to_string())?,
            created_at: millis_to_datetime(row.try_get("created_at").map_err(|e| e.to_string())?),
        })
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn get_connection_profile(&self, id: &str) -> Result<ConnectionProfile, StoreError> {
        let row = sqlx::query("SELECT * FROM connection_profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| format!("Failed to fetch connection profile: {}", e))?;
        match row {
            Some(row) => Ok(self.row_to_profile(&row)?),
            None => Err(StoreError::NotFound {
                entity: "Connection profile",
                id: id.to_string(),
            }),
        }
    }

    async fn get_query_definition(&self, id: &str) -> Result<QueryDefinition, StoreError> {
        let row = sqlx::query("SELECT * FROM query_definitions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| format!("Failed to fetch query definition: {}", e))?;
        match row {
            Some(row) => Ok(Self::row_to_query(&row)?),
            None => Err(StoreError::NotFound {
                entity: "Query",
                id: id.to_string(),
            }),
        }
    }

    async fn get_column_mapping(&self, id: &str) -> Result<ColumnMapping, StoreError> {
        let row = sqlx::query("SELECT * FROM column_mappings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| format!("Failed to fetch column mapping: {}", e))?;
        match row {
            Some(row) => Ok(Self::row_to_mapping(&row)?),
            None => Err(StoreError::NotFound {
                entity: "Column mapping",
                id: id.to_string(),
            }),
        }
    }

    async fn get_column_mapping_for_query(
        &self,
        query_id: &str,
    ) -> Result<Option<ColumnMapping>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM column_mappings WHERE query_id = ? ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(query_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| format!("Failed to fetch mapping for query: {}", e))?;
        match row {
            Some(row) => Ok(Some(Self::row_to_mapping(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_scheduled_task(&self, id: &str) -> Result<ScheduledTask, StoreError> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| format!("Failed to fetch scheduled task: {}", e))?;
        match row {
            Some(row) => Ok(self.row_to_task(&row)?),
            None => Err(StoreError::NotFound {
                entity: "Scheduled task",
                id: id.to_string(),
            }),
        }
    }

    async fn get_active_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks WHERE active = 1 ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to list active tasks: {}", e))?;
        rows.iter()
            .map(|row| self.row_to_task(row).map_err(StoreError::from))
            .collect()
    }

    async fn record_last_run(
        &self,
        task_id: &str,
        at: DateTime<Utc>,
        status: RunStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE scheduled_tasks SET last_run_at = ?, last_run_status = ? WHERE id = ?",
        )
        .bind(at.timestamp_millis())
        .bind(status.as_str())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to record last run: {}", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "Scheduled task",
                id: task_id.to_string(),
            });
        }
        Ok(())
    }

    async fn append_log(
        &self,
        level: LogLevel,
        message: &str,
        task_id: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO sync_logs (level, message, task_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(level.as_str())
            .bind(redact_sensitive_text(message))
            .bind(task_id)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to append sync log: {}", e))?;
        Ok(())
    }

    async fn append_delivery_outcome(&self, outcome: &DeliveryOutcome) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_outcomes (
                id, task_id, created_at, record_count, success, status_code, error_kind,
                error_message, retry_count, attempts, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&outcome.id)
        .bind(&outcome.task_id)
        .bind(outcome.timestamp.timestamp_millis())
        .bind(outcome.record_count as i64)
        .bind(outcome.success)
        .bind(outcome.status_code.map(i64::from))
        .bind(outcome.error_kind.as_ref().map(|kind| kind.as_str()))
        .bind(
            outcome
                .error_message
                .as_deref()
                .map(redact_sensitive_text),
        )
        .bind(i64::from(outcome.retry_count))
        .bind(i64::from(outcome.attempts))
        .bind(outcome.duration_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to append delivery outcome: {}", e))?;
        Ok(())
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests;
