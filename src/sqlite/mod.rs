// =====================================================
// SQLITE SOURCE DRIVER
// =====================================================

use crate::db_types::{CellValue, RowSet, SqlDialect};
use crate::driver::{first_value, parse_connection_string, SourceConnection, SourceDriver};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::ConnectOptions;
use sqlx::{Column, Pool, Row, Sqlite};
use std::str::FromStr;

const PATH_KEYS: &[&str] = &["data source", "database", "filename", "dbq", "server", "host"];

pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceDriver for SqliteDriver {
    fn identifiers(&self) -> &[&'static str] {
        &["sqlite", "sqlite3"]
    }

    async fn connect(&self, connection_string: &str) -> Result<Box<dyn SourceConnection>, String> {
        let db_path = database_path(connection_string)?;
        let options = build_connect_options(&db_path)?;

        // An in-memory database lives only as long as its single connection.
        let max_connections = if db_path == ":memory:" { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| format!("Failed to connect to SQLite database: {}", e))?;

        Ok(Box::new(SqliteConnection { pool }))
    }
}

pub(crate) fn database_path(connection_string: &str) -> Result<String, String> {
    let params = parse_connection_string(connection_string);
    match first_value(&params, PATH_KEYS) {
        Some(path) => Ok(path.to_string()),
        None => match first_value(&params, &["dsn"]) {
            Some(alias) => Err(format!(
                "Data source name '{}' is not configured on this host",
                alias
            )),
            None => Err("Database file path is required".to_string()),
        },
    }
}

fn build_connect_options(db_path: &str) -> Result<SqliteConnectOptions, String> {
    let options = if db_path == ":memory:" {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| format!("Invalid SQLite options: {}", e))?
    } else {
        // Source databases are read, never created.
        SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(false)
    };

    Ok(options.log_statements(log::LevelFilter::Debug))
}

struct SqliteConnection {
    pool: Pool<Sqlite>,
}

#[async_trait]
impl SourceConnection for SqliteConnection {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::LimitOffset
    }

    async fn ping(&self) -> Result<(), String> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| format!("Query failed: {}", e))
    }

    async fn query(&self, sql: &str) -> Result<RowSet, String> {
        let mut stream = sqlx::query(sql).fetch(&self.pool);
        let mut columns: Vec<String> = Vec::new();
        let mut values: Vec<Vec<CellValue>> = Vec::new();

        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| format!("Query execution failed: {}", e))?
        {
            if columns.is_empty() {
                columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            values.push(row_values(&row));
        }

        Ok(RowSet::from_values(columns, values))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_values(row: &SqliteRow) -> Vec<CellValue> {
    (0..row.columns().len())
        .map(|i| {
            if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(i) {
                CellValue::Integer(v)
            } else if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(i) {
                CellValue::Number(v)
            } else if let Ok(Some(v)) = row.try_get::<Option<String>, _>(i) {
                CellValue::Text(v)
            } else if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(i) {
                CellValue::Text(format!("0x{}", hex::encode(v)))
            } else {
                CellValue::Null
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_path_from_keys() {
        assert_eq!(
            database_path("Driver={SQLite3};Data Source=/var/erp.db").unwrap(),
            "/var/erp.db"
        );
        assert_eq!(
            database_path("Driver={sqlite};Server=/var/erp.db;Database=").unwrap(),
            "/var/erp.db"
        );
        assert!(database_path("DSN=Erp").unwrap_err().contains("Erp"));
        assert!(database_path("Driver={sqlite}").is_err());
    }

    #[tokio::test]
    async fn test_in_memory_query_types() {
        let conn = SqliteDriver::new()
            .connect("Data Source=:memory:")
            .await
            .unwrap();
        conn.ping().await.unwrap();

        let rows = conn
            .query("SELECT 7 AS id, 2.5 AS price, 'Ann' AS name, NULL AS note, x'0aff' AS raw")
            .await
            .unwrap();

        assert_eq!(rows.columns, vec!["id", "price", "name", "note", "raw"]);
        let row = &rows.rows[0];
        assert_eq!(row.get("id"), Some(&CellValue::Integer(7)));
        assert_eq!(row.get("price"), Some(&CellValue::Number(2.5)));
        assert_eq!(row.get("name"), Some(&CellValue::text("Ann")));
        assert_eq!(row.get("note"), Some(&CellValue::Null));
        assert_eq!(row.get("raw"), Some(&CellValue::text("0x0aff")));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_missing_file_is_not_created() {
        let path = std::env::temp_dir().join(format!("sqlbridge-absent-{}.db", uuid::Uuid::new_v4()));
        let result = SqliteDriver::new()
            .connect(&format!("Data Source={}", path.display()))
            .await;
        assert!(result.is_err());
        assert!(!path.exists());
    }
}
