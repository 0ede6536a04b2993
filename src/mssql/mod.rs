// =====================================================
// MSSQL SOURCE DRIVER (via Tiberius)
// =====================================================

use crate::db_types::{CellValue, RowSet, SqlDialect};
use crate::driver::{first_value, parse_connection_string, SourceConnection, SourceDriver};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use futures::TryStreamExt;
use tiberius::{AuthMethod, Client, Config, QueryItem, Row};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

const DEFAULT_PORT: u16 = 1433;

const SERVER_KEYS: &[&str] = &["server", "data source", "address", "addr", "host"];
const DATABASE_KEYS: &[&str] = &["database", "initial catalog", "db"];
const USER_KEYS: &[&str] = &["uid", "user id", "user", "username"];
const PASSWORD_KEYS: &[&str] = &["pwd", "password"];

pub struct MssqlDriver;

impl MssqlDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MssqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceDriver for MssqlDriver {
    fn identifiers(&self) -> &[&'static str] {
        &["sql server", "sqlserver", "mssql"]
    }

    async fn connect(&self, connection_string: &str) -> Result<Box<dyn SourceConnection>, String> {
        let tiberius_config = build_config(connection_string)?;

        let tcp = TcpStream::connect(tiberius_config.get_addr())
            .await
            .map_err(|e| e.to_string())?;
        tcp.set_nodelay(true).map_err(|e| e.to_string())?;

        let client = Client::connect(tiberius_config, tcp.compat_write())
            .await
            .map_err(|e| e.to_string())?;

        Ok(Box::new(MssqlConnection {
            client: Mutex::new(Some(client)),
        }))
    }
}

/// Endpoint pieces pulled out of an ADO/ODBC-style connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MssqlTarget {
    pub host: String,
    pub instance: Option<String>,
    pub port: u16,
    pub database: Option<String>,
    pub username: String,
    pub password: String,
}

pub(crate) fn parse_target(connection_string: &str) -> Result<MssqlTarget, String> {
    let params = parse_connection_string(connection_string);

    let Some(server) = first_value(&params, SERVER_KEYS) else {
        return Err(match first_value(&params, &["dsn"]) {
            Some(alias) => format!(
                "Data source name '{}' is not configured on this host",
                alias
            ),
            None => "Connection string does not name a server".to_string(),
        });
    };

    let server = server.strip_prefix("tcp:").unwrap_or(server);
    let (endpoint, inline_port) = match server.split_once(',') {
        Some((endpoint, port)) => (endpoint.trim(), Some(port.trim())),
        None => (server.trim(), None),
    };
    let (host, instance) = match endpoint.split_once('\\') {
        Some((host, instance)) => (host.to_string(), Some(instance.to_string())),
        None => (endpoint.to_string(), None),
    };

    let port = match inline_port.or_else(|| first_value(&params, &["port"])) {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| format!("Invalid port '{}'", raw))?,
        None => DEFAULT_PORT,
    };

    Ok(MssqlTarget {
        host,
        instance,
        port,
        database: first_value(&params, DATABASE_KEYS).map(str::to_string),
        username: first_value(&params, USER_KEYS).unwrap_or("").to_string(),
        password: first_value(&params, PASSWORD_KEYS).unwrap_or("").to_string(),
    })
}

fn build_config(connection_string: &str) -> Result<Config, String> {
    let target = parse_target(connection_string)?;

    let mut tiberius_config = Config::new();
    tiberius_config.host(&target.host);
    tiberius_config.port(target.port);
    if let Some(instance) = &target.instance {
        tiberius_config.instance_name(instance);
    }
    tiberius_config.authentication(AuthMethod::sql_server(&target.username, &target.password));
    tiberius_config.trust_cert();

    if let Some(db) = &target.database {
        tiberius_config.database(db);
    }

    Ok(tiberius_config)
}

struct MssqlConnection {
    client: Mutex<Option<Client<Compat<TcpStream>>>>,
}

#[async_trait]
impl SourceConnection for MssqlConnection {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::TopN
    }

    async fn ping(&self) -> Result<(), String> {
        self.query("SELECT 1").await.map(|_| ())
    }

    async fn query(&self, sql: &str) -> Result<RowSet, String> {
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| "Connection is closed".to_string())?;

        let mut stream = client.simple_query(sql).await.map_err(|e| e.to_string())?;

        let mut columns: Vec<String> = Vec::new();
        let mut values: Vec<Vec<CellValue>> = Vec::new();
        let mut result_sets = 0;

        while let Some(item) = stream.try_next().await.map_err(|e| e.to_string())? {
            match item {
                QueryItem::Metadata(meta) => {
                    result_sets += 1;
                    if result_sets == 1 {
                        columns = meta.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                }
                QueryItem::Row(row) => {
                    // Only the first result set is returned.
                    if result_sets > 1 {
                        continue;
                    }
                    if columns.is_empty() {
                        columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    values.push((0..row.len()).map(|i| cell_value(&row, i)).collect());
                }
            }
        }

        Ok(RowSet::from_values(columns, values))
    }

    async fn close(&self) {
        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.close().await {
                log::debug!("MSSQL connection close failed: {}", e);
            }
        }
    }
}

fn cell_value(row: &Row, i: usize) -> CellValue {
    if let Ok(Some(v)) = row.try_get::<i64, _>(i) {
        CellValue::Integer(v)
    } else if let Ok(Some(v)) = row.try_get::<i32, _>(i) {
        CellValue::Integer(v as i64)
    } else if let Ok(Some(v)) = row.try_get::<i16, _>(i) {
        CellValue::Integer(v as i64)
    } else if let Ok(Some(v)) = row.try_get::<u8, _>(i) {
        CellValue::Integer(v as i64)
    } else if let Ok(Some(v)) = row.try_get::<f64, _>(i) {
        CellValue::Number(v)
    } else if let Ok(Some(v)) = row.try_get::<f32, _>(i) {
        CellValue::Number(v as f64)
    } else if let Ok(Some(v)) = row.try_get::<tiberius::numeric::Numeric, _>(i) {
        CellValue::Number(f64::from(v))
    } else if let Ok(Some(v)) = row.try_get::<bool, _>(i) {
        CellValue::Bool(v)
    } else if let Ok(Some(v)) = row.try_get::<&str, _>(i) {
        CellValue::Text(v.to_string())
    } else if let Ok(Some(v)) = row.try_get::<NaiveDateTime, _>(i) {
        CellValue::Timestamp(Utc.from_utc_datetime(&v))
    } else if let Ok(Some(v)) = row.try_get::<DateTime<FixedOffset>, _>(i) {
        CellValue::Timestamp(v.with_timezone(&Utc))
    } else if let Ok(Some(v)) = row.try_get::<NaiveDate, _>(i) {
        v.and_hms_opt(0, 0, 0)
            .map(|dt| CellValue::Timestamp(Utc.from_utc_datetime(&dt)))
            .unwrap_or(CellValue::Null)
    } else if let Ok(Some(v)) = row.try_get::<&[u8], _>(i) {
        CellValue::Text(format!("0x{}", hex::encode(v)))
    } else {
        CellValue::Null
    }
}

#[cfg(test)]
mod tests;
