use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Rows,
    Delimited,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rows => "rows",
            Self::Delimited => "delimited",
        }
    }

    pub fn from_db(value: &str) -> Result<Self, String> {
        match value {
            "rows" => Ok(Self::Rows),
            "delimited" => Ok(Self::Delimited),
            _ => Err(format!("Invalid output format in storage: {}", value)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }

    pub fn from_db(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_uppercase().as_str() {
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            _ => Err(format!("Unsupported HTTP method: {}", value)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Result<Self, String> {
        match value {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status in storage: {}", value)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }

    pub fn from_db(value: &str) -> Result<Self, String> {
        match value {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "debug" => Ok(Self::Debug),
            _ => Err(format!("Invalid log level in storage: {}", value)),
        }
    }
}

// --- Connection Profile ---

#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: String,
    pub password: Option<String>,
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
    pub connection_string: Option<String>,
    pub dsn: Option<String>,
}

impl ConnectionProfile {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Connection id is required".to_string());
        }
        if self.driver.trim().is_empty() && self.connection_string.is_none() {
            return Err(format!(
                "Connection '{}' requires a driver or a connection string",
                self.id
            ));
        }
        Ok(())
    }

    pub fn password_or_empty(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("extra_params", &self.extra_params.keys().collect::<Vec<_>>())
            .field(
                "connection_string",
                &self
                    .connection_string
                    .as_deref()
                    .map(crate::security::redact_connection_string),
            )
            .field("dsn", &self.dsn)
            .finish()
    }
}

// --- Query Definition ---

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinition {
    pub id: String,
    pub name: String,
    pub sql: String,
    pub connection_id: String,
    #[serde(default)]
    pub output_format: OutputFormat,
    pub transformation_hint: Option<String>,
}

impl QueryDefinition {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Query id is required".to_string());
        }
        if self.sql.trim().is_empty() {
            return Err(format!("Query '{}' has empty SQL text", self.id));
        }
        if self.connection_id.trim().is_empty() {
            return Err(format!("Query '{}' requires connectionId", self.id));
        }
        Ok(())
    }
}

// --- Column Mapping ---

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    #[default]
    None,
    Lowercase,
    Uppercase,
    Capitalize,
    Trim,
    Number,
    Boolean,
    Date,
    Concat,
    Math,
    Replace,
    Custom,
    #[serde(other)]
    Unrecognized,
}

impl TransformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lowercase => "lowercase",
            Self::Uppercase => "uppercase",
            Self::Capitalize => "capitalize",
            Self::Trim => "trim",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Concat => "concat",
            Self::Math => "math",
            Self::Replace => "replace",
            Self::Custom => "custom",
            Self::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MathOperation {
    #[default]
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConcatPart {
    pub field: String,
    #[serde(default)]
    pub separator: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MathParams {
    #[serde(default)]
    pub operation: MathOperation,
    pub operand_field: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceParams {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransformParams {
    #[serde(default)]
    pub concat: Vec<ConcatPart>,
    pub math: Option<MathParams>,
    pub replace: Option<ReplaceParams>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnRule {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub kind: TransformKind,
    #[serde(default = "default_true")]
    pub include: bool,
    #[serde(default)]
    pub params: TransformParams,
}

impl ColumnRule {
    pub fn new(source: &str, target: &str, kind: TransformKind) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            include: true,
            params: TransformParams::default(),
        }
    }

    pub fn excluded(source: &str) -> Self {
        Self {
            include: false,
            ..Self::new(source, source, TransformKind::None)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub id: String,
    pub name: String,
    pub query_id: String,
    #[serde(default)]
    pub columns: Vec<ColumnRule>,
}

impl ColumnMapping {
    pub fn included(&self) -> impl Iterator<Item = &ColumnRule> {
        self.columns.iter().filter(|rule| rule.include)
    }
}

// --- Scheduled Task ---

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub query_id: String,
    pub mapping_id: Option<String>,
    pub destination_url: String,
    /// Falls back to the configured default method when absent.
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub api_key: Option<String>,
    pub max_retries: Option<u32>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
}

impl ScheduledTask {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Task id is required".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("Task name cannot be empty".to_string());
        }
        if self.query_id.trim().is_empty() {
            return Err(format!("Task '{}' requires queryId", self.id));
        }
        let url = self.destination_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with('/')) {
            return Err(format!(
                "Task '{}' destination must be an http(s) URL or a path under the API base URL",
                self.id
            ));
        }
        crate::scheduler::cron::CronSchedule::parse(&self.cron_expression)
            .map_err(|e| format!("Task '{}': {}", self.id, e))?;
        Ok(())
    }
}

// --- Delivery Outcome ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryErrorKind {
    Transient,
    Fatal,
    Serialization,
    Configuration,
    Connection,
    Query,
    Transformation,
}

impl DeliveryErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Serialization => "serialization",
            Self::Configuration => "configuration",
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Transformation => "transformation",
        }
    }

    pub fn from_db(value: &str) -> Result<Self, String> {
        match value {
            "transient" => Ok(Self::Transient),
            "fatal" => Ok(Self::Fatal),
            "serialization" => Ok(Self::Serialization),
            "configuration" => Ok(Self::Configuration),
            "connection" => Ok(Self::Connection),
            "query" => Ok(Self::Query),
            "transformation" => Ok(Self::Transformation),
            _ => Err(format!("Invalid delivery error kind in storage: {}", value)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    pub id: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub record_count: usize,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_kind: Option<DeliveryErrorKind>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub attempts: u32,
    pub duration_ms: i64,
}

impl DeliveryOutcome {
    /// Outcome for a firing that failed before anything was sent.
    pub fn failed_before_delivery(
        task_id: &str,
        kind: DeliveryErrorKind,
        message: &str,
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            timestamp: now,
            record_count: 0,
            success: false,
            status_code: None,
            error_kind: Some(kind),
            error_message: Some(crate::security::redact_sensitive_text(message)),
            retry_count: 0,
            attempts: 0,
            duration_ms: now.signed_duration_since(started_at).num_milliseconds().max(0),
        }
    }

    pub fn run_status(&self) -> RunStatus {
        if self.success {
            RunStatus::Success
        } else {
            RunStatus::Failed
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub id: i64,
    pub level: LogLevel,
    pub message: String,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}
