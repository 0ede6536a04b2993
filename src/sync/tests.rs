use super::*;
use crate::config::{ConnectionSettings, QuerySettings, ScheduleTimezone};
use crate::db_types::SqlDialect;
use crate::delivery::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::driver::{DriverRegistry, SourceConnection, SourceDriver};
use crate::models::{ColumnRule, ConnectionProfile, HttpMethod, RunStatus, TransformKind};
use crate::scheduler::{Scheduler, TaskState};
use crate::storage::SqliteConfigStore;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

// --- Test doubles ---

struct RecordingTransport {
    status: u16,
    requests: Mutex<Vec<HttpRequest>>,
}

impl RecordingTransport {
    fn new(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn bodies(&self) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| serde_json::from_str(&request.body).unwrap())
            .collect()
    }
}

#[async_trait]
impl HttpTransport for RecordingTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(HttpResponse {
            status: self.status,
            body: r#"{"ok":true}"#.to_string(),
        })
    }
}

/// Connects fine, then loses the link on the first statement.
struct DroppingDriver;

struct DroppingConnection;

#[async_trait]
impl SourceConnection for DroppingConnection {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::LimitOffset
    }

    async fn ping(&self) -> Result<(), String> {
        Ok(())
    }

    async fn query(&self, _sql: &str) -> Result<RowSet, String> {
        Err("Communication link failure: connection reset by peer".to_string())
    }

    async fn close(&self) {}
}

#[async_trait]
impl SourceDriver for DroppingDriver {
    fn identifiers(&self) -> &[&'static str] {
        &["dropping"]
    }

    async fn connect(&self, _connection_string: &str) -> Result<Box<dyn SourceConnection>, String> {
        Ok(Box::new(DroppingConnection))
    }
}

// --- Fixtures ---

struct Harness {
    service: Arc<SyncService>,
    store: SqliteConfigStore,
    transport: Arc<RecordingTransport>,
}

async fn seed_source_database() -> PathBuf {
    let path = std::env::temp_dir().join(format!("sqlbridge-source-{}.db", uuid::Uuid::new_v4()));
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE clients (INTERNAL_ID INTEGER, NAME TEXT, UPDATED TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO clients VALUES (1, 'ANN', 'synced 2024-05-01 08:00:00'), (2, 'BOB', NULL)",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;
    path
}

async fn harness(status: u16) -> Harness {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteConfigStore::new(pool, None).await.unwrap();

    let registry = DriverRegistry::with_defaults().await;
    registry.register(Arc::new(DroppingDriver)).await;
    let resolver = Arc::new(ConnectionResolver::new(
        Arc::new(registry),
        ConnectionSettings::default(),
    ));

    let transport = RecordingTransport::new(status);
    let api = ApiSettings {
        base_url: Some("https://api.example.com".to_string()),
        api_key: Some("global-key".to_string()),
        max_retries: 0,
        ..ApiSettings::default()
    };
    let service = Arc::new(SyncService::new(
        Arc::new(store.clone()),
        resolver,
        QueryExecutor::new(&QuerySettings::default()),
        DeliveryClient::new(transport.clone()),
        api,
    ));

    Harness {
        service,
        store,
        transport,
    }
}

fn profile(id: &str, driver: &str, connection_string: &str) -> ConnectionProfile {
    ConnectionProfile {
        id: id.to_string(),
        name: id.to_uppercase(),
        driver: driver.to_string(),
        connection_string: Some(connection_string.to_string()),
        ..ConnectionProfile::default()
    }
}

fn query(id: &str, connection_id: &str, sql: &str) -> QueryDefinition {
    QueryDefinition {
        id: id.to_string(),
        name: id.to_string(),
        sql: sql.to_string(),
        connection_id: connection_id.to_string(),
        output_format: OutputFormat::Rows,
        transformation_hint: None,
    }
}

fn task(id: &str, query_id: &str, active: bool) -> ScheduledTask {
    ScheduledTask {
        id: id.to_string(),
        name: id.to_string(),
        cron_expression: "*/5 * * * *".to_string(),
        query_id: query_id.to_string(),
        mapping_id: None,
        destination_url: "/clients".to_string(),
        method: Some(HttpMethod::Post),
        headers: BTreeMap::new(),
        api_key: None,
        max_retries: None,
        active,
        last_run_at: None,
        last_run_status: None,
    }
}

async fn seed_clients_pipeline(h: &Harness, source: &PathBuf) {
    h.store
        .save_connection_profile(&profile(
            "legacy",
            "sqlite",
            &format!("Data Source={}", source.display()),
        ))
        .await
        .unwrap();
    h.store
        .save_query_definition(&query("clients", "legacy", "SELECT * FROM clients"))
        .await
        .unwrap();
    h.store
        .save_column_mapping(&ColumnMapping {
            id: "clients-map".to_string(),
            name: "Clients".to_string(),
            query_id: "clients".to_string(),
            columns: vec![
                ColumnRule::new("NAME", "name", TransformKind::Lowercase),
                ColumnRule::excluded("INTERNAL_ID"),
                ColumnRule::new("UPDATED", "note", TransformKind::None),
            ],
        })
        .await
        .unwrap();
    h.store
        .save_scheduled_task(&task("sync-clients", "clients", true))
        .await
        .unwrap();
}

// --- Tests ---

#[tokio::test]
async fn test_scheduled_task_syncs_clients_end_to_end() {
    let source = seed_source_database().await;
    let h = harness(200).await;
    seed_clients_pipeline(&h, &source).await;

    let scheduler = Scheduler::new(h.service.clone(), ScheduleTimezone::Utc);
    let stored_task = h.store.get_scheduled_task("sync-clients").await.unwrap();
    assert_eq!(
        scheduler.schedule(&stored_task).await.unwrap(),
        TaskState::Scheduled
    );
    let status = scheduler.status().await;
    let next = status[0].next_run_at.unwrap();
    assert!(next - Utc::now() <= chrono::Duration::minutes(5));
    assert_eq!(scheduler.shutdown(Duration::from_secs(1)).await, 0);

    // Same path a timer firing takes.
    let outcome = h.service.run_task("sync-clients").await;

    assert!(outcome.success, "{:?}", outcome.error_message);
    assert_eq!(outcome.record_count, 2);
    assert_eq!(outcome.status_code, Some(200));
    assert_eq!(outcome.retry_count, 0);

    let bodies = h.transport.bodies();
    assert_eq!(bodies.len(), 1);
    assert_eq!(
        bodies[0],
        json!([
            {"name": "ann", "note": "synced"},
            {"name": "bob", "note": null}
        ])
    );
    let request = h.transport.requests.lock().unwrap()[0].clone();
    assert_eq!(request.url, "https://api.example.com/clients");
    assert!(request
        .headers
        .contains(&("Authorization".to_string(), "Bearer global-key".to_string())));

    let stored = h.store.get_scheduled_task("sync-clients").await.unwrap();
    assert_eq!(stored.last_run_status, Some(RunStatus::Success));
    let history = h.store.list_delivery_outcomes(Some("sync-clients"), 5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].record_count, 2);
    assert_eq!(h.store.list_logs(5).await.unwrap().len(), 1);

    h.service.resolver().close_all().await;
    let _ = std::fs::remove_file(&source);
}

#[tokio::test]
async fn test_missing_query_fails_as_configuration() {
    let h = harness(200).await;
    h.store
        .save_scheduled_task(&task("orphan", "no-such-query", true))
        .await
        .unwrap();

    let outcome = h.service.run_task("orphan").await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(DeliveryErrorKind::Configuration));
    assert_eq!(outcome.attempts, 0);
    assert!(h.transport.bodies().is_empty());
    let stored = h.store.get_scheduled_task("orphan").await.unwrap();
    assert_eq!(stored.last_run_status, Some(RunStatus::Failed));
}

#[tokio::test]
async fn test_unknown_task_still_produces_outcome() {
    let h = harness(200).await;
    let outcome = h.service.run_task("ghost").await;
    assert!(!outcome.success);
    assert_eq!(outcome.task_id, "ghost");
    assert_eq!(outcome.error_kind, Some(DeliveryErrorKind::Configuration));
}

#[tokio::test]
async fn test_unknown_driver_fails_as_connection() {
    let h = harness(200).await;
    h.store
        .save_connection_profile(&profile("old", "Progress OpenEdge", "DSN=old"))
        .await
        .unwrap();
    h.store
        .save_query_definition(&query("q", "old", "SELECT 1"))
        .await
        .unwrap();
    h.store.save_scheduled_task(&task("t", "q", true)).await.unwrap();

    let outcome = h.service.run_task("t").await;
    assert_eq!(outcome.error_kind, Some(DeliveryErrorKind::Connection));
}

#[tokio::test]
async fn test_bad_sql_fails_as_query() {
    let source = seed_source_database().await;
    let h = harness(200).await;
    seed_clients_pipeline(&h, &source).await;
    h.store
        .save_query_definition(&query("clients", "legacy", "SELECT * FROM clientz"))
        .await
        .unwrap();

    let outcome = h.service.run_task("sync-clients").await;
    assert_eq!(outcome.error_kind, Some(DeliveryErrorKind::Query));
    assert!(outcome.error_message.unwrap().contains("clientz"));

    h.service.resolver().close_all().await;
    let _ = std::fs::remove_file(&source);
}

#[tokio::test]
async fn test_lost_connection_evicts_cached_handle() {
    let h = harness(200).await;
    h.store
        .save_connection_profile(&profile("flaky", "dropping", "Server=flaky"))
        .await
        .unwrap();
    h.store
        .save_query_definition(&query("q", "flaky", "SELECT 1"))
        .await
        .unwrap();
    h.store.save_scheduled_task(&task("t", "q", true)).await.unwrap();

    let outcome = h.service.run_task("t").await;

    assert_eq!(outcome.error_kind, Some(DeliveryErrorKind::Query));
    assert!(h.service.resolver().cached_profile_ids().await.is_empty());
}

#[tokio::test]
async fn test_rejected_delivery_is_recorded_as_failure() {
    let source = seed_source_database().await;
    let h = harness(422).await;
    seed_clients_pipeline(&h, &source).await;

    let outcome = h.service.run_task("sync-clients").await;

    assert!(!outcome.success);
    assert_eq!(outcome.status_code, Some(422));
    assert_eq!(outcome.attempts, 1);
    let stored = h.store.get_scheduled_task("sync-clients").await.unwrap();
    assert_eq!(stored.last_run_status, Some(RunStatus::Failed));

    h.service.resolver().close_all().await;
    let _ = std::fs::remove_file(&source);
}

#[tokio::test]
async fn test_run_all_covers_active_tasks_only() {
    let source = seed_source_database().await;
    let h = harness(200).await;
    seed_clients_pipeline(&h, &source).await;
    h.store
        .save_scheduled_task(&task("second", "clients", true))
        .await
        .unwrap();
    h.store
        .save_scheduled_task(&task("paused", "clients", false))
        .await
        .unwrap();

    let outcomes = h.service.run_all().await;

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|outcome| outcome.success));
    assert!(outcomes.iter().all(|outcome| outcome.task_id != "paused"));
    assert_eq!(h.transport.bodies().len(), 2);

    h.service.resolver().close_all().await;
    let _ = std::fs::remove_file(&source);
}

#[tokio::test]
async fn test_preview_and_query_limits() {
    let source = seed_source_database().await;
    let h = harness(200).await;
    seed_clients_pipeline(&h, &source).await;

    let output = h.service.run_query("clients", Some(1)).await.unwrap();
    assert_eq!(output.rows.len(), 1);

    let mapping = h.store.get_column_mapping("clients-map").await.unwrap();
    let preview = h
        .service
        .preview_transform("clients", &mapping, 5)
        .await
        .unwrap();
    assert_eq!(preview.columns, vec!["name", "note"]);
    assert_eq!(preview.len(), 2);

    let mut invalid = mapping.clone();
    invalid.columns.push(ColumnRule::new("INTERNAL_ID", "name", TransformKind::None));
    assert!(matches!(
        h.service.preview_transform("clients", &invalid, 5).await,
        Err(PipelineError::Transformation(_))
    ));

    h.service.resolver().close_all().await;
    let _ = std::fs::remove_file(&source);
}

#[tokio::test]
async fn test_recorded_failure_updates_history_and_last_run() {
    let h = harness(200).await;
    h.store
        .save_scheduled_task(&task("t9", "clients", true))
        .await
        .unwrap();

    let outcome = DeliveryOutcome::failed_before_delivery(
        "t9",
        DeliveryErrorKind::Fatal,
        "Sync firing aborted: driver crashed",
        Utc::now(),
    );
    h.service.record_failure(&outcome).await;

    let history = h.store.list_delivery_outcomes(Some("t9"), 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].error_kind, Some(DeliveryErrorKind::Fatal));
    assert_eq!(
        h.store.get_scheduled_task("t9").await.unwrap().last_run_status,
        Some(RunStatus::Failed)
    );
    assert!(h.store.list_logs(10).await.unwrap()[0].message.contains("driver crashed"));
}
