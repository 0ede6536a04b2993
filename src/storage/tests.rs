use super::*;
use crate::crypto::generate_new_key;
use crate::models::{ColumnRule, TransformKind};

async fn memory_store(key: Option<Vec<u8>>) -> SqliteConfigStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    SqliteConfigStore::new(pool, key).await.unwrap()
}

fn profile() -> ConnectionProfile {
    ConnectionProfile {
        id: "erp".to_string(),
        name: "ERP".to_string(),
        driver: "SQL Server".to_string(),
        host: "db01".to_string(),
        port: Some(1433),
        database: "sales".to_string(),
        username: "sync".to_string(),
        password: Some("s3cret!".to_string()),
        extra_params: BTreeMap::from([("Encrypt".to_string(), "no".to_string())]),
        connection_string: None,
        dsn: None,
    }
}

fn query() -> QueryDefinition {
    QueryDefinition {
        id: "q1".to_string(),
        name: "Clients".to_string(),
        sql: "SELECT * FROM clients".to_string(),
        connection_id: "erp".to_string(),
        output_format: OutputFormat::Delimited,
        transformation_hint: None,
    }
}

fn mapping(id: &str) -> ColumnMapping {
    ColumnMapping {
        id: id.to_string(),
        name: format!("Mapping {}", id),
        query_id: "q1".to_string(),
        columns: vec![
            ColumnRule::new("NAME", "name", TransformKind::Lowercase),
            ColumnRule::excluded("INTERNAL_ID"),
        ],
    }
}

fn task(id: &str, active: bool) -> ScheduledTask {
    ScheduledTask {
        id: id.to_string(),
        name: format!("Task {}", id),
        cron_expression: "*/5 * * * *".to_string(),
        query_id: "q1".to_string(),
        mapping_id: None,
        destination_url: "https://api.example.com/clients".to_string(),
        method: Some(HttpMethod::Put),
        headers: BTreeMap::from([("X-Tenant".to_string(), "acme".to_string())]),
        api_key: Some("task-key".to_string()),
        max_retries: Some(5),
        active,
        last_run_at: None,
        last_run_status: None,
    }
}

#[tokio::test]
async fn test_profile_round_trip_encrypts_password() {
    let store = memory_store(Some(generate_new_key())).await;
    store.save_connection_profile(&profile()).await.unwrap();

    let raw: Option<String> = sqlx::query_scalar("SELECT password FROM connection_profiles WHERE id = 'erp'")
        .fetch_one(&store.pool)
        .await
        .unwrap();
    let raw = raw.unwrap();
    assert!(raw.starts_with(ENCRYPTED_PREFIX));
    assert!(!raw.contains("s3cret!"));

    let loaded = store.get_connection_profile("erp").await.unwrap();
    assert_eq!(loaded.password.as_deref(), Some("s3cret!"));
    assert_eq!(loaded.port, Some(1433));
    assert_eq!(loaded.extra_params.get("Encrypt").map(String::as_str), Some("no"));
    assert_eq!(store.list_connection_profiles().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_entities_are_not_found() {
    let store = memory_store(None).await;
    assert!(matches!(
        store.get_connection_profile("nope").await,
        Err(StoreError::NotFound { .. })
    ));
    assert!(matches!(
        store.get_scheduled_task("nope").await,
        Err(StoreError::NotFound { .. })
    ));
    assert!(store.get_column_mapping_for_query("q1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_mapping_is_not_persisted() {
    let store = memory_store(None).await;
    let mut bad = mapping("m1");
    bad.columns.push(ColumnRule::new("FULL_NAME", "name", TransformKind::None));

    let err = store.save_column_mapping(&bad).await.unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
    assert!(err.to_string().contains("name"));
    assert!(store.list_column_mappings().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_mapping_lookup_by_query_and_cascade_delete() {
    let store = memory_store(None).await;
    store.save_query_definition(&query()).await.unwrap();
    store.save_column_mapping(&mapping("m1")).await.unwrap();

    let by_query = store.get_column_mapping_for_query("q1").await.unwrap().unwrap();
    assert_eq!(by_query.id, "m1");
    assert_eq!(by_query.columns.len(), 2);
    assert_eq!(
        store.get_query_definition("q1").await.unwrap().output_format,
        OutputFormat::Delimited
    );

    assert!(store.delete_query_definition("q1").await.unwrap());
    assert!(store.get_column_mapping("m1").await.is_err());
    assert!(!store.delete_query_definition("q1").await.unwrap());
}

#[tokio::test]
async fn test_task_validation_and_active_listing() {
    let store = memory_store(Some(generate_new_key())).await;

    let mut bad = task("bad", true);
    bad.cron_expression = "every five minutes".to_string();
    assert!(matches!(
        store.save_scheduled_task(&bad).await,
        Err(StoreError::Invalid(_))
    ));

    let saved = store.save_scheduled_task(&task("t1", true)).await.unwrap();
    assert_eq!(saved.api_key.as_deref(), Some("task-key"));
    assert_eq!(saved.method, Some(HttpMethod::Put));
    assert_eq!(saved.max_retries, Some(5));
    store.save_scheduled_task(&task("t2", false)).await.unwrap();

    let active = store.get_active_scheduled_tasks().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "t1");
    assert_eq!(store.list_scheduled_tasks().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_last_run_survives_task_update() {
    let store = memory_store(None).await;
    store.save_scheduled_task(&task("t1", true)).await.unwrap();

    let at = Utc::now();
    store.record_last_run("t1", at, RunStatus::Failed).await.unwrap();
    let mut edited = task("t1", true);
    edited.name = "Renamed".to_string();
    store.save_scheduled_task(&edited).await.unwrap();

    let loaded = store.get_scheduled_task("t1").await.unwrap();
    assert_eq!(loaded.name, "Renamed");
    assert_eq!(loaded.last_run_status, Some(RunStatus::Failed));
    assert_eq!(
        loaded.last_run_at.map(|t| t.timestamp_millis()),
        Some(at.timestamp_millis())
    );

    assert!(store.record_last_run("missing", at, RunStatus::Success).await.is_err());
}

#[tokio::test]
async fn test_history_append_list_and_purge() {
    let store = memory_store(None).await;

    let mut old = DeliveryOutcome::failed_before_delivery(
        "t1",
        DeliveryErrorKind::Query,
        "Login failed; password=hunter2",
        Utc::now(),
    );
    old.timestamp = Utc::now() - Duration::days(40);
    store.append_delivery_outcome(&old).await.unwrap();

    let mut recent = old.clone();
    recent.id = "recent".to_string();
    recent.timestamp = Utc::now();
    recent.success = true;
    recent.error_kind = None;
    recent.error_message = None;
    recent.status_code = Some(200);
    store.append_delivery_outcome(&recent).await.unwrap();

    store
        .append_log(LogLevel::Warning, "token=abc expired", Some("t1"))
        .await
        .unwrap();

    let outcomes = store.list_delivery_outcomes(Some("t1"), 10).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].id, "recent");
    assert_eq!(outcomes[1].error_kind, Some(DeliveryErrorKind::Query));
    assert!(!outcomes[1].error_message.as_deref().unwrap().contains("hunter2"));

    let logs = store.list_logs(10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogLevel::Warning);
    assert!(!logs[0].message.contains("abc"));

    let purged = store.purge_history(30).await.unwrap();
    assert_eq!(purged.deleted_outcomes, 1);
    assert_eq!(purged.deleted_logs, 0);
    assert_eq!(store.list_delivery_outcomes(None, 10).await.unwrap().len(), 1);

    assert!(store.purge_history(0).await.is_err());
}

#[tokio::test]
async fn test_encrypted_secret_without_key_is_an_error() {
    let key = generate_new_key();
    let sealed = SqliteConfigStore {
        pool: memory_store(None).await.pool,
        key: Some(key),
    };
    let stored = sealed.seal(Some("pw")).unwrap();

    let unkeyed = memory_store(None).await;
    assert!(unkeyed.open_secret(stored).is_err());
    assert_eq!(unkeyed.open_secret(Some("plain".to_string())).unwrap().as_deref(), Some("plain"));
}
