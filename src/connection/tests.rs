use super::strategy::{ConnectionCandidate, DEFAULT_STRATEGY_ORDER};
use super::*;
use crate::db_types::RowSet;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::time::Duration;

// --- Mock driver ---

struct MockConnection {
    alive: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl SourceConnection for MockConnection {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::TopN
    }

    async fn ping(&self) -> Result<(), String> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("Connection reset by peer".to_string())
        }
    }

    async fn query(&self, _sql: &str) -> Result<RowSet, String> {
        Ok(RowSet::default())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockDriver {
    /// Connect calls that fail before one succeeds; `usize::MAX` fails forever.
    failures_before_success: usize,
    hang: bool,
    connects: AtomicUsize,
    seen: StdMutex<Vec<String>>,
    alive: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

impl MockDriver {
    fn new(failures_before_success: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_before_success,
            hang: false,
            connects: AtomicUsize::new(0),
            seen: StdMutex::new(Vec::new()),
            alive: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            failures_before_success: 0,
            hang: true,
            connects: AtomicUsize::new(0),
            seen: StdMutex::new(Vec::new()),
            alive: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl SourceDriver for MockDriver {
    fn identifiers(&self) -> &[&'static str] {
        &["mock"]
    }

    async fn connect(&self, connection_string: &str) -> Result<Box<dyn SourceConnection>, String> {
        let call = self.connects.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(connection_string.to_string());
        tokio::task::yield_now().await;

        if self.hang {
            std::future::pending::<()>().await;
        }
        if call < self.failures_before_success {
            return Err(format!(
                "Login failed for user 'sa' using {}",
                connection_string
            ));
        }
        Ok(Box::new(MockConnection {
            alive: self.alive.clone(),
            closed: self.closed.clone(),
        }))
    }
}

fn profile() -> ConnectionProfile {
    ConnectionProfile {
        id: "erp".to_string(),
        name: "Legacy ERP".to_string(),
        driver: "Mock ODBC Driver".to_string(),
        host: "erp.local".to_string(),
        port: Some(1433),
        database: "sales".to_string(),
        username: "sa".to_string(),
        password: Some("hunter2".to_string()),
        extra_params: BTreeMap::new(),
        connection_string: None,
        dsn: Some("LegacyErp".to_string()),
    }
}

async fn resolver_with(driver: Arc<MockDriver>) -> ConnectionResolver {
    let registry = DriverRegistry::new();
    registry.register(driver).await;
    ConnectionResolver::new(Arc::new(registry), ConnectionSettings::default())
}

// --- Candidates ---

#[test]
fn test_candidates_follow_configured_order() {
    let mut profile = profile();
    profile.connection_string = Some("Driver={Mock};Server=explicit".to_string());
    profile
        .extra_params
        .insert("Encrypt".to_string(), "no".to_string());

    let candidates = build_candidates(&profile, &DEFAULT_STRATEGY_ORDER);
    let strategies: Vec<ConnectionStrategy> = candidates.iter().map(|c| c.strategy).collect();
    assert_eq!(strategies, DEFAULT_STRATEGY_ORDER.to_vec());

    assert_eq!(
        candidates[0],
        ConnectionCandidate {
            strategy: ConnectionStrategy::ExplicitString,
            connection_string: "Driver={Mock};Server=explicit".to_string(),
        }
    );
    assert_eq!(
        candidates[1].connection_string,
        "DSN=LegacyErp;UID=sa;PWD=hunter2;Encrypt=no"
    );
    assert_eq!(
        candidates[2].connection_string,
        "Provider=MSDASQL;Driver={Mock ODBC Driver};Server=erp.local,1433;Database=sales;UID=sa;PWD=hunter2;Encrypt=no"
    );
    assert_eq!(
        candidates[5].connection_string,
        "Driver={Mock ODBC Driver};Data Source=erp.local,1433;Initial Catalog=sales;User ID=sa;Password=hunter2;Encrypt=no"
    );
}

#[test]
fn test_inapplicable_strategies_are_skipped() {
    let mut profile = profile();
    profile.dsn = None;
    profile.host.clear();

    assert!(build_candidates(&profile, &DEFAULT_STRATEGY_ORDER).is_empty());

    let custom = [ConnectionStrategy::DriverServerPort];
    profile.host = "db".to_string();
    profile.port = None;
    let candidates = build_candidates(&profile, &custom);
    assert_eq!(candidates.len(), 1);
    assert_eq!(
        candidates[0].connection_string,
        "Driver={Mock ODBC Driver};Server=db;Database=sales;UID=sa;PWD=hunter2"
    );
}

#[test]
fn test_special_characters_are_braced() {
    let mut profile = profile();
    profile.password = Some("p;w=d".to_string());
    let candidate = ConnectionStrategy::DataSourceName.build(&profile).unwrap();
    assert_eq!(candidate, "DSN=LegacyErp;UID=sa;PWD={p;w=d}");
}

#[test]
fn test_closing_brace_in_password_survives_parsing() {
    let mut profile = profile();
    profile.password = Some("a}b;c".to_string());
    let candidate = ConnectionStrategy::DataSourceName.build(&profile).unwrap();
    assert_eq!(candidate, "DSN=LegacyErp;UID=sa;PWD={a}}b;c}");

    let params = crate::driver::parse_connection_string(&candidate);
    assert_eq!(params.get("pwd").map(String::as_str), Some("a}b;c"));
    assert_eq!(params.get("uid").map(String::as_str), Some("sa"));

    profile.password = Some("x}y".to_string());
    let candidate = ConnectionStrategy::DataSourceName.build(&profile).unwrap();
    let params = crate::driver::parse_connection_string(&candidate);
    assert_eq!(params.get("pwd").map(String::as_str), Some("x}y"));
}

// --- Resolver ---

#[tokio::test]
async fn test_third_candidate_wins_and_is_recorded() {
    let driver = MockDriver::new(2);
    let resolver = resolver_with(driver.clone()).await;

    let handle = resolver.resolve(&profile()).await.unwrap();

    assert_eq!(handle.attempt_index, 3);
    assert_eq!(handle.strategy, ConnectionStrategy::DriverServerPort);
    assert_eq!(handle.dialect, SqlDialect::TopN);
    assert!(!handle.connection_string.contains("hunter2"));
    assert_eq!(driver.connects.load(Ordering::SeqCst), 3);
    assert!(driver.seen.lock().unwrap()[0].starts_with("DSN=LegacyErp"));
}

#[tokio::test]
async fn test_all_candidates_fail_with_redacted_attempts() {
    let driver = MockDriver::new(usize::MAX);
    let resolver = resolver_with(driver.clone()).await;

    let err = resolver.resolve(&profile()).await.unwrap_err();
    match &err {
        ConnectionError::Exhausted {
            profile_id,
            reason,
            attempts,
            last_error,
        } => {
            assert_eq!(profile_id, "erp");
            assert_eq!(*reason, FailureReason::CredentialsRejected);
            assert_eq!(attempts.len(), 5);
            assert_eq!(
                attempts.iter().map(|a| a.index).collect::<Vec<_>>(),
                vec![1, 2, 3, 4, 5]
            );
            for attempt in attempts {
                assert!(!attempt.connection_string.contains("hunter2"));
                assert!(!attempt.error.contains("hunter2"));
            }
            assert!(!last_error.contains("hunter2"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.to_string().contains("hunter2"));
    assert!(resolver.cached_profile_ids().await.is_empty());
}

#[tokio::test]
async fn test_cached_handle_is_reused() {
    let driver = MockDriver::new(0);
    let resolver = resolver_with(driver.clone()).await;

    let first = resolver.resolve(&profile()).await.unwrap();
    let second = resolver.resolve(&profile()).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
    assert_eq!(resolver.cached_profile_ids().await, vec!["erp".to_string()]);
}

#[tokio::test]
async fn test_dead_cached_handle_is_replaced() {
    let driver = MockDriver::new(0);
    let resolver = resolver_with(driver.clone()).await;

    let first = resolver.resolve(&profile()).await.unwrap();
    driver.alive.store(false, Ordering::SeqCst);
    let second = resolver.resolve(&profile()).await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
    assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_resolves_share_one_connect() {
    let driver = MockDriver::new(0);
    let resolver = resolver_with(driver.clone()).await;
    let profile = profile();

    let (a, b) = tokio::join!(resolver.resolve(&profile), resolver.resolve(&profile));

    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_driver() {
    let resolver = resolver_with(MockDriver::new(0)).await;
    let mut profile = profile();
    profile.driver = "Progress OpenEdge".to_string();

    let err = resolver.resolve(&profile).await.unwrap_err();
    assert!(matches!(err, ConnectionError::UnknownDriver { ref driver, .. } if driver == "Progress OpenEdge"));
}

#[tokio::test]
async fn test_driver_taken_from_explicit_string() {
    let driver = MockDriver::new(0);
    let resolver = resolver_with(driver).await;
    let mut profile = profile();
    profile.driver.clear();
    profile.dsn = None;
    profile.connection_string = Some("Driver={Mock};Server=db;PWD=hunter2".to_string());

    let handle = resolver.resolve(&profile).await.unwrap();
    assert_eq!(handle.strategy, ConnectionStrategy::ExplicitString);
    assert_eq!(handle.connection_string, "Driver={Mock};Server=db;PWD=[REDACTED]");
}

#[tokio::test(start_paused = true)]
async fn test_each_attempt_has_its_own_timeout() {
    let driver = MockDriver::hanging();
    let resolver = resolver_with(driver.clone()).await;

    let started = tokio::time::Instant::now();
    let err = resolver.resolve(&profile()).await.unwrap_err();

    assert!(matches!(
        err,
        ConnectionError::Exhausted { reason: FailureReason::Timeout, ref attempts, .. } if attempts.len() == 5
    ));
    assert_eq!(started.elapsed(), Duration::from_secs(30 * 5));
}

#[tokio::test]
async fn test_probe_profile_does_not_cache() {
    let driver = MockDriver::new(0);
    let resolver = resolver_with(driver.clone()).await;

    let diagnostics = resolver.probe_profile(&profile()).await.unwrap();
    assert_eq!(diagnostics.attempt_index, 1);
    assert!(resolver.cached_profile_ids().await.is_empty());
    assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalidate_and_close_all() {
    let driver = MockDriver::new(0);
    let resolver = resolver_with(driver.clone()).await;

    resolver.resolve(&profile()).await.unwrap();
    assert!(resolver.invalidate("erp").await);
    assert!(!resolver.invalidate("erp").await);

    resolver.resolve(&profile()).await.unwrap();
    resolver.close_all().await;
    assert!(resolver.cached_profile_ids().await.is_empty());
    assert_eq!(driver.closed.load(Ordering::SeqCst), 2);
}

#[test]
fn test_failure_reason_classification() {
    assert_eq!(
        FailureReason::classify("Data source name 'X' is not configured on this host"),
        FailureReason::DriverUnavailable
    );
    assert_eq!(
        FailureReason::classify("Connection refused (os error 111)"),
        FailureReason::ServerUnreachable
    );
    assert_eq!(
        FailureReason::classify("Cannot open database \"sales\" requested by the login"),
        FailureReason::DatabaseNotFound
    );
    assert_eq!(FailureReason::classify("weird"), FailureReason::Unknown);
    assert!(!FailureReason::Timeout.suggestion().is_empty());
}
