// =====================================================
// UI COMMANDS
// Bounded operations returning {success, message, data}
// =====================================================

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

use crate::connection::{AttemptRecord, ConnectionDiagnostics, ConnectionError};
use crate::db_types::RowSet;
use crate::models::{ColumnMapping, ConnectionProfile, DeliveryOutcome};
use crate::query_execution::QueryOutput;
use crate::scheduler::{aborted_outcome, ScheduledTaskStatus, Scheduler, SyncRunner};
use crate::security::redact_sensitive_text;
use crate::sync::SyncService;
use crate::transform::{self, MappingIssue};

const TEST_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);
const RUN_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const EXECUTE_TASK_TIMEOUT: Duration = Duration::from_secs(65);
const DEFAULT_PREVIEW_ROWS: usize = 100;

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T> CommandResult<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn fail(message: impl AsRef<str>) -> Self {
        Self {
            success: false,
            message: redact_sensitive_text(message.as_ref()),
            data: None,
        }
    }

    pub fn fail_with(message: impl AsRef<str>, data: T) -> Self {
        Self {
            data: Some(data),
            ..Self::fail(message)
        }
    }
}

#[derive(Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestReport {
    pub diagnostics: Option<ConnectionDiagnostics>,
    pub attempts: Vec<AttemptRecord>,
    pub suggestion: Option<String>,
}

pub struct AppCommands {
    service: Arc<SyncService>,
    scheduler: Arc<Scheduler>,
    preview_rows: usize,
}

impl AppCommands {
    pub fn new(service: Arc<SyncService>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            service,
            scheduler,
            preview_rows: DEFAULT_PREVIEW_ROWS,
        }
    }

    pub fn with_preview_rows(mut self, rows: usize) -> Self {
        self.preview_rows = rows.max(1);
        self
    }

    pub async fn test_connection(
        &self,
        profile: &ConnectionProfile,
    ) -> CommandResult<ConnectionTestReport> {
        if let Err(e) = profile.validate() {
            return CommandResult::fail(e);
        }

        let probe = self.service.resolver().probe_profile(profile);
        match bounded(TEST_CONNECTION_TIMEOUT, "Connection test", probe).await {
            Err(message) => CommandResult::fail(message),
            Ok(Ok(diagnostics)) => {
                let message = format!(
                    "Connected on attempt {} via {}",
                    diagnostics.attempt_index,
                    diagnostics.strategy.as_str()
                );
                CommandResult::ok(
                    message,
                    ConnectionTestReport {
                        diagnostics: Some(diagnostics),
                        ..ConnectionTestReport::default()
                    },
                )
            }
            Ok(Err(e)) => {
                let report = match &e {
                    ConnectionError::Exhausted {
                        reason, attempts, ..
                    } => ConnectionTestReport {
                        diagnostics: None,
                        attempts: attempts.clone(),
                        suggestion: Some(reason.suggestion().to_string()),
                    },
                    _ => ConnectionTestReport::default(),
                };
                CommandResult::fail_with(e.to_string(), report)
            }
        }
    }

    pub async fn run_query(&self, query_id: &str, limit: Option<usize>) -> CommandResult<QueryOutput> {
        let limit = limit.unwrap_or(self.preview_rows).max(1);
        let run = self.service.run_query(query_id, Some(limit));
        match bounded(RUN_QUERY_TIMEOUT, "Query", run).await {
            Ok(Ok(output)) => {
                let message = format!("{} row(s) in {} ms", output.rows.len(), output.elapsed_ms);
                CommandResult::ok(message, output)
            }
            Ok(Err(e)) => CommandResult::fail(e.to_string()),
            Err(message) => CommandResult::fail(message),
        }
    }

    pub async fn preview_transform(
        &self,
        query_id: &str,
        mapping: &ColumnMapping,
        limit: Option<usize>,
    ) -> CommandResult<RowSet> {
        let limit = limit.unwrap_or(self.preview_rows).max(1);
        let preview = self.service.preview_transform(query_id, mapping, limit);
        match bounded(RUN_QUERY_TIMEOUT, "Preview", preview).await {
            Ok(Ok(rows)) => CommandResult::ok(format!("{} row(s) transformed", rows.len()), rows),
            Ok(Err(e)) => CommandResult::fail(e.to_string()),
            Err(message) => CommandResult::fail(message),
        }
    }

    /// Runs a task now. The firing keeps going in the background when the UI
    /// bound elapses, and its outcome is still recorded.
    pub async fn execute_task(&self, task_id: &str) -> CommandResult<DeliveryOutcome> {
        let service = self.service.clone();
        let id = task_id.to_string();
        let started_at = chrono::Utc::now();
        let firing = tokio::spawn(async move { service.run_task(&id).await });

        match timeout(EXECUTE_TASK_TIMEOUT, firing).await {
            Ok(Ok(outcome)) if outcome.success => {
                let message = format!(
                    "Delivered {} record(s) after {} retr{}",
                    outcome.record_count,
                    outcome.retry_count,
                    if outcome.retry_count == 1 { "y" } else { "ies" }
                );
                CommandResult::ok(message, outcome)
            }
            Ok(Ok(outcome)) => {
                let message = outcome
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Sync failed".to_string());
                CommandResult::fail_with(message, outcome)
            }
            Ok(Err(e)) => {
                log::error!("Manual run of task '{}' aborted: {}", task_id, e);
                let outcome = aborted_outcome(task_id, e, started_at);
                self.service.record_failure(&outcome).await;
                let message = outcome.error_message.clone().unwrap_or_default();
                CommandResult::fail_with(message, outcome)
            }
            Err(_) => CommandResult::fail(format!(
                "Task '{}' is still running after {} seconds; its outcome will appear in the history",
                task_id,
                EXECUTE_TASK_TIMEOUT.as_secs()
            )),
        }
    }

    pub async fn sync_all(&self) -> CommandResult<Vec<DeliveryOutcome>> {
        let outcomes = self.service.run_all().await;
        let failed = outcomes.iter().filter(|outcome| !outcome.success).count();
        let message = format!(
            "{} of {} task(s) delivered",
            outcomes.len() - failed,
            outcomes.len()
        );
        if failed == 0 {
            CommandResult::ok(message, outcomes)
        } else {
            CommandResult::fail_with(message, outcomes)
        }
    }

    pub fn validate_mapping(&self, mapping: &ColumnMapping) -> CommandResult<Vec<MappingIssue>> {
        match transform::validate_mapping(mapping) {
            Ok(()) => CommandResult::ok("Mapping is valid", Vec::new()),
            Err(e) => CommandResult::fail_with(e.to_string(), e.issues),
        }
    }

    pub async fn scheduler_status(&self) -> CommandResult<Vec<ScheduledTaskStatus>> {
        let status = self.scheduler.status().await;
        CommandResult::ok(format!("{} task(s) scheduled", status.len()), status)
    }
}

async fn bounded<F, T>(limit: Duration, operation: &str, future: F) -> Result<T, String>
where
    F: Future<Output = T>,
{
    timeout(limit, future)
        .await
        .map_err(|_| format!("{} did not finish within {} seconds", operation, limit.as_secs()))
}
