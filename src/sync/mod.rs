// =====================================================
// SYNC SERVICE
// One firing: resolve → query → transform → deliver → record
// =====================================================

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;

use crate::config::ApiSettings;
use crate::connection::{ConnectionError, ConnectionResolver};
use crate::db_types::RowSet;
use crate::delivery::{DeliveryClient, DeliveryPolicy, DeliveryTarget};
use crate::models::{
    ColumnMapping, DeliveryErrorKind, DeliveryOutcome, LogLevel, OutputFormat, QueryDefinition,
    ScheduledTask,
};
use crate::query_execution::{limit_rows, QueryError, QueryErrorKind, QueryExecutor, QueryOutput};
use crate::scheduler::SyncRunner;
use crate::storage::{ConfigStore, StoreError};
use crate::transform::{self, TransformationError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Transformation(#[from] TransformationError),
    #[error("{0}")]
    Configuration(String),
}

impl PipelineError {
    /// Stage that failed, as recorded on the outcome.
    pub fn kind(&self) -> DeliveryErrorKind {
        match self {
            Self::Store(_) | Self::Configuration(_) => DeliveryErrorKind::Configuration,
            Self::Connection(_) => DeliveryErrorKind::Connection,
            Self::Query(_) => DeliveryErrorKind::Query,
            Self::Transformation(_) => DeliveryErrorKind::Transformation,
        }
    }
}

/// Everything a firing needs once the source data is in hand.
struct PreparedDelivery {
    rows: RowSet,
    format: OutputFormat,
    target: DeliveryTarget,
    policy: DeliveryPolicy,
}

pub struct SyncService {
    store: Arc<dyn ConfigStore>,
    resolver: Arc<ConnectionResolver>,
    executor: QueryExecutor,
    delivery: DeliveryClient,
    api: ApiSettings,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        resolver: Arc<ConnectionResolver>,
        executor: QueryExecutor,
        delivery: DeliveryClient,
        api: ApiSettings,
    ) -> Self {
        Self {
            store,
            resolver,
            executor,
            delivery,
            api,
        }
    }

    pub fn resolver(&self) -> &ConnectionResolver {
        &self.resolver
    }

    /// Runs a stored query through the cached connection. `limit` caps the
    /// rows for interactive use.
    pub async fn run_query(
        &self,
        query_id: &str,
        limit: Option<usize>,
    ) -> Result<QueryOutput, PipelineError> {
        let query = self.store.get_query_definition(query_id).await?;
        self.execute_definition(&query, limit).await
    }

    /// Runs the query behind `query_id` and applies `mapping` to at most
    /// `limit` rows.
    pub async fn preview_transform(
        &self,
        query_id: &str,
        mapping: &ColumnMapping,
        limit: usize,
    ) -> Result<RowSet, PipelineError> {
        transform::validate_mapping(mapping)?;
        let output = self.run_query(query_id, Some(limit)).await?;
        Ok(transform::preview(&output.rows, mapping, limit))
    }

    async fn execute_definition(
        &self,
        query: &QueryDefinition,
        limit: Option<usize>,
    ) -> Result<QueryOutput, PipelineError> {
        let profile = self.store.get_connection_profile(&query.connection_id).await?;
        let handle = self.resolver.resolve(&profile).await?;

        let sql = match limit {
            Some(limit) => limit_rows(&query.sql, limit),
            None => query.sql.clone(),
        };

        match self.executor.execute(&handle, &sql).await {
            Ok(output) => Ok(output),
            Err(e) => {
                if e.kind == QueryErrorKind::ConnectionLost {
                    self.resolver.invalidate(&profile.id).await;
                }
                Err(e.into())
            }
        }
    }

    async fn mapping_for(
        &self,
        task: &ScheduledTask,
    ) -> Result<Option<ColumnMapping>, PipelineError> {
        match &task.mapping_id {
            Some(mapping_id) => Ok(Some(self.store.get_column_mapping(mapping_id).await?)),
            None => Ok(self.store.get_column_mapping_for_query(&task.query_id).await?),
        }
    }

    async fn prepare(&self, task_id: &str) -> Result<PreparedDelivery, PipelineError> {
        let task = self.store.get_scheduled_task(task_id).await?;
        let query = self.store.get_query_definition(&task.query_id).await?;

        // Resolve the destination before touching the source database.
        let target = DeliveryTarget::for_task(&task, &self.api).map_err(PipelineError::Configuration)?;
        let policy = DeliveryPolicy::from_settings(&self.api).with_max_retries(task.max_retries);

        let output = self.execute_definition(&query, None).await?;
        let rows = match self.mapping_for(&task).await? {
            Some(mapping) => transform::transform(&output.rows, &mapping),
            None => {
                log::debug!("Task '{}' has no column mapping, sending rows as-is", task_id);
                output.rows
            }
        };

        Ok(PreparedDelivery {
            rows,
            format: query.output_format,
            target,
            policy,
        })
    }

    async fn record(&self, outcome: &DeliveryOutcome) {
        let task_id = outcome.task_id.as_str();
        if let Err(e) = self.store.append_delivery_outcome(outcome).await {
            log::warn!("Failed to store delivery outcome for '{}': {}", task_id, e);
        }

        match self
            .store
            .record_last_run(task_id, outcome.timestamp, outcome.run_status())
            .await
        {
            Ok(()) | Err(StoreError::NotFound { .. }) => {}
            Err(e) => log::warn!("Failed to record last run for '{}': {}", task_id, e),
        }

        let (level, message) = if outcome.success {
            (
                LogLevel::Info,
                format!(
                    "Delivered {} record(s) in {} attempt(s)",
                    outcome.record_count, outcome.attempts
                ),
            )
        } else {
            (
                LogLevel::Error,
                format!(
                    "Sync failed ({}): {}",
                    outcome
                        .error_kind
                        .as_ref()
                        .map(|kind| kind.as_str())
                        .unwrap_or("unknown"),
                    outcome.error_message.as_deref().unwrap_or("no details")
                ),
            )
        };
        if let Err(e) = self.store.append_log(level, &message, Some(task_id)).await {
            log::warn!("Failed to append sync log for '{}': {}", task_id, e);
        }
    }
}

#[async_trait]
impl SyncRunner for SyncService {
    async fn run_task(&self, task_id: &str) -> DeliveryOutcome {
        let started_at = Utc::now();
        log::info!("Sync for task '{}' started", task_id);

        let outcome = match self.prepare(task_id).await {
            Ok(prepared) => {
                self.delivery
                    .deliver(
                        task_id,
                        &prepared.rows,
                        &prepared.format,
                        &prepared.target,
                        &prepared.policy,
                    )
                    .await
            }
            Err(e) => {
                log::error!("Sync for task '{}' failed before delivery: {}", task_id, e);
                DeliveryOutcome::failed_before_delivery(task_id, e.kind(), &e.to_string(), started_at)
            }
        };

        self.record(&outcome).await;
        log::info!(
            "Sync for task '{}' finished: success={} records={} retries={}",
            task_id,
            outcome.success,
            outcome.record_count,
            outcome.retry_count
        );
        outcome
    }

    async fn run_all(&self) -> Vec<DeliveryOutcome> {
        let tasks = match self.store.get_active_scheduled_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                log::error!("Failed to load active tasks for sync: {}", e);
                return Vec::new();
            }
        };
        log::info!("Running {} active task(s)", tasks.len());

        join_all(tasks.iter().map(|task| self.run_task(&task.id))).await
    }

    async fn record_failure(&self, outcome: &DeliveryOutcome) {
        self.record(outcome).await;
    }
}

#[cfg(test)]
mod tests;
