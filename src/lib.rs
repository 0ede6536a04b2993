// Source side
mod db_types;
mod driver;
mod mssql;
mod sqlite;

pub mod commands;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod delivery;
pub mod models;
pub mod query_execution;
pub mod scheduler;
pub mod security;
pub mod storage;
pub mod sync;
pub mod transform;

pub use db_types::{CellValue, Row, RowSet, SqlDialect};
pub use driver::{DriverRegistry, SourceConnection, SourceDriver};

use std::sync::Arc;
use std::time::Duration;

use crate::commands::AppCommands;
use crate::config::SyncConfig;
use crate::connection::ConnectionResolver;
use crate::delivery::transport::ReqwestTransport;
use crate::delivery::DeliveryClient;
use crate::query_execution::QueryExecutor;
use crate::scheduler::{Scheduler, TaskState};
use crate::storage::{ConfigStore, SqliteConfigStore};
use crate::sync::SyncService;

/// Running service: store, connection cache, scheduler and the command surface
/// a UI host calls into.
pub struct SyncApp {
    config: SyncConfig,
    store: SqliteConfigStore,
    resolver: Arc<ConnectionResolver>,
    scheduler: Arc<Scheduler>,
    commands: AppCommands,
}

impl SyncApp {
    pub async fn start(config: SyncConfig) -> Result<Self, String> {
        let key = crypto::load_or_create_key(&config.key_path())?;
        let store = SqliteConfigStore::open(&config.database_path(), Some(key)).await?;

        match store.purge_history(config.storage.history_retention_days).await {
            Ok(purged) if purged.deleted_outcomes + purged.deleted_logs > 0 => log::info!(
                "Purged {} delivery outcome(s) and {} log entr(ies) older than {} day(s)",
                purged.deleted_outcomes,
                purged.deleted_logs,
                purged.retention_days
            ),
            Ok(_) => {}
            Err(e) => log::warn!("History purge failed: {}", e),
        }

        let registry = Arc::new(DriverRegistry::with_defaults().await);
        log::info!("Source drivers: {}", registry.identifiers().await.join(", "));
        let resolver = Arc::new(ConnectionResolver::new(registry, config.connection.clone()));

        let transport = Arc::new(ReqwestTransport::new()?);
        let service = Arc::new(SyncService::new(
            Arc::new(store.clone()),
            resolver.clone(),
            QueryExecutor::new(&config.query),
            DeliveryClient::new(transport),
            config.api.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(service.clone(), config.scheduler.timezone));

        let tasks = store
            .get_active_scheduled_tasks()
            .await
            .map_err(|e| format!("Failed to load scheduled tasks: {}", e))?;
        let mut scheduled = 0usize;
        for task in &tasks {
            match scheduler.schedule(task).await {
                Ok(TaskState::Scheduled) => scheduled += 1,
                Ok(state) => log::debug!("Task '{}' left {}", task.id, state.as_str()),
                Err(e) => log::warn!("Task '{}' not scheduled: {}", task.id, e),
            }
        }
        log::info!("Scheduled {} of {} active task(s)", scheduled, tasks.len());

        if config.scheduler.system_sync_enabled {
            scheduler
                .start_system_sync(config.scheduler.system_sync_interval_minutes)
                .await
                .map_err(|e| e.to_string())?;
        }

        let commands = AppCommands::new(service, scheduler.clone())
            .with_preview_rows(config.query.preview_row_limit);

        Ok(Self {
            config,
            store,
            resolver,
            scheduler,
            commands,
        })
    }

    pub fn commands(&self) -> &AppCommands {
        &self.commands
    }

    pub fn store(&self) -> &SqliteConfigStore {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Stops timers, waits for in-flight firings, then closes source connections.
    pub async fn stop(&self) {
        let grace = Duration::from_secs(self.config.scheduler.shutdown_grace_secs);
        let abandoned = self.scheduler.shutdown(grace).await;
        if abandoned > 0 {
            log::warn!("{} sync firing(s) abandoned at shutdown", abandoned);
        }
        self.resolver.close_all().await;
        self.store.close().await;
    }
}
