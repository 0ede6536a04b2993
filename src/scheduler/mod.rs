// =====================================================
// TASK SCHEDULER
// Cron timers per task, overlap guard, system-wide sync loop
// =====================================================

pub mod cron;

use crate::config::ScheduleTimezone;
use crate::models::{DeliveryErrorKind, DeliveryOutcome, ScheduledTask};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use self::cron::CronSchedule;

/// Pipeline capability the scheduler invokes on every firing.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run_task(&self, task_id: &str) -> DeliveryOutcome;
    async fn run_all(&self) -> Vec<DeliveryOutcome>;

    /// Records an outcome the runner never produced itself, e.g. for a
    /// firing that panicked.
    async fn record_failure(&self, outcome: &DeliveryOutcome);
}

/// Failed outcome for a firing whose task panicked or was cancelled.
pub fn aborted_outcome(
    task_id: &str,
    error: tokio::task::JoinError,
    started_at: DateTime<Utc>,
) -> DeliveryOutcome {
    let reason = if error.is_panic() {
        let payload = error.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string())
    } else {
        error.to_string()
    };
    DeliveryOutcome::failed_before_delivery(
        task_id,
        DeliveryErrorKind::Fatal,
        &format!("Sync firing aborted: {}", reason),
        started_at,
    )
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Unscheduled,
    Scheduled,
    Firing,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unscheduled => "unscheduled",
            Self::Scheduled => "scheduled",
            Self::Firing => "firing",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression for task '{task_id}': {reason}")]
    InvalidCron { task_id: String, reason: String },
    #[error("System sync interval must be at least one minute")]
    InvalidInterval,
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTaskStatus {
    pub task_id: String,
    pub name: String,
    pub cron_expression: String,
    pub state: TaskState,
    pub next_run_at: Option<DateTime<Utc>>,
    pub fire_count: u64,
    pub skipped_overlaps: u64,
    pub last_outcome: Option<DeliveryOutcome>,
}

#[derive(Debug)]
struct SlotInfo {
    name: String,
    schedule: CronSchedule,
    state: TaskState,
    next_run_at: Option<DateTime<Utc>>,
    fire_count: u64,
    skipped_overlaps: u64,
    last_outcome: Option<DeliveryOutcome>,
}

/// Runtime record of one scheduled task, shared with its timer loop.
#[derive(Debug)]
struct TaskSlot {
    task_id: String,
    in_flight: AtomicBool,
    info: Mutex<SlotInfo>,
}

struct TaskEntry {
    slot: Arc<TaskSlot>,
    cancel: CancellationToken,
}

pub struct Scheduler {
    runner: Arc<dyn SyncRunner>,
    timezone: ScheduleTimezone,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    system_sync: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn SyncRunner>, timezone: ScheduleTimezone) -> Self {
        Self {
            runner,
            timezone,
            tasks: Mutex::new(HashMap::new()),
            system_sync: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Registers (or replaces) the timer for `task`. Inactive tasks end up unscheduled.
    pub async fn schedule(&self, task: &ScheduledTask) -> Result<TaskState, SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }

        let schedule =
            CronSchedule::parse(&task.cron_expression).map_err(|reason| {
                log::warn!("Rejected schedule for task '{}': {}", task.id, reason);
                SchedulerError::InvalidCron {
                    task_id: task.id.clone(),
                    reason,
                }
            })?;

        if !task.active {
            self.unschedule(&task.id).await;
            log::info!("Task '{}' is inactive, no timer registered", task.id);
            return Ok(TaskState::Unscheduled);
        }

        let first_run = next_fire(&schedule, self.timezone, Utc::now());
        let mut tasks = self.tasks.lock().await;
        let slot = match tasks.remove(&task.id) {
            Some(existing) => {
                existing.cancel.cancel();
                {
                    let mut info = existing.slot.info.lock().await;
                    info.name = task.name.clone();
                    info.schedule = schedule.clone();
                    info.next_run_at = first_run;
                    if info.state != TaskState::Firing {
                        info.state = TaskState::Scheduled;
                    }
                }
                existing.slot
            }
            None => Arc::new(TaskSlot {
                task_id: task.id.clone(),
                in_flight: AtomicBool::new(false),
                info: Mutex::new(SlotInfo {
                    name: task.name.clone(),
                    schedule: schedule.clone(),
                    state: TaskState::Scheduled,
                    next_run_at: first_run,
                    fire_count: 0,
                    skipped_overlaps: 0,
                    last_outcome: None,
                }),
            }),
        };

        let cancel = self.shutdown.child_token();
        tokio::spawn(run_task_timer(
            slot.clone(),
            schedule,
            self.timezone,
            self.runner.clone(),
            self.tracker.clone(),
            cancel.clone(),
        ));
        tasks.insert(task.id.clone(), TaskEntry { slot, cancel });

        log::info!(
            "Scheduled task '{}' ({}) with cron '{}'",
            task.name,
            task.id,
            task.cron_expression
        );
        Ok(TaskState::Scheduled)
    }

    /// Cancels the timer for `task_id`. A firing already in progress runs to completion.
    pub async fn unschedule(&self, task_id: &str) -> bool {
        let removed = self.tasks.lock().await.remove(task_id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                log::info!("Unscheduled task '{}'", task_id);
                true
            }
            None => false,
        }
    }

    pub async fn reschedule(&self, task: &ScheduledTask) -> Result<TaskState, SchedulerError> {
        self.unschedule(&task.id).await;
        self.schedule(task).await
    }

    pub async fn state(&self, task_id: &str) -> TaskState {
        let slot = {
            let tasks = self.tasks.lock().await;
            match tasks.get(task_id) {
                Some(entry) => entry.slot.clone(),
                None => return TaskState::Unscheduled,
            }
        };
        let info = slot.info.lock().await;
        info.state
    }

    pub async fn status(&self) -> Vec<ScheduledTaskStatus> {
        let slots: Vec<Arc<TaskSlot>> = {
            let tasks = self.tasks.lock().await;
            tasks.values().map(|entry| entry.slot.clone()).collect()
        };

        let mut statuses = Vec::with_capacity(slots.len());
        for slot in slots {
            let info = slot.info.lock().await;
            statuses.push(ScheduledTaskStatus {
                task_id: slot.task_id.clone(),
                name: info.name.clone(),
                cron_expression: info.schedule.expression().to_string(),
                state: info.state,
                next_run_at: info.next_run_at,
                fire_count: info.fire_count,
                skipped_overlaps: info.skipped_overlaps,
                last_outcome: info.last_outcome.clone(),
            });
        }
        statuses.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        statuses
    }

    /// Runs `SyncRunner::run_all` every `interval_minutes`, independent of task timers.
    pub async fn start_system_sync(&self, interval_minutes: u64) -> Result<(), SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        if interval_minutes == 0 {
            return Err(SchedulerError::InvalidInterval);
        }

        let cancel = self.shutdown.child_token();
        if let Some(previous) = self.system_sync.lock().await.replace(cancel.clone()) {
            previous.cancel();
        }

        let runner = self.runner.clone();
        let tracker = self.tracker.clone();
        let period = Duration::from_secs(interval_minutes * 60);
        let in_flight = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if in_flight.swap(true, Ordering::SeqCst) {
                    log::warn!("System sync still running, skipping this interval");
                    continue;
                }

                let runner = runner.clone();
                let in_flight = in_flight.clone();
                tracker.spawn(async move {
                    match tokio::spawn(async move { runner.run_all().await }).await {
                        Ok(outcomes) => {
                            let failed = outcomes.iter().filter(|outcome| !outcome.success).count();
                            log::info!(
                                "System sync finished: {} task(s), {} failed",
                                outcomes.len(),
                                failed
                            );
                        }
                        Err(e) => log::error!("System sync aborted: {}", e),
                    }
                    in_flight.store(false, Ordering::SeqCst);
                });
            }
            log::debug!("System sync loop stopped");
        });

        log::info!("System sync enabled every {} minute(s)", interval_minutes);
        Ok(())
    }

    pub async fn stop_system_sync(&self) -> bool {
        match self.system_sync.lock().await.take() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every timer, then waits up to `grace` for in-flight firings.
    /// Returns the number of firings still running when the grace period ended.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.shutdown.cancel();
        self.tasks.lock().await.clear();
        self.system_sync.lock().await.take();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            let remaining = self.tracker.len();
            log::warn!(
                "Scheduler shutdown grace of {:?} elapsed with {} firing(s) still running",
                grace,
                remaining
            );
            return remaining;
        }
        log::info!("Scheduler stopped");
        0
    }
}

fn next_fire(
    schedule: &CronSchedule,
    timezone: ScheduleTimezone,
    previous: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match timezone {
        ScheduleTimezone::Utc => schedule.next_after(&previous),
        ScheduleTimezone::Local => schedule
            .next_after(&previous.with_timezone(&Local))
            .map(|next| next.with_timezone(&Utc)),
    }
}

async fn run_task_timer(
    slot: Arc<TaskSlot>,
    schedule: CronSchedule,
    timezone: ScheduleTimezone,
    runner: Arc<dyn SyncRunner>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    let mut previous = Utc::now();

    loop {
        let Some(next) = next_fire(&schedule, timezone, previous) else {
            log::warn!(
                "Cron '{}' for task '{}' has no upcoming run, timer stopped",
                schedule,
                slot.task_id
            );
            return;
        };
        slot.info.lock().await.next_run_at = Some(next);

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = sleep(wait) => {}
        }
        // Stepping from the slot, not the clock, keeps each slot firing once.
        previous = next;

        if slot.in_flight.swap(true, Ordering::SeqCst) {
            slot.info.lock().await.skipped_overlaps += 1;
            log::warn!(
                "Task '{}' is still running from a previous firing, skipping slot {}",
                slot.task_id,
                next.to_rfc3339()
            );
            continue;
        }

        {
            let mut info = slot.info.lock().await;
            // Unscheduled while waiting for the slot lock.
            if cancel.is_cancelled() {
                slot.in_flight.store(false, Ordering::SeqCst);
                return;
            }
            info.state = TaskState::Firing;
            info.fire_count += 1;
        }
        log::info!("Firing task '{}' for slot {}", slot.task_id, next.to_rfc3339());

        let slot = slot.clone();
        let runner = runner.clone();
        tracker.spawn(async move {
            let task_id = slot.task_id.clone();
            let started_at = Utc::now();
            let task_runner = runner.clone();
            let firing = tokio::spawn(async move { task_runner.run_task(&task_id).await });
            let outcome = match firing.await {
                Ok(outcome) => {
                    if outcome.success {
                        log::info!(
                            "Task '{}' delivered {} record(s) in {} ms",
                            slot.task_id,
                            outcome.record_count,
                            outcome.duration_ms
                        );
                    } else {
                        log::warn!(
                            "Task '{}' failed: {}",
                            slot.task_id,
                            outcome.error_message.as_deref().unwrap_or("unknown error")
                        );
                    }
                    outcome
                }
                Err(e) => {
                    log::error!("Task '{}' firing aborted: {}", slot.task_id, e);
                    let outcome = aborted_outcome(&slot.task_id, e, started_at);
                    runner.record_failure(&outcome).await;
                    outcome
                }
            };

            {
                let mut info = slot.info.lock().await;
                info.last_outcome = Some(outcome);
                info.state = TaskState::Scheduled;
            }
            slot.in_flight.store(false, Ordering::SeqCst);
        });
    }
}
