//! Task scheduler.
//!
//! A one-minute tick loop finds due tasks, stamps `last_run` and
//! recomputes `next_scheduled_at` *before* dispatch (an overrunning
//! task must not re-trigger on the next tick), then runs each task on
//! its own worker with a short stagger between same-tick dispatches.
//! Every update/new body acquires a shared single-permit semaphore, so
//! at most one task touches the repositories at a time system-wide.

pub mod persistence;

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::domain::{parse_specific_time, IntervalUnit, ScheduledTask, TaskKind};
use crate::engine::{create_cycle, StrategyOverrides, UpdateEngine};
use crate::error::{CyclerError, Result};
use crate::exchange::Exchange;

/// Polling interval of the tick loop.
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Delay between dispatches of the same tick, reducing repository
/// contention when several tasks come due together.
const DISPATCH_STAGGER: Duration = Duration::from_secs(2);

/// Bound on one task execution, semaphore wait included.
const EXECUTION_DEADLINE: Duration = Duration::from_secs(600);

pub struct Scheduler {
    engine: Arc<UpdateEngine>,
    config: AppConfig,
    tasks: Arc<RwLock<Vec<ScheduledTask>>>,
    tasks_path: PathBuf,
    /// Single permit: update/new bodies share the repositories.
    db_gate: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(engine: Arc<UpdateEngine>, config: AppConfig, shutdown: watch::Receiver<bool>) -> Self {
        let tasks_path = PathBuf::from(&config.scheduler.tasks_file);
        Self {
            engine,
            config,
            tasks: Arc::new(RwLock::new(Vec::new())),
            tasks_path,
            db_gate: Arc::new(Semaphore::new(1)),
            shutdown,
        }
    }

    /// Restore the persisted task list, or seed the defaults when the
    /// file is absent. Stale `next_scheduled_at` values are recomputed
    /// immediately.
    pub async fn load_or_bootstrap(&self) -> Result<()> {
        let mut tasks = persistence::load_tasks(&self.tasks_path).await?;
        if tasks.is_empty() {
            tasks = self.default_tasks()?;
            info!(count = tasks.len(), "seeded default task list");
        }

        let now = Utc::now();
        for task in &mut tasks {
            let stale = task
                .next_scheduled_at
                .map(|next| next <= now)
                .unwrap_or(true);
            if stale {
                task.next_scheduled_at = Some(task.compute_next(now));
            }
        }

        persistence::save_tasks(&self.tasks_path, &tasks).await?;
        *self.tasks.write().await = tasks;
        Ok(())
    }

    fn default_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let mut tasks = Vec::new();
        for exchange in self.config.exchanges.enabled() {
            let mut task = ScheduledTask::interval(
                &format!("update-{exchange}"),
                TaskKind::Update,
                self.config.scheduler.update_interval_minutes,
                IntervalUnit::Minutes,
            );
            task.exchange = Some(exchange);
            tasks.push(task);
        }
        let at = parse_specific_time(&self.config.scheduler.new_cycle_time)
            .map_err(CyclerError::Task)?;
        tasks.push(ScheduledTask::daily("new-cycles", TaskKind::New, at));
        Ok(tasks)
    }

    /// Add a task and persist the full list.
    pub async fn add_task(&self, mut task: ScheduledTask) -> Result<()> {
        task.validate().map_err(CyclerError::Task)?;
        let mut tasks = self.tasks.write().await;
        if tasks.iter().any(|t| t.name == task.name) {
            return Err(CyclerError::Task(format!(
                "task '{}' already exists",
                task.name
            )));
        }
        task.next_scheduled_at = Some(task.compute_next(Utc::now()));
        tasks.push(task);
        persistence::save_tasks(&self.tasks_path, &tasks).await
    }

    /// Remove a task by name and persist; returns whether it existed.
    pub async fn remove_task(&self, name: &str) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|t| t.name != name);
        if tasks.len() == before {
            return Ok(false);
        }
        persistence::save_tasks(&self.tasks_path, &tasks).await?;
        Ok(true)
    }

    pub async fn tasks(&self) -> Vec<ScheduledTask> {
        self.tasks.read().await.clone()
    }

    /// Tick loop; exits when the shutdown signal flips.
    pub async fn run(&self) {
        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        info!(
            tick_secs = TICK_INTERVAL.as_secs(),
            "scheduler running"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One tick: stamp + reschedule every due task, then dispatch each
    /// on its own worker with a stagger in between.
    async fn tick(&self) {
        let now = Utc::now();
        let due: Vec<ScheduledTask> = {
            let mut tasks = self.tasks.write().await;
            let mut due = Vec::new();
            for task in tasks.iter_mut() {
                if task.is_due(now) {
                    task.last_run = Some(now);
                    task.next_scheduled_at = None;
                    task.next_scheduled_at = Some(task.compute_next(now));
                    due.push(task.clone());
                }
            }
            due
        };

        for (i, task) in due.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(DISPATCH_STAGGER).await;
            }
            let engine = Arc::clone(&self.engine);
            let config = self.config.clone();
            let gate = Arc::clone(&self.db_gate);
            tokio::spawn(async move {
                run_task(engine, config, gate, task).await;
            });
        }
    }
}

/// Execute one task under the shared repository gate and the bounded
/// deadline. Waiting on the gate counts against the deadline; a task
/// that cannot acquire it in time abandons with a log instead of
/// blocking forever.
async fn run_task(
    engine: Arc<UpdateEngine>,
    config: AppConfig,
    gate: Arc<Semaphore>,
    task: ScheduledTask,
) {
    let started = Instant::now();
    info!(task = %task.name, kind = %task.kind, "task dispatched");

    let permit = match timeout(EXECUTION_DEADLINE, gate.acquire_owned()).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => {
            error!(task = %task.name, "repository gate closed, abandoning task");
            return;
        }
        Err(_) => {
            warn!(
                task = %task.name,
                "timed out waiting for the repository gate, abandoning task"
            );
            return;
        }
    };

    let remaining = EXECUTION_DEADLINE.saturating_sub(started.elapsed());
    let result = timeout(remaining, execute_body(&engine, &config, &task)).await;
    drop(permit);

    match result {
        Ok(()) => info!(
            task = %task.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task finished"
        ),
        Err(_) => warn!(task = %task.name, "task exceeded its execution deadline"),
    }
}

async fn execute_body(engine: &Arc<UpdateEngine>, config: &AppConfig, task: &ScheduledTask) {
    let overrides = StrategyOverrides::from_task(task);
    match task.kind {
        TaskKind::Update => {
            Arc::clone(engine).run_pass(task.exchange, overrides).await;
        }
        TaskKind::New => {
            let targets: Vec<Exchange> = match task.exchange {
                Some(exchange) => vec![exchange],
                None => config.exchanges.enabled(),
            };
            for exchange in targets {
                let Some(client) = engine.client(exchange) else {
                    warn!(%exchange, "no client for exchange, skipping cycle creation");
                    continue;
                };
                let settings = config.exchanges.get(exchange);
                match create_cycle(client.as_ref(), settings, &overrides, engine.cycles()).await {
                    Ok(id) => info!(%exchange, cycle = id, "new cycle created"),
                    Err(e) => warn!(%exchange, error = %e, "cycle creation failed"),
                }
            }
        }
    }
}
