//! Time-driven backup orchestration.
//!
//! One background task owns the [`BackupEngine`]. On every tick it decides
//! which of full backup, incremental backup and retention are due and runs
//! them one after another on the blocking pool, so at most one backup or
//! retention operation is ever in flight. Produced artifacts are handed to the
//! [`SyncQueue`] after their metadata is committed.

use crate::cloud::SyncQueue;
use crate::config::Config;
use crate::engine::BackupEngine;
use crate::store::{BackupKind, Snapshot};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    StopRequested,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    FullBackup,
    IncrementalBackup,
    Retention,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Task::FullBackup => "full_backup",
            Task::IncrementalBackup => "incremental_backup",
            Task::Retention => "retention",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub tick: std::time::Duration,
    pub full_interval: Duration,
    pub incremental_interval: Duration,
    pub retention_interval: Duration,
    pub stop_timeout: std::time::Duration,
}

impl ScheduleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick: std::time::Duration::from_secs(config.scheduler.tick_seconds),
            full_interval: config.backup_schedule.full_interval(),
            incremental_interval: config.backup_schedule.incremental_interval(),
            retention_interval: Duration::hours(i64::from(config.scheduler.retention_interval_hours)),
            stop_timeout: std::time::Duration::from_secs(config.scheduler.stop_timeout_seconds),
        }
    }
}

/// In-memory "last attempted" markers.
///
/// A marker advances when its task completes, whether or not it produced an
/// artifact. Failed attempts leave it untouched so the task re-fires on the
/// next tick.
#[derive(Debug, Clone, Default)]
pub struct ScheduleTracker {
    pub last_full_attempt: Option<DateTime<Utc>>,
    pub last_incremental_attempt: Option<DateTime<Utc>>,
    pub last_retention: Option<DateTime<Utc>>,
}

fn elapsed(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    match last {
        Some(last) => now - last >= interval,
        None => true,
    }
}

impl ScheduleTracker {
    /// Full backup is due when neither a committed full backup nor a full
    /// attempt happened within the interval.
    pub fn full_due(&self, settings: &ScheduleSettings, last_full_backup: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let reference = last_full_backup.max(self.last_full_attempt);
        elapsed(reference, now, settings.full_interval)
    }

    pub fn incremental_due(&self, settings: &ScheduleSettings, now: DateTime<Utc>) -> bool {
        elapsed(self.last_incremental_attempt, now, settings.incremental_interval)
    }

    pub fn retention_due(&self, settings: &ScheduleSettings, now: DateTime<Utc>) -> bool {
        elapsed(self.last_retention, now, settings.retention_interval)
    }
}

/// What one tick did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub completed: Vec<Task>,
    pub failed: Vec<Task>,
    pub artifacts: Vec<Snapshot>,
}

/// Engine plus schedule bookkeeping; runs on the blocking pool
pub struct TickRunner {
    engine: BackupEngine,
    tracker: ScheduleTracker,
    settings: ScheduleSettings,
}

impl TickRunner {
    pub fn new(engine: BackupEngine, settings: ScheduleSettings) -> Self {
        Self {
            engine,
            tracker: ScheduleTracker::default(),
            settings,
        }
    }

    pub fn tracker(&self) -> &ScheduleTracker {
        &self.tracker
    }

    pub fn engine(&mut self) -> &mut BackupEngine {
        &mut self.engine
    }

    /// Evaluate and run every due task. A failing task is logged and never
    /// keeps the others from running.
    pub fn run_tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let now = now.trunc_subsecs(0);
        let mut report = TickReport::default();

        let last_full_backup = self.engine.metadata().last_full_backup_timestamp;
        if self.tracker.full_due(&self.settings, last_full_backup, now) {
            match self.engine.backup_at(BackupKind::Full, now) {
                Ok(snapshot) => {
                    self.tracker.last_full_attempt = Some(now);
                    // A fresh baseline leaves nothing for an incremental this tick
                    self.tracker.last_incremental_attempt = Some(now);
                    report.completed.push(Task::FullBackup);
                    report.artifacts.extend(snapshot);
                }
                Err(e) => {
                    error!(task = %Task::FullBackup, error = %e, "Scheduled task failed");
                    report.failed.push(Task::FullBackup);
                }
            }
        }

        if self.tracker.incremental_due(&self.settings, now) {
            match self.engine.backup_at(BackupKind::Incremental, now) {
                Ok(snapshot) => {
                    self.tracker.last_incremental_attempt = Some(now);
                    if snapshot.as_ref().is_some_and(|s| s.kind == BackupKind::Full) {
                        self.tracker.last_full_attempt = Some(now);
                    }
                    report.completed.push(Task::IncrementalBackup);
                    report.artifacts.extend(snapshot);
                }
                Err(e) => {
                    error!(task = %Task::IncrementalBackup, error = %e, "Scheduled task failed");
                    report.failed.push(Task::IncrementalBackup);
                }
            }
        }

        if self.tracker.retention_due(&self.settings, now) {
            match self.engine.cleanup_at(now) {
                Ok(outcome) => {
                    self.tracker.last_retention = Some(now);
                    debug!(removed = outcome.removed.len(), "Retention pass finished");
                    report.completed.push(Task::Retention);
                }
                Err(e) => {
                    error!(task = %Task::Retention, error = %e, "Scheduled task failed");
                    report.failed.push(Task::Retention);
                }
            }
        }

        report
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Scheduler {
    runner: Arc<Mutex<TickRunner>>,
    sync: Option<Arc<SyncQueue>>,
    state: Arc<Mutex<SchedulerState>>,
    tick: std::time::Duration,
    stop_timeout: std::time::Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(engine: BackupEngine, settings: ScheduleSettings, sync: Option<Arc<SyncQueue>>) -> Self {
        Self {
            tick: settings.tick,
            stop_timeout: settings.stop_timeout,
            runner: Arc::new(Mutex::new(TickRunner::new(engine, settings))),
            sync,
            state: Arc::new(Mutex::new(SchedulerState::Idle)),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.state)
    }

    /// Spawn the control loop. Calling it while already running is a no-op.
    /// Returns whether the loop is running afterwards.
    pub fn start(&mut self) -> bool {
        let mut state = lock(&self.state);
        match *state {
            SchedulerState::Running => {
                warn!("Scheduler already running");
                return true;
            }
            SchedulerState::StopRequested => {
                warn!("Scheduler is still stopping, not restarting");
                return false;
            }
            SchedulerState::Idle | SchedulerState::Stopped => {}
        }

        self.cancel = CancellationToken::new();
        *state = SchedulerState::Running;
        drop(state);

        info!(tick_secs = self.tick.as_secs_f64(), "Scheduler started");
        self.handle = Some(tokio::spawn(run_loop(
            Arc::clone(&self.runner),
            self.sync.clone(),
            Arc::clone(&self.state),
            self.cancel.clone(),
            self.tick,
        )));
        true
    }

    /// Signal the loop and wait up to the stop timeout for it to finish.
    /// Returns false when the loop had to be abandoned.
    pub async fn stop(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        *lock(&self.state) = SchedulerState::StopRequested;
        self.cancel.cancel();
        info!("Scheduler stop requested");

        match tokio::time::timeout(self.stop_timeout, handle).await {
            Ok(Ok(())) => {
                info!("Scheduler stopped");
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "Scheduler loop panicked");
                *lock(&self.state) = SchedulerState::Stopped;
                true
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.stop_timeout.as_secs(),
                    "Scheduler did not stop in time, abandoning loop"
                );
                false
            }
        }
    }
}

fn dispatch_sync(sync: Option<&Arc<SyncQueue>>, report: &TickReport) {
    let Some(queue) = sync else {
        return;
    };
    for snapshot in &report.artifacts {
        queue.enqueue(&snapshot.path);
    }
    queue.retry_pending();
}

async fn run_loop(
    runner: Arc<Mutex<TickRunner>>,
    sync: Option<Arc<SyncQueue>>,
    state: Arc<Mutex<SchedulerState>>,
    cancel: CancellationToken,
    tick: std::time::Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let tick_runner = Arc::clone(&runner);
        match tokio::task::spawn_blocking(move || lock(&tick_runner).run_tick(Utc::now())).await {
            Ok(report) => {
                if !report.completed.is_empty() || !report.failed.is_empty() {
                    debug!(
                        completed = report.completed.len(),
                        failed = report.failed.len(),
                        artifacts = report.artifacts.len(),
                        "Tick finished"
                    );
                }
                dispatch_sync(sync.as_ref(), &report);
            }
            Err(e) => error!(error = %e, "Tick panicked"),
        }
    }

    *lock(&state) = SchedulerState::Stopped;
    debug!("Scheduler loop exited");
}
