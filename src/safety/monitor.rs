//! Live monitoring of migration runs: metrics sampling, checkpoints,
//! alerts and cooperative pause/resume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::alert::{AlertEvaluator, AlertThresholds, MigrationMetrics, MonitorAlert};
use crate::error::{ErrorCode, Result, SchemaFlowError};
use crate::events::{EventBus, EventKind, EventSource, Severity};
use crate::store::{collections, from_document, to_document, DocumentStore, WriteGroup};

/// Lifecycle of a monitored migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Preparing,
    Running,
    Paused,
    Completed,
    Failed,
    RolledBack,
}

impl MonitorStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            MonitorStatus::Preparing | MonitorStatus::Running | MonitorStatus::Paused
        )
    }
}

/// Durable progress marker; a valid resume point when `can_resume_from`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub migration_id: String,
    /// Operations completed so far, which is also the index to resume at
    pub operation_index: usize,
    pub documents_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub can_resume_from: bool,
}

/// Monitoring record of one migration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationMonitor {
    pub id: String,
    pub status: MonitorStatus,
    pub metrics: MigrationMetrics,
    pub alerts: Vec<MonitorAlert>,
    pub checkpoints: Vec<Checkpoint>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationMonitor {
    fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            status: MonitorStatus::Preparing,
            metrics: MigrationMetrics::default(),
            alerts: Vec::new(),
            checkpoints: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Newest checkpoint that can be resumed from
    pub fn resume_point(&self) -> Option<&Checkpoint> {
        self.checkpoints.iter().rev().find(|c| c.can_resume_from)
    }
}

/// Progress reported by the engine after each page
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressUpdate {
    pub operation_index: usize,
    pub total_operations: usize,
    pub documents_processed: u64,
    pub documents_failed: u64,
}

/// Sampling cadence and alert thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    pub thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Where the run driving a monitor is relative to its page boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPosition {
    /// No run is attached, or it has returned
    Idle,
    /// Processing or committing a page
    Working,
    /// Stopped at a page boundary while paused
    Parked,
}

struct MonitorEntry {
    monitor: MigrationMonitor,
    evaluator: AlertEvaluator,
    started: Instant,
    status_tx: watch::Sender<MonitorStatus>,
    position_tx: Arc<watch::Sender<RunPosition>>,
    sampler: Option<JoinHandle<()>>,
}

/// The engine's side of a monitored run.
///
/// Subscribed to the monitor's status when the run starts. Once the monitor
/// is closed or rolled back the run never continues past a page boundary.
pub struct RunGate {
    id: String,
    status_rx: watch::Receiver<MonitorStatus>,
    position_tx: Arc<watch::Sender<RunPosition>>,
}

impl RunGate {
    /// Page boundary: returns once the run may continue
    pub async fn wait_while_paused(&mut self) -> Result<()> {
        loop {
            let status = *self.status_rx.borrow_and_update();
            match status {
                MonitorStatus::Preparing | MonitorStatus::Running => {
                    if self.status_rx.has_changed().is_err() {
                        return Err(self.halt(status));
                    }
                    self.position_tx.send_replace(RunPosition::Working);
                    return Ok(());
                }
                MonitorStatus::Paused => {
                    self.position_tx.send_replace(RunPosition::Parked);
                    debug!("Migration {} parked while paused", self.id);
                    if self.status_rx.changed().await.is_err() {
                        let last = *self.status_rx.borrow();
                        return Err(self.halt(last));
                    }
                }
                other => return Err(self.halt(other)),
            }
        }
    }

    /// Status as last observed by the run
    pub fn status(&self) -> MonitorStatus {
        *self.status_rx.borrow()
    }

    fn halt(&self, status: MonitorStatus) -> SchemaFlowError {
        self.position_tx.send_replace(RunPosition::Idle);
        warn!("Migration {} halted: monitor is {:?}", self.id, status);
        invalid_state(&self.id, "continue", status)
    }
}

impl Drop for RunGate {
    fn drop(&mut self) {
        self.position_tx.send_replace(RunPosition::Idle);
    }
}

/// Tracks active migration monitors and persists them in the store
#[derive(Clone)]
pub struct MonitoringService {
    store: Arc<dyn DocumentStore>,
    events: EventBus,
    config: MonitoringConfig,
    active: Arc<RwLock<HashMap<String, MonitorEntry>>>,
}

impl MonitoringService {
    pub fn new(store: Arc<dyn DocumentStore>, events: EventBus, config: MonitoringConfig) -> Self {
        Self {
            store,
            events,
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Create a monitor for `migration_id` and start periodic sampling
    pub async fn start_monitoring(&self, migration_id: &str) -> Result<MigrationMonitor> {
        let (monitor, _, _) = self.open(migration_id, RunPosition::Idle).await?;
        Ok(monitor)
    }

    /// Create a monitor for a run the caller drives. The returned gate must
    /// be checked at every page boundary.
    pub async fn start_run(&self, migration_id: &str) -> Result<RunGate> {
        let (_, status_rx, position_tx) = self.open(migration_id, RunPosition::Working).await?;
        Ok(RunGate {
            id: migration_id.to_string(),
            status_rx,
            position_tx,
        })
    }

    async fn open(
        &self,
        migration_id: &str,
        position: RunPosition,
    ) -> Result<(
        MigrationMonitor,
        watch::Receiver<MonitorStatus>,
        Arc<watch::Sender<RunPosition>>,
    )> {
        let monitor = MigrationMonitor::new(migration_id);
        let (status_rx, position_tx) = {
            let mut active = self.active.write().await;
            if active.contains_key(migration_id) {
                return Err(SchemaFlowError::safety(
                    ErrorCode::SAFETY_INVALID_STATE,
                    format!("migration {} is already being monitored", migration_id),
                ));
            }
            let (status_tx, status_rx) = watch::channel(monitor.status);
            let (position_tx, _) = watch::channel(position);
            let position_tx = Arc::new(position_tx);
            active.insert(
                migration_id.to_string(),
                MonitorEntry {
                    monitor: monitor.clone(),
                    evaluator: AlertEvaluator::new(self.config.thresholds.clone()),
                    started: Instant::now(),
                    status_tx,
                    position_tx: Arc::clone(&position_tx),
                    sampler: None,
                },
            );
            (status_rx, position_tx)
        };
        if let Err(e) = self.persist(&monitor).await {
            self.active.write().await.remove(migration_id);
            return Err(e);
        }

        let sampler = self.spawn_sampler(migration_id.to_string());
        if let Some(entry) = self.active.write().await.get_mut(migration_id) {
            entry.sampler = Some(sampler);
        }
        info!("Monitoring started for {}", migration_id);
        Ok((monitor, status_rx, position_tx))
    }

    fn spawn_sampler(&self, id: String) -> JoinHandle<()> {
        let service = self.clone();
        let period = self.config.sample_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match service.sample(&id).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!("Sampling {} failed: {}", id, e),
                }
            }
            debug!("Sampler for {} stopped", id);
        })
    }

    /// Take one metrics sample and evaluate alert rules. Returns false once
    /// the monitor is no longer active.
    pub async fn sample(&self, id: &str) -> Result<bool> {
        let memory_mb = current_process_memory_mb();
        let (snapshot, fired) = {
            let mut active = self.active.write().await;
            let Some(entry) = active.get_mut(id) else {
                return Ok(false);
            };
            if !entry.monitor.status.is_active() {
                return Ok(false);
            }
            let now = Utc::now();
            let elapsed = entry.started.elapsed().as_secs_f64();
            let metrics = &mut entry.monitor.metrics;
            metrics.memory_mb = memory_mb;
            metrics.documents_per_second = if elapsed > 0.0 {
                metrics.documents_processed as f64 / elapsed
            } else {
                0.0
            };
            metrics.error_rate = if metrics.documents_processed > 0 {
                metrics.documents_failed as f64 / metrics.documents_processed as f64
            } else {
                0.0
            };
            metrics.sampled_at = Some(now);

            // A paused run is not stuck, and a preparing one has no throughput yet
            let fired = if entry.monitor.status == MonitorStatus::Running {
                let last_progress = entry
                    .monitor
                    .latest_checkpoint()
                    .map(|c| c.created_at)
                    .unwrap_or(entry.monitor.started_at);
                entry
                    .evaluator
                    .check(&entry.monitor.metrics, last_progress, now)
            } else {
                Vec::new()
            };
            entry.monitor.alerts.extend(fired.iter().cloned());
            entry.monitor.updated_at = now;
            (entry.monitor.clone(), fired)
        };

        for alert in &fired {
            self.announce_alert(id, alert);
        }
        if !fired.is_empty() {
            self.persist(&snapshot).await?;
        }
        Ok(true)
    }

    /// Record progress in memory. Never blocks on storage.
    pub async fn update_progress(&self, id: &str, update: ProgressUpdate) {
        let mut active = self.active.write().await;
        let Some(entry) = active.get_mut(id) else {
            debug!("Progress for unmonitored migration {}", id);
            return;
        };
        let metrics = &mut entry.monitor.metrics;
        metrics.operation_index = update.operation_index;
        metrics.total_operations = update.total_operations;
        metrics.documents_processed = update.documents_processed;
        metrics.documents_failed = update.documents_failed;
        if entry.monitor.status == MonitorStatus::Preparing {
            entry.monitor.status = MonitorStatus::Running;
            entry.status_tx.send_replace(MonitorStatus::Running);
        }
        entry.monitor.updated_at = Utc::now();
    }

    /// Append a resumable checkpoint and persist the monitor
    pub async fn create_checkpoint(
        &self,
        id: &str,
        operation_index: usize,
        documents_processed: u64,
        backup_id: Option<String>,
    ) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            migration_id: id.to_string(),
            operation_index,
            documents_processed,
            backup_id,
            created_at: Utc::now(),
            can_resume_from: true,
        };
        let snapshot = self
            .mutate(id, |monitor| {
                monitor.checkpoints.push(checkpoint.clone());
                if monitor.status == MonitorStatus::Preparing {
                    monitor.status = MonitorStatus::Running;
                }
                Ok(())
            })
            .await?;
        self.persist(&snapshot).await?;
        self.events.emit(
            Severity::Info,
            EventSource::Monitor,
            EventKind::CheckpointCreated {
                monitor_id: id.to_string(),
                operation_index,
            },
            format!("checkpoint at operation {} for {}", operation_index, id),
        );
        Ok(checkpoint)
    }

    /// Attach an externally raised alert
    pub async fn add_alert(&self, id: &str, alert: MonitorAlert) -> Result<()> {
        let snapshot = self
            .mutate(id, |monitor| {
                monitor.alerts.push(alert.clone());
                Ok(())
            })
            .await?;
        self.persist(&snapshot).await?;
        self.announce_alert(id, &alert);
        Ok(())
    }

    /// Ask the run to stop at its next page boundary
    pub async fn pause_migration(&self, id: &str) -> Result<()> {
        let snapshot = self
            .mutate(id, |monitor| match monitor.status {
                MonitorStatus::Preparing | MonitorStatus::Running => {
                    monitor.status = MonitorStatus::Paused;
                    Ok(())
                }
                other => Err(invalid_state(id, "pause", other)),
            })
            .await?;
        self.persist(&snapshot).await?;
        info!("Migration {} paused", id);
        Ok(())
    }

    /// Resume a paused run from its newest resumable checkpoint
    pub async fn resume_migration(&self, id: &str) -> Result<Checkpoint> {
        let mut resume_point = None;
        let snapshot = self
            .mutate(id, |monitor| {
                if monitor.status != MonitorStatus::Paused {
                    return Err(invalid_state(id, "resume", monitor.status));
                }
                let Some(checkpoint) = monitor.resume_point().cloned() else {
                    return Err(SchemaFlowError::safety(
                        ErrorCode::SAFETY_NO_RESUME_POINT,
                        format!("migration {} has no checkpoint to resume from", id),
                    ));
                };
                monitor.status = MonitorStatus::Running;
                resume_point = Some(checkpoint);
                Ok(())
            })
            .await?;
        self.persist(&snapshot).await?;
        let checkpoint = resume_point.ok_or_else(|| {
            SchemaFlowError::safety(ErrorCode::SAFETY_NO_RESUME_POINT, "no resume point")
        })?;
        info!(
            "Migration {} resumed from operation {}",
            id, checkpoint.operation_index
        );
        Ok(checkpoint)
    }

    /// Cooperative pause point for callers without a [`RunGate`]: returns
    /// once the run may continue.
    ///
    /// Fails if the monitor is closed while paused, or was archived with a
    /// status other than completed.
    pub async fn wait_while_paused(&self, id: &str) -> Result<()> {
        let mut status_rx = {
            let active = self.active.read().await;
            match active.get(id) {
                Some(entry) => entry.status_tx.subscribe(),
                None => {
                    return match self.load(id).await? {
                        Some(monitor)
                            if matches!(
                                monitor.status,
                                MonitorStatus::Failed | MonitorStatus::RolledBack
                            ) =>
                        {
                            Err(invalid_state(id, "continue", monitor.status))
                        }
                        _ => Ok(()),
                    };
                }
            }
        };
        loop {
            let status = *status_rx.borrow_and_update();
            match status {
                MonitorStatus::Paused => {
                    debug!("Migration {} waiting while paused", id);
                    if status_rx.changed().await.is_err() {
                        return Err(invalid_state(id, "continue", *status_rx.borrow()));
                    }
                }
                MonitorStatus::Preparing | MonitorStatus::Running => return Ok(()),
                other => return Err(invalid_state(id, "continue", other)),
            }
        }
    }

    /// Wait until the run attached to `id` is parked at a page boundary or
    /// has returned. Returns at once when no run is attached.
    pub async fn wait_until_parked(&self, id: &str) {
        let mut position_rx = {
            let active = self.active.read().await;
            match active.get(id) {
                Some(entry) => entry.position_tx.subscribe(),
                None => return,
            }
        };
        loop {
            if *position_rx.borrow_and_update() != RunPosition::Working {
                return;
            }
            debug!("Waiting for migration {} to reach a page boundary", id);
            if position_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close a monitor with a final status, stop its sampler and archive it
    pub async fn complete_monitoring(&self, id: &str, status: MonitorStatus) -> Result<()> {
        let entry = self.active.write().await.remove(id);
        let mut monitor = match entry {
            Some(mut entry) => {
                if let Some(sampler) = entry.sampler.take() {
                    sampler.abort();
                }
                entry.status_tx.send_replace(status);
                entry.monitor
            }
            None => {
                let monitor = self.load(id).await?.ok_or_else(|| not_found(id))?;
                if !monitor.status.is_active() {
                    return Err(invalid_state(id, "close", monitor.status));
                }
                monitor
            }
        };
        let now = Utc::now();
        monitor.status = status;
        monitor.completed_at = Some(now);
        monitor.updated_at = now;
        self.persist(&monitor).await?;
        info!("Monitoring for {} closed as {:?}", id, status);
        Ok(())
    }

    /// Mark a finished or active monitor as rolled back
    pub async fn mark_rolled_back(&self, id: &str) -> Result<()> {
        if self.active.read().await.contains_key(id) {
            return self.complete_monitoring(id, MonitorStatus::RolledBack).await;
        }
        let Some(mut monitor) = self.load(id).await? else {
            debug!("No monitor recorded for {}", id);
            return Ok(());
        };
        monitor.status = MonitorStatus::RolledBack;
        monitor.updated_at = Utc::now();
        self.persist(&monitor).await
    }

    /// Current state of a monitor, active or archived
    pub async fn get_monitor(&self, id: &str) -> Result<Option<MigrationMonitor>> {
        if let Some(entry) = self.active.read().await.get(id) {
            return Ok(Some(entry.monitor.clone()));
        }
        self.load(id).await
    }

    async fn mutate<F>(&self, id: &str, change: F) -> Result<MigrationMonitor>
    where
        F: FnOnce(&mut MigrationMonitor) -> Result<()>,
    {
        let mut active = self.active.write().await;
        let entry = active.get_mut(id).ok_or_else(|| not_found(id))?;
        change(&mut entry.monitor)?;
        entry.monitor.updated_at = Utc::now();
        entry.status_tx.send_replace(entry.monitor.status);
        Ok(entry.monitor.clone())
    }

    fn announce_alert(&self, id: &str, alert: &MonitorAlert) {
        self.events.emit(
            alert.severity,
            EventSource::Monitor,
            EventKind::AlertRaised {
                monitor_id: id.to_string(),
                rule: alert.rule.clone(),
            },
            format!("{}: {}", id, alert.message),
        );
    }

    async fn persist(&self, monitor: &MigrationMonitor) -> Result<()> {
        let group = WriteGroup::new().set(
            collections::MIGRATION_MONITORS,
            &monitor.id,
            to_document(monitor)?,
        );
        self.store.commit(group).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<MigrationMonitor>> {
        match self.store.get(collections::MIGRATION_MONITORS, id).await? {
            Some(doc) => Ok(Some(from_document(&doc.data)?)),
            None => Ok(None),
        }
    }
}

fn not_found(id: &str) -> SchemaFlowError {
    SchemaFlowError::safety(
        ErrorCode::SAFETY_MONITOR_NOT_FOUND,
        format!("no monitor for migration {}", id),
    )
}

fn invalid_state(id: &str, action: &str, status: MonitorStatus) -> SchemaFlowError {
    SchemaFlowError::safety(
        ErrorCode::SAFETY_INVALID_STATE,
        format!("cannot {} migration {} while it is {:?}", action, id, status),
    )
}

/// Resident memory of this process in MiB, or 0 when unavailable
fn current_process_memory_mb() -> f64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0.0;
    };
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|process| process.memory() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}
