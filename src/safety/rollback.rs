//! Rollback plans: pause the run, restore its backup, reassert the prior
//! schema version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::backup::{BackupManager, RestoreOptions, RestoreResult};
use super::monitor::{MonitorStatus, MonitoringService};
use crate::error::{ErrorCode, Result, SchemaFlowError};
use crate::events::{EventBus, EventKind, EventSource, Severity};
use crate::schema::{SchemaVersion, VersionRegistry};
use crate::store::{collections, from_document, to_document, DocumentStore, WriteGroup};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackAction {
    PauseMigration,
    RestoreBackup { backup_id: String },
    ReassertVersion { version: SchemaVersion },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStep {
    pub order: usize,
    pub action: RollbackAction,
    pub description: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RollbackStep {
    fn new(order: usize, action: RollbackAction, description: String) -> Self {
        Self {
            order,
            action,
            description,
            status: StepStatus::Pending,
            error: None,
            completed_at: None,
        }
    }

    fn finish(&mut self, status: StepStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Planned,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub id: String,
    pub migration_id: String,
    pub target_version: SchemaVersion,
    pub backup_id: String,
    pub steps: Vec<RollbackStep>,
    pub status: RollbackStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub rollback_id: String,
    pub migration_id: String,
    pub success: bool,
    pub steps: Vec<RollbackStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreResult>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

pub struct RollbackSystem {
    store: Arc<dyn DocumentStore>,
    registry: Arc<VersionRegistry>,
    backups: Arc<BackupManager>,
    monitoring: Arc<MonitoringService>,
    events: EventBus,
}

impl RollbackSystem {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<VersionRegistry>,
        backups: Arc<BackupManager>,
        monitoring: Arc<MonitoringService>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            registry,
            backups,
            monitoring,
            events,
        }
    }

    /// Build and persist the ordered steps for undoing `migration_id`
    pub async fn create_rollback_plan(
        &self,
        migration_id: &str,
        target_version: SchemaVersion,
        backup_id: &str,
    ) -> Result<RollbackPlan> {
        if self.backups.get_backup(backup_id).await?.is_none() {
            return Err(SchemaFlowError::rollback(
                ErrorCode::ROLLBACK_PLAN_INVALID,
                format!(
                    "cannot plan rollback of {}: backup {} does not exist",
                    migration_id, backup_id
                ),
                None,
            ));
        }

        let steps = vec![
            RollbackStep::new(
                1,
                RollbackAction::PauseMigration,
                format!("Pause migration {}", migration_id),
            ),
            RollbackStep::new(
                2,
                RollbackAction::RestoreBackup {
                    backup_id: backup_id.to_string(),
                },
                format!("Restore collections from backup {}", backup_id),
            ),
            RollbackStep::new(
                3,
                RollbackAction::ReassertVersion {
                    version: target_version,
                },
                format!("Reassert schema version {}", target_version),
            ),
        ];
        let plan = RollbackPlan {
            id: format!("rollback-{}", Uuid::new_v4()),
            migration_id: migration_id.to_string(),
            target_version,
            backup_id: backup_id.to_string(),
            steps,
            status: RollbackStatus::Planned,
            created_at: Utc::now(),
            reason: None,
            completed_at: None,
        };
        self.save_plan(&plan).await?;
        info!(
            "Planned rollback {} of {} to {}",
            plan.id, migration_id, target_version
        );
        Ok(plan)
    }

    pub async fn get_rollback(&self, rollback_id: &str) -> Result<Option<RollbackPlan>> {
        match self.store.get(collections::ROLLBACKS, rollback_id).await? {
            Some(doc) => Ok(Some(from_document(&doc.data)?)),
            None => Ok(None),
        }
    }

    /// Plan and run a rollback in one call
    pub async fn rollback(
        &self,
        migration_id: &str,
        target_version: SchemaVersion,
        backup_id: &str,
        reason: &str,
    ) -> Result<RollbackResult> {
        let plan = self
            .create_rollback_plan(migration_id, target_version, backup_id)
            .await?;
        Ok(self.execute_rollback(&plan.id, reason).await)
    }

    /// Run a persisted plan's steps in order.
    ///
    /// A failed restore halts the rollback; later steps stay pending.
    pub async fn execute_rollback(&self, rollback_id: &str, reason: &str) -> RollbackResult {
        let span = info_span!("rollback", id = %rollback_id);
        self.execute_inner(rollback_id, reason).instrument(span).await
    }

    async fn execute_inner(&self, rollback_id: &str, reason: &str) -> RollbackResult {
        let started = Instant::now();
        let mut plan = match self.get_rollback(rollback_id).await {
            Ok(Some(plan)) if plan.status == RollbackStatus::Planned => plan,
            Ok(Some(plan)) => {
                return failed_result(
                    rollback_id,
                    &plan.migration_id,
                    format!("rollback {} is already {:?}", rollback_id, plan.status),
                )
            }
            Ok(None) => {
                return failed_result(
                    rollback_id,
                    "",
                    format!("rollback {} not found", rollback_id),
                )
            }
            Err(e) => return failed_result(rollback_id, "", e.to_string()),
        };

        warn!(
            "Rolling back migration {} to {}: {}",
            plan.migration_id, plan.target_version, reason
        );
        plan.status = RollbackStatus::Running;
        plan.reason = Some(reason.to_string());
        self.save_plan_logged(&plan).await;

        let mut errors = Vec::new();
        let mut restore = None;
        let mut paused = false;
        let migration_id = plan.migration_id.clone();

        for step in plan.steps.iter_mut() {
            step.status = StepStatus::Running;
            match step.action.clone() {
                RollbackAction::PauseMigration => match self.pause(&migration_id).await {
                    Ok(true) => {
                        paused = true;
                        step.finish(StepStatus::Completed, None)
                    }
                    Ok(false) => step.finish(StepStatus::Skipped, None),
                    Err(e) => {
                        warn!("Pausing {} before rollback failed: {}", migration_id, e);
                        step.finish(StepStatus::Skipped, Some(e.to_string()));
                    }
                },
                RollbackAction::RestoreBackup { backup_id } => {
                    let result = self
                        .backups
                        .restore_backup(&backup_id, &RestoreOptions::exact())
                        .await;
                    let ok = result.success;
                    if ok {
                        step.finish(StepStatus::Completed, None);
                    } else {
                        let err = SchemaFlowError::rollback(
                            ErrorCode::ROLLBACK_RESTORE_FAILED,
                            format!(
                                "restore from {} failed: {}",
                                backup_id,
                                result.errors.join("; ")
                            ),
                            Some(rollback_id.to_string()),
                        );
                        error!("{}", err);
                        step.finish(StepStatus::Failed, Some(err.to_string()));
                        errors.push(err.to_string());
                    }
                    restore = Some(result);
                    if !ok {
                        break;
                    }
                }
                RollbackAction::ReassertVersion { version } => {
                    match self
                        .registry
                        .reassert_version(version, &migration_id, reason)
                        .await
                    {
                        Ok(()) => step.finish(StepStatus::Completed, None),
                        Err(e) => {
                            error!("Reasserting {} failed: {}", version, e);
                            step.finish(StepStatus::Failed, Some(e.to_string()));
                            errors.push(e.to_string());
                            break;
                        }
                    }
                }
            }
        }

        let success = errors.is_empty();
        if success {
            if let Err(e) = self.monitoring.mark_rolled_back(&migration_id).await {
                warn!("Could not mark monitor {} rolled back: {}", migration_id, e);
            }
            match self.backups.delete_backup(&plan.backup_id).await {
                Ok(_) => info!("Deleted backup {} after rollback", plan.backup_id),
                Err(e) => warn!("Could not delete backup {}: {}", plan.backup_id, e),
            }
        } else if paused {
            // Data may be half restored; the paused run must not carry on
            if let Err(e) = self
                .monitoring
                .complete_monitoring(&migration_id, MonitorStatus::Failed)
                .await
            {
                warn!("Could not close monitor {}: {}", migration_id, e);
            }
        }
        plan.status = if success {
            RollbackStatus::Completed
        } else {
            RollbackStatus::Failed
        };
        plan.completed_at = Some(Utc::now());
        self.save_plan_logged(&plan).await;

        info!(
            "Rollback {} {}",
            rollback_id,
            if success { "completed" } else { "failed" }
        );
        self.events.emit(
            if success {
                Severity::Warning
            } else {
                Severity::Critical
            },
            EventSource::Rollback,
            EventKind::RollbackCompleted {
                rollback_id: rollback_id.to_string(),
                success,
            },
            format!(
                "rollback of {} to {} {}",
                migration_id,
                plan.target_version,
                if success { "completed" } else { "failed" }
            ),
        );

        RollbackResult {
            rollback_id: rollback_id.to_string(),
            migration_id,
            success,
            steps: plan.steps,
            restore,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Pause the run if it is still live and wait for it to stop between
    /// pages. Returns whether anything was paused.
    async fn pause(&self, migration_id: &str) -> Result<bool> {
        let paused = match self.monitoring.get_monitor(migration_id).await? {
            Some(monitor)
                if matches!(
                    monitor.status,
                    MonitorStatus::Preparing | MonitorStatus::Running
                ) =>
            {
                self.monitoring.pause_migration(migration_id).await?;
                true
            }
            _ => false,
        };
        // An already paused run may still be committing its last page
        self.monitoring.wait_until_parked(migration_id).await;
        Ok(paused)
    }

    async fn save_plan(&self, plan: &RollbackPlan) -> Result<()> {
        self.store
            .commit(WriteGroup::new().set(collections::ROLLBACKS, &plan.id, to_document(plan)?))
            .await?;
        Ok(())
    }

    async fn save_plan_logged(&self, plan: &RollbackPlan) {
        if let Err(e) = self.save_plan(plan).await {
            warn!("Could not persist rollback {}: {}", plan.id, e);
        }
    }
}

fn failed_result(rollback_id: &str, migration_id: &str, message: String) -> RollbackResult {
    error!("{}", message);
    RollbackResult {
        rollback_id: rollback_id.to_string(),
        migration_id: migration_id.to_string(),
        success: false,
        steps: Vec::new(),
        restore: None,
        errors: vec![message],
        duration_ms: 0,
    }
}
