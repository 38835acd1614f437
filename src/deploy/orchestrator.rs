//! Deployment orchestration
//!
//! A deployment is a fixed sequence of phases chosen by its strategy. Every
//! phase is built from the same primitives: safety checks, a backup, a
//! migration engine run, traffic changes and monitoring windows. The record
//! in `_deployments` is rewritten after every phase transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::checks::{
    run_checks, CheckContext, CheckOutcome, DataIntegrityCheck, PerformanceBaselineCheck,
    SafetyCheck, SchemaValidationCheck, StoreConnectivityCheck,
};
use super::config::{DeploymentConfig, DeploymentStrategy, Environment};
use super::traffic::{TrafficController, TrafficTarget};
use crate::error::{ErrorCode, Result, SchemaFlowError};
use crate::events::{EventBus, EventKind, EventSource, Severity};
use crate::migration::{MigrationEngine, MigrationOptions, MigrationResult};
use crate::safety::{BackupManager, RollbackSystem};
use crate::schema::SchemaVersion;
use crate::store::{collect_all, collections, from_document, to_document, DocumentStore, Query, WriteGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Created => "created",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPhase {
    pub name: String,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Whether a failed deployment was rolled back, and how that went
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackInfo {
    pub triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub deployment_id: String,
    pub name: String,
    pub strategy: DeploymentStrategy,
    pub environment: Environment,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub phases: Vec<DeploymentPhase>,
    pub checks: Vec<CheckOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    pub rollback_info: RollbackInfo,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl DeploymentResult {
    fn new(id: &str, config: &DeploymentConfig) -> Self {
        Self {
            deployment_id: id.to_string(),
            name: config.name.clone(),
            strategy: config.strategy,
            environment: config.environment,
            from: config.from,
            to: config.to,
            status: DeploymentStatus::Created,
            current_phase: None,
            phases: phases_for(config.strategy)
                .iter()
                .map(|phase| DeploymentPhase {
                    name: phase.name().to_string(),
                    status: PhaseStatus::Pending,
                    started_at: None,
                    completed_at: None,
                    error: None,
                    notes: Vec::new(),
                })
                .collect(),
            checks: Vec::new(),
            migration: None,
            backup_id: None,
            rollback_info: RollbackInfo::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&DeploymentPhase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn succeeded(&self) -> bool {
        self.status == DeploymentStatus::Completed
    }
}

/// Building blocks a strategy is assembled from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    WaitForSchedule,
    PreChecks,
    Backup,
    PrepareTarget,
    Migration,
    WarmUp,
    SwitchTraffic,
    CanaryRelease,
    CanaryMonitoring,
    FullRollout,
    PostChecks,
    Monitoring,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::WaitForSchedule => "wait_for_schedule",
            Phase::PreChecks => "pre_checks",
            Phase::Backup => "backup",
            Phase::PrepareTarget => "prepare_target",
            Phase::Migration => "migration",
            Phase::WarmUp => "warm_up",
            Phase::SwitchTraffic => "switch_traffic",
            Phase::CanaryRelease => "canary_release",
            Phase::CanaryMonitoring => "canary_monitoring",
            Phase::FullRollout => "full_rollout",
            Phase::PostChecks => "post_checks",
            Phase::Monitoring => "monitoring",
        }
    }
}

fn phases_for(strategy: DeploymentStrategy) -> Vec<Phase> {
    use Phase::*;
    match strategy {
        DeploymentStrategy::RollingUpdate => {
            vec![PreChecks, Backup, Migration, PostChecks, Monitoring]
        }
        DeploymentStrategy::BlueGreen => vec![
            PreChecks,
            Backup,
            PrepareTarget,
            Migration,
            WarmUp,
            SwitchTraffic,
            PostChecks,
            Monitoring,
        ],
        DeploymentStrategy::Canary => vec![
            PreChecks,
            Backup,
            CanaryRelease,
            CanaryMonitoring,
            FullRollout,
            PostChecks,
        ],
        DeploymentStrategy::Immediate => vec![PreChecks, Migration],
        DeploymentStrategy::Scheduled => vec![
            WaitForSchedule,
            PreChecks,
            Backup,
            Migration,
            PostChecks,
            Monitoring,
        ],
    }
}

/// Mutable state of one deployment while it runs
struct RunState {
    result: DeploymentResult,
    cancel_rx: watch::Receiver<bool>,
    previous_target: Option<TrafficTarget>,
    new_target: Option<TrafficTarget>,
    switched: bool,
    canary_routed: bool,
}

impl RunState {
    fn id(&self) -> &str {
        &self.result.deployment_id
    }

    fn note(&mut self, index: usize, note: String) {
        if let Some(phase) = self.result.phases.get_mut(index) {
            phase.notes.push(note);
        }
    }
}

pub struct DeploymentOrchestrator {
    store: Arc<dyn DocumentStore>,
    engine: Arc<MigrationEngine>,
    backups: Arc<BackupManager>,
    rollbacks: Arc<RollbackSystem>,
    traffic: Arc<dyn TrafficController>,
    events: EventBus,
    pre_checks: Vec<Arc<dyn SafetyCheck>>,
    post_checks: Vec<Arc<dyn SafetyCheck>>,
    active: Arc<RwLock<HashMap<String, watch::Sender<bool>>>>,
}

impl DeploymentOrchestrator {
    /// Orchestrator with the built-in safety checks
    pub fn new(
        store: Arc<dyn DocumentStore>,
        engine: Arc<MigrationEngine>,
        backups: Arc<BackupManager>,
        rollbacks: Arc<RollbackSystem>,
        traffic: Arc<dyn TrafficController>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            engine,
            backups,
            rollbacks,
            traffic,
            events,
            pre_checks: vec![
                Arc::new(StoreConnectivityCheck),
                Arc::new(SchemaValidationCheck),
                Arc::new(PerformanceBaselineCheck::default()),
            ],
            post_checks: vec![Arc::new(DataIntegrityCheck::default())],
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_pre_check(mut self, check: Arc<dyn SafetyCheck>) -> Self {
        self.pre_checks.push(check);
        self
    }

    pub fn with_post_check(mut self, check: Arc<dyn SafetyCheck>) -> Self {
        self.post_checks.push(check);
        self
    }

    /// Drop the built-in post-deploy checks
    pub fn without_post_checks(mut self) -> Self {
        self.post_checks.clear();
        self
    }

    pub fn traffic(&self) -> &Arc<dyn TrafficController> {
        &self.traffic
    }

    /// Run a deployment to completion. Failures are reported in the result.
    pub async fn deploy(&self, config: DeploymentConfig) -> DeploymentResult {
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("deploy-{}", Uuid::new_v4()));
        let span = info_span!("deployment", id = %id, strategy = %config.strategy);
        self.deploy_inner(id, config).instrument(span).await
    }

    async fn deploy_inner(&self, id: String, config: DeploymentConfig) -> DeploymentResult {
        let started = Instant::now();
        let mut result = DeploymentResult::new(&id, &config);
        info!(
            "Deployment {} ({}) {} -> {} in {:?}",
            id, config.strategy, config.from, config.to, config.environment
        );

        if let Err(e) = config.validate() {
            error!("Deployment {} rejected: {}", id, e);
            result.status = DeploymentStatus::Failed;
            result.errors.push(e.to_string());
            skip_pending(&mut result);
            return self.finish(result, started).await;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut active = self.active.write().await;
            if active.contains_key(&id) {
                result.status = DeploymentStatus::Failed;
                result
                    .errors
                    .push(format!("deployment {} is already running", id));
                drop(active);
                return self.finish(result, started).await;
            }
            active.insert(id.clone(), cancel_tx);
        }
        self.persist(&result).await;

        result.status = DeploymentStatus::Running;
        let mut run = RunState {
            result,
            cancel_rx,
            previous_target: None,
            new_target: None,
            switched: false,
            canary_routed: false,
        };
        self.persist(&run.result).await;

        match self.run_phases(&config, &mut run).await {
            Ok(()) => {
                run.result.status = DeploymentStatus::Completed;
                info!("Deployment {} completed", id);
            }
            Err(e) if e.code() == ErrorCode::DEPLOYMENT_CANCELLED => {
                warn!("Deployment {} cancelled", id);
                run.result.status = DeploymentStatus::Cancelled;
                run.result.errors.push(e.to_string());
                skip_pending(&mut run.result);
            }
            Err(e) => {
                error!("Deployment {} failed: {}", id, e);
                run.result.status = DeploymentStatus::Failed;
                run.result.errors.push(e.to_string());
                skip_pending(&mut run.result);
                run.result.rollback_info = if config.rollback.automatic {
                    self.auto_rollback(&config, &mut run, &e).await
                } else {
                    RollbackInfo {
                        triggered: false,
                        reason: Some("automatic rollback disabled".to_string()),
                        ..RollbackInfo::default()
                    }
                };
            }
        }

        self.active.write().await.remove(&id);
        self.finish(run.result, started).await
    }

    async fn run_phases(&self, config: &DeploymentConfig, run: &mut RunState) -> Result<()> {
        let phases = phases_for(config.strategy);
        for (index, phase) in phases.iter().enumerate() {
            ensure_not_cancelled(run)?;
            self.set_phase_status(run, index, PhaseStatus::Running, None)
                .await;

            let outcome = self.run_phase(config, run, index, *phase).await;
            match &outcome {
                Ok(()) => {
                    self.set_phase_status(run, index, PhaseStatus::Completed, None)
                        .await
                }
                Err(e) if e.code() == ErrorCode::DEPLOYMENT_CANCELLED => {
                    self.set_phase_status(run, index, PhaseStatus::Skipped, Some(e.to_string()))
                        .await
                }
                Err(e) => {
                    self.set_phase_status(run, index, PhaseStatus::Failed, Some(e.to_string()))
                        .await
                }
            }
            outcome?;
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        config: &DeploymentConfig,
        run: &mut RunState,
        index: usize,
        phase: Phase,
    ) -> Result<()> {
        let id = run.id().to_string();
        match phase {
            Phase::WaitForSchedule => {
                let start_at = config.scheduled.as_ref().map(|s| s.start_at).ok_or_else(|| {
                    phase_error(phase, "scheduled deployment without a start time")
                })?;
                let wait = (start_at - Utc::now()).to_std().unwrap_or_default();
                run.note(index, format!("waiting {}s until {}", wait.as_secs(), start_at));
                wait_or_cancel(run, wait).await
            }
            Phase::PreChecks => self.checks(config, run, index, &self.pre_checks).await,
            Phase::PostChecks => self.checks(config, run, index, &self.post_checks).await,
            Phase::Backup => {
                let collections = self.engine.collections_for(config.from, config.to).await?;
                let backup_id = self
                    .backups
                    .create_backup(&id, &collections, &config.backup)
                    .await?;
                run.note(
                    index,
                    format!("backup {} of {} collection(s)", backup_id, collections.len()),
                );
                run.result.backup_id = Some(backup_id);
                Ok(())
            }
            Phase::PrepareTarget => {
                run.previous_target = Some(self.traffic.active_target().await);
                let target = self
                    .traffic
                    .prepare_target(&id, config.to)
                    .await
                    .map_err(|e| phase_error(phase, format!("{:#}", e)))?;
                run.note(index, format!("prepared {:?} target", target));
                run.new_target = Some(target);
                Ok(())
            }
            Phase::Migration => {
                let batch_size = match config.strategy {
                    DeploymentStrategy::RollingUpdate | DeploymentStrategy::Scheduled => {
                        config.rolling.batch_size
                    }
                    DeploymentStrategy::BlueGreen => config.blue_green.batch_size,
                    _ => config.migration.batch_size,
                };
                self.migrate(config, run, index, batch_size).await
            }
            Phase::WarmUp => {
                let target = run
                    .new_target
                    .ok_or_else(|| phase_error(phase, "no prepared target"))?;
                self.traffic
                    .warm_up(&id, target)
                    .await
                    .map_err(|e| phase_error(phase, format!("{:#}", e)))?;
                wait_or_cancel(run, config.blue_green.warmup_duration).await
            }
            Phase::SwitchTraffic => {
                let target = run
                    .new_target
                    .ok_or_else(|| phase_error(phase, "no prepared target"))?;
                self.traffic
                    .switch_traffic(&id, target)
                    .await
                    .map_err(|e| phase_error(phase, format!("{:#}", e)))?;
                run.switched = true;
                run.note(index, format!("traffic switched to {:?}", target));
                wait_or_cancel(run, config.blue_green.switch_duration).await
            }
            Phase::CanaryRelease => {
                let percentage = config.canary.traffic_percentage;
                self.traffic
                    .route_percentage(&id, percentage)
                    .await
                    .map_err(|e| phase_error(phase, format!("{:#}", e)))?;
                run.canary_routed = true;
                let options = MigrationOptions {
                    resume_from: None,
                    ..config.migration.clone()
                };
                let simulated = self
                    .engine
                    .execute_migration(config.from, config.to, options, true)
                    .await;
                run.note(
                    index,
                    format!(
                        "{}% of traffic routed; simulated run: {} document(s) would change",
                        percentage, simulated.stats.documents_updated
                    ),
                );
                if !simulated.success {
                    return Err(phase_error(
                        phase,
                        format!("canary simulation failed: {}", simulated.errors.join("; ")),
                    ));
                }
                Ok(())
            }
            Phase::CanaryMonitoring => {
                let canary = &config.canary;
                let average = self
                    .observe(run, phase, canary.monitor_duration, canary.sample_interval)
                    .await?;
                run.note(index, format!("average success rate {:.2}%", average));
                if average < canary.success_threshold {
                    return Err(SchemaFlowError::deployment(
                        ErrorCode::DEPLOYMENT_CANARY_UNHEALTHY,
                        format!(
                            "canary success rate {:.2}% is below the {:.2}% threshold",
                            average, canary.success_threshold
                        ),
                        Some(phase.name().to_string()),
                    ));
                }
                Ok(())
            }
            Phase::FullRollout => {
                self.migrate(config, run, index, config.migration.batch_size)
                    .await?;
                self.traffic
                    .route_percentage(&id, 100.0)
                    .await
                    .map_err(|e| phase_error(phase, format!("{:#}", e)))?;
                run.note(index, "100% of traffic routed".to_string());
                Ok(())
            }
            Phase::Monitoring => {
                // Held in-line so a failed health window can still roll back
                let rolling = &config.rolling;
                let average = self
                    .observe(run, phase, rolling.monitor_duration, rolling.sample_interval)
                    .await?;
                run.note(
                    index,
                    format!(
                        "average success rate {:.2}% over {}ms",
                        average,
                        rolling.monitor_duration.as_millis()
                    ),
                );
                if average < rolling.health_threshold {
                    return Err(phase_error(
                        phase,
                        format!(
                            "success rate {:.2}% is below the {:.2}% health threshold",
                            average, rolling.health_threshold
                        ),
                    ));
                }
                Ok(())
            }
        }
    }

    async fn checks(
        &self,
        config: &DeploymentConfig,
        run: &mut RunState,
        index: usize,
        checks: &[Arc<dyn SafetyCheck>],
    ) -> Result<()> {
        let ctx = CheckContext {
            deployment_id: run.id(),
            config,
            store: self.store.as_ref(),
            registry: self.engine.registry().as_ref(),
        };
        let outcomes = run_checks(checks, &ctx).await;

        let mut blocking = Vec::new();
        for outcome in &outcomes {
            if outcome.is_blocking() {
                blocking.push(format!("{}: {}", outcome.name, outcome.message));
            } else if !outcome.passed {
                run.result
                    .warnings
                    .push(format!("check {}: {}", outcome.name, outcome.message));
            }
        }
        run.note(
            index,
            format!(
                "{} of {} check(s) passed",
                outcomes.iter().filter(|o| o.passed).count(),
                outcomes.len()
            ),
        );
        run.result.checks.extend(outcomes);

        if !blocking.is_empty() {
            return Err(SchemaFlowError::safety(
                ErrorCode::SAFETY_CHECK_FAILED,
                format!("critical safety check failed: {}", blocking.join("; ")),
            ));
        }
        Ok(())
    }

    async fn migrate(
        &self,
        config: &DeploymentConfig,
        run: &mut RunState,
        index: usize,
        batch_size: usize,
    ) -> Result<()> {
        let options = MigrationOptions {
            batch_size,
            ..config.migration.clone()
        };
        let result = self
            .engine
            .execute_migration(config.from, config.to, options, false)
            .await;
        run.note(
            index,
            format!(
                "migration {}: {} updated, {} skipped, {} failed",
                result.migration_id,
                result.stats.documents_updated,
                result.stats.documents_skipped,
                result.stats.documents_failed
            ),
        );
        run.result.warnings.extend(result.warnings.iter().cloned());
        let success = result.success;
        let errors = result.errors.join("; ");
        run.result.migration = Some(result);
        if !success {
            return Err(SchemaFlowError::deployment(
                ErrorCode::DEPLOYMENT_PHASE_FAILED,
                format!("migration failed: {}", errors),
                Some(Phase::Migration.name().to_string()),
            ));
        }
        Ok(())
    }

    /// Average success rate sampled over `window`, at least one sample
    async fn observe(
        &self,
        run: &RunState,
        phase: Phase,
        window: Duration,
        interval: Duration,
    ) -> Result<f64> {
        let deadline = Instant::now() + window;
        let interval = interval.max(Duration::from_millis(1));
        let mut samples = Vec::new();
        loop {
            let rate = self
                .traffic
                .observe_success_rate(run.id())
                .await
                .map_err(|e| phase_error(phase, format!("{:#}", e)))?;
            debug!("{}: success rate {:.2}%", run.id(), rate);
            samples.push(rate);
            if Instant::now() + interval > deadline {
                break;
            }
            wait_or_cancel(run, interval).await?;
        }
        Ok(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    async fn auto_rollback(
        &self,
        config: &DeploymentConfig,
        run: &mut RunState,
        cause: &SchemaFlowError,
    ) -> RollbackInfo {
        let id = run.id().to_string();
        let reason = cause.to_string();

        if run.canary_routed {
            if let Err(e) = self.traffic.route_percentage(&id, 0.0).await {
                warn!("Could not withdraw canary traffic for {}: {:#}", id, e);
            }
        }
        if run.switched {
            if let Some(previous) = run.previous_target {
                match self.traffic.switch_traffic(&id, previous).await {
                    Ok(()) => info!("Switched traffic back to {:?}", previous),
                    Err(e) => {
                        run.result
                            .errors
                            .push(format!("could not switch traffic back: {:#}", e));
                    }
                }
            }
        }

        let Some(backup_id) = run.result.backup_id.clone() else {
            warn!("Deployment {} failed before a backup was taken", id);
            return RollbackInfo {
                triggered: false,
                reason: Some(format!("no backup available: {}", reason)),
                ..RollbackInfo::default()
            };
        };

        let migration_id = run
            .result
            .migration
            .as_ref()
            .map(|m| m.migration_id.clone())
            .unwrap_or_else(|| id.clone());
        warn!("Rolling back deployment {} from backup {}", id, backup_id);
        match self
            .rollbacks
            .rollback(&migration_id, config.from, &backup_id, &reason)
            .await
        {
            Ok(rollback) => {
                if !rollback.success {
                    run.result.errors.push(format!(
                        "rollback {} failed, operator intervention required: {}",
                        rollback.rollback_id,
                        rollback.errors.join("; ")
                    ));
                }
                RollbackInfo {
                    triggered: true,
                    reason: Some(reason),
                    rollback_id: Some(rollback.rollback_id),
                    success: Some(rollback.success),
                }
            }
            Err(e) => {
                run.result
                    .errors
                    .push(format!("rollback could not start: {}", e));
                RollbackInfo {
                    triggered: true,
                    reason: Some(reason),
                    rollback_id: None,
                    success: Some(false),
                }
            }
        }
    }

    /// Stop a running deployment at its next phase boundary or wait
    pub async fn cancel(&self, deployment_id: &str) -> Result<()> {
        let active = self.active.read().await;
        let sender = active.get(deployment_id).ok_or_else(|| {
            SchemaFlowError::deployment(
                ErrorCode::DEPLOYMENT_NOT_FOUND,
                format!("no running deployment {}", deployment_id),
                None,
            )
        })?;
        sender.send_replace(true);
        info!("Cancellation requested for {}", deployment_id);
        Ok(())
    }

    pub async fn active_deployments(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn get_deployment(&self, deployment_id: &str) -> Result<Option<DeploymentResult>> {
        match self.store.get(collections::DEPLOYMENTS, deployment_id).await? {
            Some(doc) => Ok(Some(from_document(&doc.data)?)),
            None => Ok(None),
        }
    }

    /// Every recorded deployment, newest first
    pub async fn list_deployments(&self) -> Result<Vec<DeploymentResult>> {
        let docs = collect_all(
            self.store.as_ref(),
            Query::collection(collections::DEPLOYMENTS).limit(200),
        )
        .await?;
        let mut deployments = Vec::with_capacity(docs.len());
        for doc in &docs {
            deployments.push(from_document::<DeploymentResult>(&doc.data)?);
        }
        deployments.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(deployments)
    }

    async fn set_phase_status(
        &self,
        run: &mut RunState,
        index: usize,
        status: PhaseStatus,
        error: Option<String>,
    ) {
        let Some(phase) = run.result.phases.get_mut(index) else {
            return;
        };
        let now = Utc::now();
        phase.status = status;
        match status {
            PhaseStatus::Running => phase.started_at = Some(now),
            _ => phase.completed_at = Some(now),
        }
        phase.error = error;
        let name = phase.name.clone();
        run.result.current_phase = Some(name.clone());

        debug!("Phase {} is {}", name, status.as_str());
        self.events.emit(
            if status == PhaseStatus::Failed {
                Severity::Error
            } else {
                Severity::Info
            },
            EventSource::Deployment,
            EventKind::DeploymentPhase {
                deployment_id: run.result.deployment_id.clone(),
                phase: name.clone(),
                status: status.as_str().to_string(),
            },
            format!("{}: phase {} {}", run.result.deployment_id, name, status.as_str()),
        );
        self.persist(&run.result).await;
    }

    async fn finish(&self, mut result: DeploymentResult, started: Instant) -> DeploymentResult {
        result.completed_at = Some(Utc::now());
        result.duration_ms = started.elapsed().as_millis() as u64;
        self.persist(&result).await;

        let severity = match result.status {
            DeploymentStatus::Completed => Severity::Info,
            DeploymentStatus::Cancelled => Severity::Warning,
            _ if result.rollback_info.success == Some(false) => Severity::Critical,
            _ => Severity::Error,
        };
        self.events.emit(
            severity,
            EventSource::Deployment,
            EventKind::DeploymentFinished {
                deployment_id: result.deployment_id.clone(),
                status: result.status.as_str().to_string(),
            },
            format!(
                "deployment {} {}",
                result.deployment_id,
                result.status.as_str()
            ),
        );
        result
    }

    async fn persist(&self, result: &DeploymentResult) {
        let document = match to_document(result) {
            Ok(document) => document,
            Err(e) => {
                warn!("Could not serialize deployment {}: {}", result.deployment_id, e);
                return;
            }
        };
        if let Err(e) = self
            .store
            .commit(WriteGroup::new().set(
                collections::DEPLOYMENTS,
                &result.deployment_id,
                document,
            ))
            .await
        {
            warn!("Could not persist deployment {}: {}", result.deployment_id, e);
        }
    }
}

fn skip_pending(result: &mut DeploymentResult) {
    for phase in result
        .phases
        .iter_mut()
        .filter(|p| p.status == PhaseStatus::Pending)
    {
        phase.status = PhaseStatus::Skipped;
    }
}

fn phase_error(phase: Phase, message: impl Into<String>) -> SchemaFlowError {
    SchemaFlowError::deployment(
        ErrorCode::DEPLOYMENT_PHASE_FAILED,
        message,
        Some(phase.name().to_string()),
    )
}

fn cancelled(run: &RunState) -> SchemaFlowError {
    SchemaFlowError::deployment(
        ErrorCode::DEPLOYMENT_CANCELLED,
        format!("deployment {} was cancelled", run.id()),
        run.result.current_phase.clone(),
    )
}

fn ensure_not_cancelled(run: &RunState) -> Result<()> {
    if *run.cancel_rx.borrow() {
        return Err(cancelled(run));
    }
    Ok(())
}

/// Sleep for `duration` unless the deployment is cancelled first
async fn wait_or_cancel(run: &RunState, duration: Duration) -> Result<()> {
    ensure_not_cancelled(run)?;
    if duration.is_zero() {
        return Ok(());
    }
    let cancelled_first = tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = until_cancelled(run.cancel_rx.clone()) => true,
    };
    if cancelled_first {
        return Err(cancelled(run));
    }
    Ok(())
}

/// Resolves once cancellation is requested; never if the sender is gone
async fn until_cancelled(mut cancel_rx: watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
