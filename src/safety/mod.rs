//! Safety system: backups, dry-run analysis, live monitoring and rollback

pub mod alert;
pub mod backup;
pub mod dry_run;
pub mod monitor;
pub mod rollback;

pub use alert::{AlertEvaluator, AlertThresholds, MigrationMetrics, MonitorAlert};
pub use backup::{
    BackupConfig, BackupManager, BackupRecord, BackupStatus, CollectionBackup, CollectionRestore,
    RestoreOptions, RestoreResult,
};
pub use dry_run::{
    BusinessRuleHook, DataIntegrityHook, DryRunContext, DryRunEngine, DryRunIssue, DryRunReport,
    HookPhase, IssueSeverity, SchemaCompatibilityHook, ValidationHook,
};
pub use monitor::{
    Checkpoint, MigrationMonitor, MonitorStatus, MonitoringConfig, MonitoringService,
    ProgressUpdate, RunGate,
};
pub use rollback::{
    RollbackAction, RollbackPlan, RollbackResult, RollbackStatus, RollbackStep, RollbackSystem,
    StepStatus,
};
