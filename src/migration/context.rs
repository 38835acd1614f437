//! Run options, statistics and results of a migration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::Span;
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::safety::monitor::Checkpoint;
use crate::schema::SchemaVersion;

/// Caller-tunable knobs for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Documents fetched per page
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Documents of a page processed at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub continue_on_error: bool,

    /// Cap on mutations per write group, below the store's own cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_group_limit: Option<usize>,

    /// Skip operations already covered by this checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<Checkpoint>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
            continue_on_error: false,
            write_group_limit: None,
            resume_from: None,
        }
    }
}

impl MigrationOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn resume_from(mut self, checkpoint: Checkpoint) -> Self {
        self.resume_from = Some(checkpoint);
        self
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_concurrency() -> usize {
    4
}

/// Aggregate statistics for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationStats {
    pub operations_total: usize,
    pub operations_completed: usize,
    pub operations_failed: usize,
    pub documents_scanned: u64,
    pub documents_updated: u64,
    pub documents_skipped: u64,
    pub documents_failed: u64,
    /// Write groups committed, or that would have been in a dry run
    pub write_groups: u64,
    pub mutations: u64,
    pub largest_write_group: usize,
    pub retries: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl MigrationStats {
    pub fn documents_processed(&self) -> u64 {
        self.documents_updated + self.documents_skipped + self.documents_failed
    }

    /// Failed documents as a fraction of processed ones
    pub fn error_rate(&self) -> f64 {
        let processed = self.documents_processed();
        if processed == 0 {
            0.0
        } else {
            self.documents_failed as f64 / processed as f64
        }
    }

    pub(crate) fn absorb(&mut self, report: &OperationReport) {
        self.documents_scanned += report.scanned;
        self.documents_updated += report.updated;
        self.documents_skipped += report.skipped;
        self.documents_failed += report.failed;
        self.write_groups += report.write_groups;
        self.mutations += report.mutations;
        self.largest_write_group = self.largest_write_group.max(report.largest_write_group);
    }
}

/// Outcome of one operation within a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationReport {
    pub operation_id: String,
    pub collection: String,
    pub kind: String,
    pub scanned: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub write_groups: u64,
    pub mutations: u64,
    pub largest_write_group: usize,
    pub completed: bool,
}

/// State threaded through one run, owned by the engine for its duration
#[derive(Debug)]
pub struct MigrationContext {
    pub id: String,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub dry_run: bool,
    pub options: MigrationOptions,
    pub stats: MigrationStats,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub touched_collections: BTreeSet<String>,
    pub span: Span,
}

impl MigrationContext {
    pub fn new(
        from: SchemaVersion,
        to: SchemaVersion,
        options: MigrationOptions,
        dry_run: bool,
    ) -> Self {
        let id = format!("mig-{}", Uuid::new_v4());
        let span = tracing::info_span!("migration", id = %id, from = %from, to = %to, dry_run);
        Self {
            id,
            from,
            to,
            dry_run,
            options,
            stats: MigrationStats {
                started_at: Some(Utc::now()),
                ..MigrationStats::default()
            },
            errors: Vec::new(),
            warnings: Vec::new(),
            touched_collections: BTreeSet::new(),
            span,
        }
    }

    /// Close the run and produce its result
    pub fn finish(mut self, success: bool, operations: Vec<OperationReport>) -> MigrationResult {
        let finished = Utc::now();
        self.stats.finished_at = Some(finished);
        if let Some(started) = self.stats.started_at {
            self.stats.duration_ms = (finished - started).num_milliseconds().max(0) as u64;
        }
        MigrationResult {
            migration_id: self.id,
            from: self.from,
            to: self.to,
            dry_run: self.dry_run,
            success,
            stats: self.stats,
            errors: self.errors,
            warnings: self.warnings,
            operations,
            touched_collections: self.touched_collections.into_iter().collect(),
        }
    }
}

/// What a migration run did, or in a dry run would have done
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub migration_id: String,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub dry_run: bool,
    pub success: bool,
    pub stats: MigrationStats,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub operations: Vec<OperationReport>,
    pub touched_collections: Vec<String>,
}
