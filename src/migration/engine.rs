//! Migration engine: resolves the path, orders operations and runs them in
//! bounded, atomically committed pages.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn, Instrument};

use super::apply::{apply_operation, DocumentChange};
use super::context::{MigrationContext, MigrationOptions, MigrationResult, OperationReport};
use super::operation::{MigrationOperation, OperationKind};
use super::ordering::{order_operations, OperationGraph};
use super::retry::RetryExecutor;
use crate::error::{ErrorCategory, ErrorCode, Result, SchemaFlowError};
use crate::events::{EventBus, EventKind, EventSource, Severity};
use crate::safety::monitor::{MonitorStatus, MonitoringService, ProgressUpdate, RunGate};
use crate::schema::{MigrationPlan, SchemaVersion, VersionApplication, VersionRegistry};
use crate::store::{BatchTotals, DocumentStore, Mutation, Query, StoredDocument, WriteBatcher};

/// Per-page settings derived from the run options
#[derive(Debug, Clone, Copy)]
struct PageSettings {
    concurrency: usize,
    continue_on_error: bool,
    dry_run: bool,
    write_group_limit: usize,
}

/// Result of processing and committing one page
#[derive(Debug, Default)]
struct PageOutcome {
    updated: u64,
    skipped: u64,
    failed: u64,
    errors: Vec<String>,
    warnings: Vec<String>,
    totals: BatchTotals,
}

pub struct MigrationEngine {
    store: Arc<dyn DocumentStore>,
    registry: Arc<VersionRegistry>,
    events: EventBus,
    operations: RwLock<BTreeMap<SchemaVersion, Vec<MigrationOperation>>>,
    monitoring: Option<Arc<MonitoringService>>,
}

impl MigrationEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<VersionRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            operations: RwLock::new(BTreeMap::new()),
            monitoring: None,
        }
    }

    /// Open a monitor for every real run
    pub fn with_monitoring(mut self, monitoring: Arc<MonitoringService>) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<VersionRegistry> {
        &self.registry
    }

    /// Attach operations that move data onto `version`.
    ///
    /// Ids must be unique across all versions. Dependencies inside the
    /// version are checked for cycles here; dependencies on other versions
    /// are resolved when a path is planned.
    pub async fn register_operations(
        &self,
        version: SchemaVersion,
        ops: Vec<MigrationOperation>,
    ) -> Result<()> {
        let mut registered = self.operations.write().await;
        let elsewhere: HashSet<String> = registered
            .iter()
            .filter(|(v, _)| **v != version)
            .flat_map(|(_, ops)| ops.iter().map(|op| op.id.clone()))
            .collect();

        let mut combined = registered.get(&version).cloned().unwrap_or_default();
        combined.extend(ops);

        let graph = OperationGraph::build(&combined, &elsewhere)?;
        graph.order()?;

        debug!(
            "Registered {} operation(s) for schema {}",
            combined.len(),
            version
        );
        registered.insert(version, combined);
        Ok(())
    }

    /// Flatten the operations for every version on the plan's path
    pub async fn plan_operations(&self, plan: &MigrationPlan) -> Result<Vec<MigrationOperation>> {
        let registered = self.operations.read().await;
        // Operations of versions at or below the source are already applied
        let mut satisfied: HashSet<String> = registered
            .range(..=plan.from)
            .flat_map(|(_, ops)| ops.iter().map(|op| op.id.clone()))
            .collect();
        let mut flat = Vec::new();
        for version in plan.versions() {
            let Some(ops) = registered.get(&version) else {
                continue;
            };
            let ordered = order_operations(ops, &satisfied)?;
            satisfied.extend(ordered.iter().map(|op| op.id.clone()));
            flat.extend(ordered);
        }
        Ok(flat)
    }

    /// Every collection a migration from `from` to `to` may write to
    pub async fn collections_for(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> Result<Vec<String>> {
        let plan = self.registry.plan_migration_path(from, to).await?;
        let ops = self.plan_operations(&plan).await?;
        let mut collections: Vec<String> =
            ops.iter().flat_map(|op| op.written_collections()).collect();
        collections.sort();
        collections.dedup();
        Ok(collections)
    }

    /// Run every operation between `from` and `to`.
    ///
    /// Expected failures are reported in the result rather than returned
    /// as errors.
    pub async fn execute_migration(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
        options: MigrationOptions,
        dry_run: bool,
    ) -> MigrationResult {
        let ctx = MigrationContext::new(from, to, options, dry_run);
        let span = ctx.span.clone();
        self.run(ctx).instrument(span).await
    }

    async fn run(&self, mut ctx: MigrationContext) -> MigrationResult {
        info!(
            "Starting migration {} from {} to {}{}",
            ctx.id,
            ctx.from,
            ctx.to,
            if ctx.dry_run { " (dry run)" } else { "" }
        );
        self.events.emit(
            Severity::Info,
            EventSource::Migration,
            EventKind::MigrationStarted {
                migration_id: ctx.id.clone(),
                from: ctx.from.to_string(),
                to: ctx.to.to_string(),
                dry_run: ctx.dry_run,
            },
            format!("migration {} started", ctx.id),
        );

        let operations = match self.prepare(&mut ctx).await {
            Ok(ops) => ops,
            Err(e) => {
                error!("Migration {} rejected: {}", ctx.id, e);
                ctx.errors.push(e.to_string());
                return self.finish(ctx, false, Vec::new()).await;
            }
        };

        let monitored = if ctx.dry_run {
            None
        } else {
            self.monitoring.clone()
        };
        let mut gate = None;
        if let Some(monitoring) = &monitored {
            match monitoring.start_run(&ctx.id).await {
                Ok(run_gate) => gate = Some(run_gate),
                Err(e) => warn!("Could not start monitoring for {}: {}", ctx.id, e),
            }
        }

        let executor = RetryExecutor::new(ctx.options.retry.clone());
        let start_index = ctx
            .options
            .resume_from
            .as_ref()
            .map(|c| c.operation_index)
            .unwrap_or(0);
        if start_index > 0 {
            info!("Resuming at operation {} of {}", start_index, operations.len());
        }

        let total = operations.len();
        let mut reports = Vec::with_capacity(total);
        let mut success = true;

        for (index, op) in operations.iter().enumerate().skip(start_index) {
            ctx.touched_collections.extend(op.written_collections());
            let mut report = OperationReport {
                operation_id: op.id.clone(),
                collection: op.collection.clone(),
                kind: op.kind.name().to_string(),
                ..OperationReport::default()
            };
            debug!("Running operation {} ({})", op.id, op.description);

            let outcome = self
                .run_operation(&mut ctx, &mut gate, &executor, op, index, total, &mut report)
                .await;
            ctx.stats.absorb(&report);

            match outcome {
                Ok(()) => {
                    report.completed = true;
                    ctx.stats.operations_completed += 1;
                    if let Some(monitoring) = &monitored {
                        if let Err(e) = monitoring
                            .create_checkpoint(
                                &ctx.id,
                                index + 1,
                                ctx.stats.documents_processed(),
                                None,
                            )
                            .await
                        {
                            warn!("Checkpoint after {} failed: {}", op.id, e);
                        }
                    }
                    reports.push(report);
                }
                Err(e) => {
                    ctx.stats.operations_failed += 1;
                    reports.push(report);
                    let message = format!("operation '{}' failed: {}", op.id, e);
                    error!("{}", message);
                    ctx.errors.push(message);
                    let fatal = matches!(
                        e.category(),
                        ErrorCategory::Configuration | ErrorCategory::Safety
                    );
                    if !ctx.options.continue_on_error || fatal {
                        success = false;
                        break;
                    }
                }
            }
        }
        // A pause requested during the last page still holds the run
        if success {
            if let Some(gate) = gate.as_mut() {
                if let Err(e) = gate.wait_while_paused().await {
                    error!("Migration {} stopped before completing: {}", ctx.id, e);
                    ctx.errors.push(e.to_string());
                    success = false;
                }
            }
        }
        ctx.stats.retries = executor.retries();

        if success && !ctx.dry_run {
            let stats = serde_json::to_value(&ctx.stats).ok();
            let application = VersionApplication::migration(&ctx.id, ctx.from, ctx.to, stats);
            if let Err(e) = self.registry.record_application(application).await {
                warn!("Could not record application of {}: {}", ctx.to, e);
                ctx.warnings
                    .push(format!("version application was not recorded: {}", e));
            }
        }

        if let (Some(monitoring), Some(gate)) = (&monitored, gate.take()) {
            if gate.status().is_active() {
                let status = if success {
                    MonitorStatus::Completed
                } else {
                    MonitorStatus::Failed
                };
                if let Err(e) = monitoring.complete_monitoring(&ctx.id, status).await {
                    warn!("Could not close monitor {}: {}", ctx.id, e);
                }
            } else {
                debug!("Monitor {} already closed as {:?}", ctx.id, gate.status());
            }
        }

        self.finish(ctx, success, reports).await
    }

    /// Validate options and resolve the ordered operation list
    async fn prepare(&self, ctx: &mut MigrationContext) -> Result<Vec<MigrationOperation>> {
        if ctx.options.batch_size == 0 {
            return Err(SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                "batch size must be at least 1",
            ));
        }

        let plan = self.registry.plan_migration_path(ctx.from, ctx.to).await?;
        ctx.warnings.extend(plan.warnings.iter().cloned());
        if !plan.is_valid {
            return Err(SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_INVALID_PATH,
                format!(
                    "invalid migration path {} -> {}: {}",
                    ctx.from,
                    ctx.to,
                    plan.errors.join("; ")
                ),
            ));
        }

        let operations = self.plan_operations(&plan).await?;
        if let Some(checkpoint) = &ctx.options.resume_from {
            if checkpoint.operation_index > operations.len() {
                return Err(SchemaFlowError::safety(
                    ErrorCode::SAFETY_NO_RESUME_POINT,
                    format!(
                        "checkpoint at operation {} is beyond the {} planned operation(s)",
                        checkpoint.operation_index,
                        operations.len()
                    ),
                ));
            }
        }
        ctx.stats.operations_total = operations.len();
        Ok(operations)
    }

    async fn run_operation(
        &self,
        ctx: &mut MigrationContext,
        gate: &mut Option<RunGate>,
        executor: &RetryExecutor,
        op: &MigrationOperation,
        index: usize,
        total: usize,
        report: &mut OperationReport,
    ) -> Result<()> {
        let settings = PageSettings {
            concurrency: ctx.options.concurrency.max(1),
            continue_on_error: ctx.options.continue_on_error,
            dry_run: ctx.dry_run,
            write_group_limit: ctx
                .options
                .write_group_limit
                .unwrap_or_else(|| self.store.max_write_group_size()),
        };
        let query_context = format!("query {} for {}", op.collection, op.id);
        let page_context = format!("page of {} for {}", op.collection, op.id);
        let mut cursor = None;

        loop {
            if let Some(gate) = gate.as_mut() {
                gate.wait_while_paused().await?;
            }

            let query = Query::collection(&op.collection)
                .limit(ctx.options.batch_size)
                .start_after(cursor.take());
            let store = Arc::clone(&self.store);
            let page = executor
                .execute(&query_context, move |_| {
                    let store = Arc::clone(&store);
                    let query = query.clone();
                    async move { store.query(&query).await.map_err(SchemaFlowError::from) }
                })
                .await?;
            if page.is_empty() {
                break;
            }
            let documents = &page.documents;
            report.scanned += documents.len() as u64;

            let outcome = executor
                .execute(&page_context, |attempt| {
                    self.process_page(op, documents, settings, executor.is_final(attempt))
                })
                .await;

            match outcome {
                Ok(outcome) => {
                    report.updated += outcome.updated;
                    report.skipped += outcome.skipped;
                    report.failed += outcome.failed;
                    report.write_groups += outcome.totals.groups as u64;
                    report.mutations += outcome.totals.mutations as u64;
                    report.largest_write_group =
                        report.largest_write_group.max(outcome.totals.largest_group);
                    ctx.errors.extend(outcome.errors);
                    ctx.warnings.extend(outcome.warnings);
                }
                Err(e) if settings.continue_on_error
                    && e.category() != ErrorCategory::Configuration =>
                {
                    warn!("Skipping page of {} after failure: {}", op.collection, e);
                    report.failed += documents.len() as u64;
                    ctx.errors.push(format!("operation '{}': {}", op.id, e));
                }
                Err(e) => return Err(e),
            }

            let processed = ctx.stats.documents_processed()
                + report.updated
                + report.skipped
                + report.failed;
            self.events.emit(
                Severity::Info,
                EventSource::Migration,
                EventKind::MigrationProgress {
                    migration_id: ctx.id.clone(),
                    operation_index: index,
                    total_operations: total,
                    documents_processed: processed,
                },
                format!(
                    "{}: operation {}/{} processed {} document(s)",
                    ctx.id,
                    index + 1,
                    total,
                    processed
                ),
            );
            if let (Some(monitoring), false) = (&self.monitoring, ctx.dry_run) {
                let failed = ctx.stats.documents_failed + report.failed;
                monitoring
                    .update_progress(
                        &ctx.id,
                        ProgressUpdate {
                            operation_index: index,
                            total_operations: total,
                            documents_processed: processed,
                            documents_failed: failed,
                        },
                    )
                    .await;
            }

            match page.next_cursor.clone() {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(())
    }

    /// Decide every document's change, then commit the page through one
    /// batcher. Retried as a unit; idempotent operations make a retry after
    /// a partially committed page safe.
    async fn process_page(
        &self,
        op: &MigrationOperation,
        documents: &[StoredDocument],
        settings: PageSettings,
        final_attempt: bool,
    ) -> Result<PageOutcome> {
        let mut outcome = PageOutcome::default();
        let mut mutations: Vec<Mutation> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        if let OperationKind::Custom { executor } = &op.kind {
            match executor.execute(&op.collection, documents).await {
                Ok(custom) => {
                    let mut touched = HashSet::new();
                    for mutation in &custom {
                        touched.insert(mutation.document_id().to_string());
                    }
                    outcome.updated = touched.len() as u64;
                    outcome.skipped = documents.len().saturating_sub(touched.len()) as u64;
                    mutations = custom;
                }
                Err(e) => failures.push(format!("custom executor: {:#}", e)),
            }
        } else {
            let changes: Vec<(usize, anyhow::Result<DocumentChange>)> =
                stream::iter(0..documents.len())
                    .map(|i| {
                        let doc = &documents[i];
                        async move { (i, apply_operation(&op.kind, &op.collection, doc).await) }
                    })
                    .buffered(settings.concurrency)
                    .collect()
                    .await;

            for (i, change) in changes {
                let doc = &documents[i];
                match change {
                    Ok(DocumentChange::Unchanged) => outcome.skipped += 1,
                    Ok(DocumentChange::Update(doc_mutations)) => {
                        outcome.updated += 1;
                        mutations.extend(doc_mutations);
                    }
                    Ok(DocumentChange::Rejected(reason)) => {
                        outcome.skipped += 1;
                        outcome.warnings.push(reason);
                    }
                    Err(e) => failures.push(format!("document {}: {:#}", doc.id, e)),
                }
            }
        }

        if !failures.is_empty() {
            if !(final_attempt && settings.continue_on_error) {
                return Err(SchemaFlowError::migration_with_code(
                    ErrorCode::MIGRATION_HOOK_FAILED,
                    format!(
                        "{} failure(s) in {}, first: {}",
                        failures.len(),
                        op.collection,
                        failures[0]
                    ),
                    Some(op.id.clone()),
                ));
            }
            warn!(
                "Recording {} failed document(s) in {} and continuing",
                failures.len(),
                op.collection
            );
            outcome.failed = failures.len() as u64;
            outcome.errors = failures
                .into_iter()
                .map(|f| format!("operation '{}': {}", op.id, f))
                .collect();
        }

        let mut batcher =
            WriteBatcher::with_limit(self.store.as_ref(), settings.write_group_limit, settings.dry_run);
        for mutation in mutations {
            batcher.push(mutation).await?;
        }
        batcher.flush().await?;
        outcome.totals = batcher.totals();
        Ok(outcome)
    }

    async fn finish(
        &self,
        ctx: MigrationContext,
        success: bool,
        reports: Vec<OperationReport>,
    ) -> MigrationResult {
        let result = ctx.finish(success, reports);
        info!(
            "Migration {} {}: {} updated, {} skipped, {} failed in {}ms",
            result.migration_id,
            if result.success { "succeeded" } else { "failed" },
            result.stats.documents_updated,
            result.stats.documents_skipped,
            result.stats.documents_failed,
            result.stats.duration_ms
        );
        self.events.emit(
            if result.success {
                Severity::Info
            } else {
                Severity::Error
            },
            EventSource::Migration,
            EventKind::MigrationCompleted {
                migration_id: result.migration_id.clone(),
                success: result.success,
                documents_updated: result.stats.documents_updated,
            },
            format!(
                "migration {} {}",
                result.migration_id,
                if result.success { "completed" } else { "failed" }
            ),
        );
        result
    }
}
