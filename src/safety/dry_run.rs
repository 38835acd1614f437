//! Dry-run analysis: the migration engine's simulated run wrapped in
//! pre and post validation hooks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::migration::{
    MigrationEngine, MigrationOperation, MigrationOptions, MigrationResult, OperationKind,
};
use crate::schema::{MigrationPlan, SchemaVersion};
use crate::store::{DocumentStore, Query};

/// Estimated duration above which a run should be split
const CHUNKING_THRESHOLD_MINUTES: u32 = 60;
/// Affected documents above which blue/green is preferable
const BLUE_GREEN_THRESHOLD_DOCUMENTS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunIssue {
    pub severity: IssueSeverity,
    /// Hook that reported the issue
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

impl DryRunIssue {
    pub fn new(
        severity: IssueSeverity,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            source: source.into(),
            message: message.into(),
            collection: None,
        }
    }

    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    /// Before the simulated run
    Pre,
    /// After the simulated run, with its result available
    Post,
}

/// What a hook gets to look at
pub struct DryRunContext<'a> {
    pub plan: &'a MigrationPlan,
    pub operations: &'a [MigrationOperation],
    pub store: &'a dyn DocumentStore,
    /// Present in the post phase only
    pub result: Option<&'a MigrationResult>,
}

#[async_trait]
pub trait ValidationHook: Send + Sync {
    fn name(&self) -> &str;

    fn phase(&self) -> HookPhase;

    async fn check(&self, ctx: &DryRunContext<'_>) -> anyhow::Result<Vec<DryRunIssue>>;
}

/// Flags plan errors, warnings and breaking schemas
pub struct SchemaCompatibilityHook;

#[async_trait]
impl ValidationHook for SchemaCompatibilityHook {
    fn name(&self) -> &str {
        "schema_compatibility"
    }

    fn phase(&self) -> HookPhase {
        HookPhase::Pre
    }

    async fn check(&self, ctx: &DryRunContext<'_>) -> anyhow::Result<Vec<DryRunIssue>> {
        let mut issues: Vec<DryRunIssue> = ctx
            .plan
            .errors
            .iter()
            .map(|e| DryRunIssue::new(IssueSeverity::Critical, self.name(), e.clone()))
            .collect();
        issues.extend(
            ctx.plan
                .warnings
                .iter()
                .map(|w| DryRunIssue::new(IssueSeverity::Medium, self.name(), w.clone())),
        );
        for schema in ctx.plan.path.iter().filter(|s| s.breaking) {
            issues.push(DryRunIssue::new(
                IssueSeverity::High,
                self.name(),
                format!("schema {} introduces breaking changes", schema.version),
            ));
        }
        Ok(issues)
    }
}

/// Samples live documents for required fields of the target schema that
/// nothing on the path will supply
pub struct DataIntegrityHook {
    pub sample_size: usize,
}

impl Default for DataIntegrityHook {
    fn default() -> Self {
        Self { sample_size: 100 }
    }
}

#[async_trait]
impl ValidationHook for DataIntegrityHook {
    fn name(&self) -> &str {
        "data_integrity"
    }

    fn phase(&self) -> HookPhase {
        HookPhase::Pre
    }

    async fn check(&self, ctx: &DryRunContext<'_>) -> anyhow::Result<Vec<DryRunIssue>> {
        let Some(target) = ctx.plan.target_schema() else {
            return Ok(Vec::new());
        };
        let mut issues = Vec::new();

        for collection in &target.collections {
            let mut supplied: HashSet<&str> = HashSet::new();
            let mut opaque = false;
            for op in ctx.operations.iter().filter(|op| op.collection == collection.name) {
                match &op.kind {
                    OperationKind::AddField { field, .. } => {
                        supplied.insert(field);
                    }
                    OperationKind::RenameField { to, .. } => {
                        supplied.insert(to);
                    }
                    OperationKind::TransformData { .. } | OperationKind::Custom { .. } => {
                        opaque = true;
                    }
                    _ => {}
                }
            }

            let required: Vec<&str> = collection
                .required_fields_at(&target.version)
                .map(|f| f.name.as_str())
                .filter(|name| !supplied.contains(name))
                .collect();
            if required.is_empty() {
                continue;
            }

            let page = ctx
                .store
                .query(&Query::collection(&collection.name).limit(self.sample_size.max(1)))
                .await?;
            let mut missing: BTreeMap<&str, usize> = BTreeMap::new();
            for doc in &page.documents {
                for field in &required {
                    if !doc.data.contains_key(*field) {
                        *missing.entry(*field).or_default() += 1;
                    }
                }
            }

            let severity = if opaque {
                IssueSeverity::Medium
            } else {
                IssueSeverity::High
            };
            for (field, count) in missing {
                issues.push(
                    DryRunIssue::new(
                        severity,
                        self.name(),
                        format!(
                            "{} of {} sampled document(s) lack required field '{}'",
                            count,
                            page.documents.len(),
                            field
                        ),
                    )
                    .in_collection(&collection.name),
                );
            }
        }
        Ok(issues)
    }
}

/// Reviews the simulated run's failures and rejections
pub struct BusinessRuleHook;

#[async_trait]
impl ValidationHook for BusinessRuleHook {
    fn name(&self) -> &str {
        "business_rules"
    }

    fn phase(&self) -> HookPhase {
        HookPhase::Post
    }

    async fn check(&self, ctx: &DryRunContext<'_>) -> anyhow::Result<Vec<DryRunIssue>> {
        let Some(result) = ctx.result else {
            return Ok(Vec::new());
        };
        let mut issues = Vec::new();

        for op in result.operations.iter().filter(|op| !op.completed) {
            issues.push(
                DryRunIssue::new(
                    IssueSeverity::Critical,
                    self.name(),
                    format!("operation '{}' would fail", op.operation_id),
                )
                .in_collection(&op.collection),
            );
        }
        if result.stats.documents_failed > 0 {
            issues.push(DryRunIssue::new(
                IssueSeverity::High,
                self.name(),
                format!(
                    "{} document(s) would fail ({:.1}% error rate)",
                    result.stats.documents_failed,
                    result.stats.error_rate() * 100.0
                ),
            ));
        }
        for warning in &result.warnings {
            issues.push(DryRunIssue::new(
                IssueSeverity::Medium,
                self.name(),
                warning.clone(),
            ));
        }
        if result.success && result.stats.documents_updated == 0 {
            issues.push(DryRunIssue::new(
                IssueSeverity::Low,
                self.name(),
                "no documents would change",
            ));
        }
        Ok(issues)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    /// True when nothing high or critical was found and the run succeeded
    pub can_proceed: bool,
    pub estimated_time_minutes: u32,
    pub breaking_changes: bool,
    pub affected_documents: u64,
    /// Most severe first
    pub issues: Vec<DryRunIssue>,
    pub recommendations: Vec<String>,
    pub result: MigrationResult,
}

impl DryRunReport {
    pub fn highest_severity(&self) -> Option<IssueSeverity> {
        self.issues.first().map(|i| i.severity)
    }

    pub fn issues_at_least(&self, severity: IssueSeverity) -> usize {
        self.issues.iter().filter(|i| i.severity >= severity).count()
    }
}

pub struct DryRunEngine {
    engine: Arc<MigrationEngine>,
    hooks: Vec<Arc<dyn ValidationHook>>,
}

impl DryRunEngine {
    /// Engine without hooks
    pub fn new(engine: Arc<MigrationEngine>) -> Self {
        Self {
            engine,
            hooks: Vec::new(),
        }
    }

    /// Engine with the built-in schema, data-integrity and business-rule hooks
    pub fn with_default_hooks(engine: Arc<MigrationEngine>) -> Self {
        Self::new(engine)
            .with_hook(Arc::new(SchemaCompatibilityHook))
            .with_hook(Arc::new(DataIntegrityHook::default()))
            .with_hook(Arc::new(BusinessRuleHook))
    }

    pub fn with_hook(mut self, hook: Arc<dyn ValidationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Simulate the migration and collect ranked findings
    pub async fn run(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
        options: MigrationOptions,
    ) -> DryRunReport {
        info!("Dry run analysis {} -> {}", from, to);
        let mut issues = Vec::new();

        let plan = match self.engine.registry().plan_migration_path(from, to).await {
            Ok(plan) => Some(plan),
            Err(e) => {
                issues.push(DryRunIssue::new(
                    IssueSeverity::Critical,
                    "planning",
                    e.to_string(),
                ));
                None
            }
        };
        let operations = match &plan {
            Some(plan) => match self.engine.plan_operations(plan).await {
                Ok(ops) => ops,
                Err(e) => {
                    issues.push(DryRunIssue::new(
                        IssueSeverity::Critical,
                        "planning",
                        e.to_string(),
                    ));
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if let Some(plan) = &plan {
            let ctx = DryRunContext {
                plan,
                operations: &operations,
                store: self.engine.store().as_ref(),
                result: None,
            };
            issues.extend(self.run_hooks(HookPhase::Pre, &ctx).await);
        }

        let result = self.engine.execute_migration(from, to, options, true).await;
        if !result.success {
            for error in &result.errors {
                issues.push(DryRunIssue::new(
                    IssueSeverity::High,
                    "simulation",
                    error.clone(),
                ));
            }
        }

        if let Some(plan) = &plan {
            let ctx = DryRunContext {
                plan,
                operations: &operations,
                store: self.engine.store().as_ref(),
                result: Some(&result),
            };
            issues.extend(self.run_hooks(HookPhase::Post, &ctx).await);
        }

        // Stable sort keeps hook order within a severity
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));

        let estimated_time_minutes = plan.as_ref().map_or(0, |p| p.estimated_time_minutes);
        let breaking_changes = plan.as_ref().is_some_and(|p| p.breaking_changes);
        let affected_documents = result.stats.documents_updated;
        let blocking = issues
            .iter()
            .filter(|i| i.severity >= IssueSeverity::High)
            .count();

        let mut recommendations = Vec::new();
        if estimated_time_minutes > CHUNKING_THRESHOLD_MINUTES {
            recommendations.push(format!(
                "Estimated {} minutes: split the migration into smaller chunks",
                estimated_time_minutes
            ));
        }
        if breaking_changes {
            recommendations.push(
                "Breaking changes on the path: take a backup and schedule a maintenance window"
                    .to_string(),
            );
        }
        if affected_documents > BLUE_GREEN_THRESHOLD_DOCUMENTS {
            recommendations.push(format!(
                "{} documents affected: prefer a blue/green deployment",
                affected_documents
            ));
        }
        if blocking > 0 {
            recommendations.push(format!(
                "Resolve {} high or critical issue(s) before running for real",
                blocking
            ));
        }

        let report = DryRunReport {
            from,
            to,
            can_proceed: blocking == 0 && result.success,
            estimated_time_minutes,
            breaking_changes,
            affected_documents,
            issues,
            recommendations,
            result,
        };
        info!(
            "Dry run {} -> {}: {} issue(s), {} blocking, {} document(s) would change",
            from,
            to,
            report.issues.len(),
            blocking,
            affected_documents
        );
        report
    }

    async fn run_hooks(&self, phase: HookPhase, ctx: &DryRunContext<'_>) -> Vec<DryRunIssue> {
        let mut issues = Vec::new();
        for hook in self.hooks.iter().filter(|h| h.phase() == phase) {
            match hook.check(ctx).await {
                Ok(found) => {
                    debug!("Hook {} reported {} issue(s)", hook.name(), found.len());
                    issues.extend(found);
                }
                Err(e) => {
                    warn!("Validation hook {} failed: {:#}", hook.name(), e);
                    issues.push(DryRunIssue::new(
                        IssueSeverity::High,
                        hook.name(),
                        format!("hook failed: {:#}", e),
                    ));
                }
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::schema::{
        CollectionSchemaDefinition, FieldDefinition, FieldType, SchemaDefinition, VersionRegistry,
    };
    use crate::store::{MemoryStore, StoredDocument};
    use serde_json::json;

    fn v(s: &str) -> SchemaVersion {
        SchemaVersion::parse(s).unwrap()
    }

    fn plants_schema(version: &str, extra_required: &[&str]) -> SchemaDefinition {
        let mut fields = vec![FieldDefinition::new("name", FieldType::String).required()];
        for name in extra_required {
            fields.push(FieldDefinition::new(*name, FieldType::Number).required());
        }
        SchemaDefinition::new(
            "garden",
            v(version),
            vec![CollectionSchemaDefinition::new("plants", fields)],
        )
    }

    async fn setup(docs: usize) -> (Arc<MemoryStore>, Arc<MigrationEngine>) {
        let store = Arc::new(MemoryStore::new());
        let seeded = (0..docs)
            .map(|i| {
                let mut data = crate::store::Document::new();
                data.insert("name".into(), json!(format!("plant-{}", i)));
                StoredDocument::new(format!("p{:05}", i), data)
            })
            .collect();
        store.seed("plants", seeded).await;
        let events = EventBus::new();
        let registry = Arc::new(VersionRegistry::new(store.clone(), events.clone()));
        registry
            .register_schema(plants_schema("1.0.0", &[]))
            .await
            .unwrap();
        let engine = Arc::new(MigrationEngine::new(store.clone(), registry, events));
        (store, engine)
    }

    #[tokio::test]
    async fn test_clean_run_can_proceed() {
        let (store, engine) = setup(3).await;
        engine
            .registry()
            .register_schema(plants_schema("1.1.0", &["water"]))
            .await
            .unwrap();
        engine
            .register_operations(
                v("1.1.0"),
                vec![MigrationOperation::add_field("add-water", "plants", "water", json!(2))],
            )
            .await
            .unwrap();
        let before = store.snapshot("plants").await;

        let report = DryRunEngine::with_default_hooks(engine)
            .run(v("1.0.0"), v("1.1.0"), MigrationOptions::default())
            .await;

        assert!(report.can_proceed, "issues: {:?}", report.issues);
        assert_eq!(report.affected_documents, 3);
        assert!(report.result.dry_run);
        assert_eq!(store.snapshot("plants").await, before);
    }

    #[tokio::test]
    async fn test_unsupplied_required_field_blocks() {
        let (_store, engine) = setup(2).await;
        engine
            .registry()
            .register_schema(plants_schema("1.1.0", &["water"]))
            .await
            .unwrap();

        let report = DryRunEngine::with_default_hooks(engine)
            .run(v("1.0.0"), v("1.1.0"), MigrationOptions::default())
            .await;

        assert!(!report.can_proceed);
        assert_eq!(report.highest_severity(), Some(IssueSeverity::High));
        let integrity = report
            .issues
            .iter()
            .find(|i| i.source == "data_integrity")
            .unwrap();
        assert_eq!(integrity.collection.as_deref(), Some("plants"));
        assert!(integrity.message.contains("water"));
    }

    #[tokio::test]
    async fn test_recommendations_for_breaking_long_and_large_runs() {
        let (_store, engine) = setup(10_001).await;
        engine
            .registry()
            .register_schema(
                plants_schema("2.0.0", &["water"])
                    .breaking()
                    .with_estimated_minutes(90),
            )
            .await
            .unwrap();
        engine
            .register_operations(
                v("2.0.0"),
                vec![MigrationOperation::add_field("add-water", "plants", "water", json!(1))],
            )
            .await
            .unwrap();

        let report = DryRunEngine::with_default_hooks(engine)
            .run(
                v("1.0.0"),
                v("2.0.0"),
                MigrationOptions::default().with_batch_size(1_000),
            )
            .await;

        assert!(report.breaking_changes);
        assert_eq!(report.affected_documents, 10_001);
        let text = report.recommendations.join("\n");
        assert!(text.contains("chunks"));
        assert!(text.contains("maintenance window"));
        assert!(text.contains("blue/green"));
    }

    #[tokio::test]
    async fn test_failing_hook_becomes_issue() {
        struct Broken;

        #[async_trait]
        impl ValidationHook for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn phase(&self) -> HookPhase {
                HookPhase::Pre
            }
            async fn check(&self, _ctx: &DryRunContext<'_>) -> anyhow::Result<Vec<DryRunIssue>> {
                anyhow::bail!("lookup service down")
            }
        }

        let (_store, engine) = setup(1).await;
        engine
            .registry()
            .register_schema(plants_schema("1.1.0", &[]))
            .await
            .unwrap();
        let report = DryRunEngine::new(engine)
            .with_hook(Arc::new(Broken))
            .run(v("1.0.0"), v("1.1.0"), MigrationOptions::default())
            .await;

        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].source, "broken");
        assert!(!report.can_proceed);
    }
}
