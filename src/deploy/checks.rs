//! Safety checks run before and after a deployment touches data

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::config::DeploymentConfig;
use crate::schema::VersionRegistry;
use crate::store::{collections, Document, DocumentStore, Query, WriteGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSeverity {
    /// Recorded, never blocks
    Warning,
    /// Aborts the deployment
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub severity: CheckSeverity,
    pub passed: bool,
    pub message: String,
    pub duration_ms: u64,
}

impl CheckOutcome {
    pub fn is_blocking(&self) -> bool {
        !self.passed && self.severity == CheckSeverity::Critical
    }
}

pub struct CheckContext<'a> {
    pub deployment_id: &'a str,
    pub config: &'a DeploymentConfig,
    pub store: &'a dyn DocumentStore,
    pub registry: &'a VersionRegistry,
}

/// A gate evaluated around a deployment. `Ok` carries a short summary,
/// `Err` means the check failed.
#[async_trait]
pub trait SafetyCheck: Send + Sync {
    fn name(&self) -> &str;

    fn severity(&self) -> CheckSeverity {
        CheckSeverity::Critical
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> anyhow::Result<String>;
}

/// Run `checks` in order and collect their outcomes
pub async fn run_checks(
    checks: &[std::sync::Arc<dyn SafetyCheck>],
    ctx: &CheckContext<'_>,
) -> Vec<CheckOutcome> {
    let mut outcomes = Vec::with_capacity(checks.len());
    for check in checks {
        let started = Instant::now();
        let result = check.run(ctx).await;
        let outcome = CheckOutcome {
            name: check.name().to_string(),
            severity: check.severity(),
            passed: result.is_ok(),
            message: match result {
                Ok(summary) => summary,
                Err(e) => format!("{:#}", e),
            },
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if outcome.passed {
            debug!("Check {} passed: {}", outcome.name, outcome.message);
        } else {
            warn!(
                "Check {} failed ({:?}): {}",
                outcome.name, outcome.severity, outcome.message
            );
        }
        outcomes.push(outcome);
    }
    outcomes
}

/// Backend health plus a write, read and delete round trip
pub struct StoreConnectivityCheck;

#[async_trait]
impl SafetyCheck for StoreConnectivityCheck {
    fn name(&self) -> &str {
        "store_connectivity"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> anyhow::Result<String> {
        let health = ctx.store.health_check().await?;
        if !health.healthy {
            bail!(
                "{} backend unhealthy: {}",
                health.backend_type,
                health.errors.join("; ")
            );
        }

        let probe_id = format!("probe-{}", ctx.deployment_id);
        let mut probe = Document::new();
        probe.insert("deployment_id".into(), json!(ctx.deployment_id));
        probe.insert("written_at".into(), json!(Utc::now().to_rfc3339()));
        ctx.store
            .commit(WriteGroup::new().set(collections::DEPLOYMENT_PROBES, &probe_id, probe.clone()))
            .await
            .context("probe write failed")?;
        let read = ctx
            .store
            .get(collections::DEPLOYMENT_PROBES, &probe_id)
            .await
            .context("probe read failed")?;
        ctx.store
            .commit(WriteGroup::new().delete(collections::DEPLOYMENT_PROBES, &probe_id))
            .await
            .context("probe cleanup failed")?;

        match read {
            Some(doc) if doc.data == probe => Ok(format!(
                "{} reachable in {}ms",
                health.backend_type, health.latency_ms
            )),
            Some(_) => Err(anyhow!("probe document read back with different content")),
            None => Err(anyhow!("probe document missing after write")),
        }
    }
}

/// The target schema is registered and structurally valid
pub struct SchemaValidationCheck;

#[async_trait]
impl SafetyCheck for SchemaValidationCheck {
    fn name(&self) -> &str {
        "schema_validation"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> anyhow::Result<String> {
        let target = ctx.config.to;
        let schema = ctx
            .registry
            .get_schema(&target)
            .await?
            .ok_or_else(|| anyhow!("schema {} is not registered", target))?;
        let report = ctx.registry.validate_schema(&schema);
        if !report.is_valid() {
            let errors: Vec<String> = report.errors.iter().map(|i| i.to_string()).collect();
            bail!("schema {} is invalid: {}", target, errors.join("; "));
        }
        Ok(format!(
            "schema {} valid with {} warning(s)",
            target,
            report.warnings.len()
        ))
    }
}

/// Times a small read against every collection of the target schema
pub struct PerformanceBaselineCheck {
    pub max_latency: Duration,
}

impl Default for PerformanceBaselineCheck {
    fn default() -> Self {
        Self {
            max_latency: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl SafetyCheck for PerformanceBaselineCheck {
    fn name(&self) -> &str {
        "performance_baseline"
    }

    fn severity(&self) -> CheckSeverity {
        CheckSeverity::Warning
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> anyhow::Result<String> {
        let Some(schema) = ctx.registry.get_schema(&ctx.config.to).await? else {
            return Ok("no target schema to measure".to_string());
        };
        let mut slowest = Duration::ZERO;
        for collection in &schema.collections {
            let started = Instant::now();
            ctx.store
                .query(&Query::collection(&collection.name).limit(10))
                .await?;
            slowest = slowest.max(started.elapsed());
        }
        if slowest > self.max_latency {
            bail!(
                "slowest read took {}ms, above the {}ms baseline",
                slowest.as_millis(),
                self.max_latency.as_millis()
            );
        }
        Ok(format!("slowest read {}ms", slowest.as_millis()))
    }
}

/// After the rollout, sampled documents carry every required field of the
/// target schema
pub struct DataIntegrityCheck {
    pub sample_size: usize,
}

impl Default for DataIntegrityCheck {
    fn default() -> Self {
        Self { sample_size: 50 }
    }
}

#[async_trait]
impl SafetyCheck for DataIntegrityCheck {
    fn name(&self) -> &str {
        "data_integrity"
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> anyhow::Result<String> {
        let target = ctx.config.to;
        let schema = ctx
            .registry
            .get_schema(&target)
            .await?
            .ok_or_else(|| anyhow!("schema {} is not registered", target))?;

        let mut sampled = 0;
        let mut problems = Vec::new();
        for collection in &schema.collections {
            let required: Vec<&str> = collection
                .required_fields_at(&target)
                .map(|f| f.name.as_str())
                .collect();
            let page = ctx
                .store
                .query(&Query::collection(&collection.name).limit(self.sample_size.max(1)))
                .await?;
            sampled += page.documents.len();
            for doc in &page.documents {
                for field in &required {
                    match doc.data.get(*field) {
                        None => problems.push(format!(
                            "{}/{} is missing '{}'",
                            collection.name, doc.id, field
                        )),
                        Some(value) => {
                            let declared = collection.field(field).map(|f| &f.field_type);
                            if let Some(field_type) = declared {
                                if !value.is_null() && !field_type.accepts(value) {
                                    problems.push(format!(
                                        "{}/{} has '{}' of the wrong type",
                                        collection.name, doc.id, field
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }
        if !problems.is_empty() {
            let shown: Vec<&String> = problems.iter().take(5).collect();
            bail!(
                "{} problem(s) in {} sampled document(s): {:?}",
                problems.len(),
                sampled,
                shown
            );
        }
        Ok(format!("{} sampled document(s) consistent", sampled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::config::{DeploymentStrategy, Environment};
    use crate::events::EventBus;
    use crate::schema::{
        CollectionSchemaDefinition, FieldDefinition, FieldType, SchemaDefinition, SchemaVersion,
    };
    use crate::store::{MemoryStore, StoredDocument};
    use std::sync::Arc;

    fn v(s: &str) -> SchemaVersion {
        SchemaVersion::parse(s).unwrap()
    }

    async fn setup() -> (Arc<MemoryStore>, VersionRegistry, DeploymentConfig) {
        let store = Arc::new(MemoryStore::new());
        let registry = VersionRegistry::new(store.clone(), EventBus::new());
        registry
            .register_schema(SchemaDefinition::new(
                "garden",
                v("1.0.0"),
                vec![CollectionSchemaDefinition::new(
                    "plants",
                    vec![FieldDefinition::new("name", FieldType::String).required()],
                )],
            ))
            .await
            .unwrap();
        let config = DeploymentConfig::new(
            "test",
            Environment::Staging,
            DeploymentStrategy::RollingUpdate,
            v("1.0.0"),
            v("1.0.0"),
        );
        (store, registry, config)
    }

    fn ctx<'a>(
        store: &'a MemoryStore,
        registry: &'a VersionRegistry,
        config: &'a DeploymentConfig,
    ) -> CheckContext<'a> {
        CheckContext {
            deployment_id: "d1",
            config,
            store,
            registry,
        }
    }

    #[tokio::test]
    async fn test_connectivity_probe_cleans_up() {
        let (store, registry, config) = setup().await;
        let summary = StoreConnectivityCheck
            .run(&ctx(&store, &registry, &config))
            .await
            .unwrap();
        assert!(summary.contains("reachable"));
        assert!(store.snapshot(collections::DEPLOYMENT_PROBES).await.is_empty());

        store.set_unavailable(true);
        assert!(StoreConnectivityCheck
            .run(&ctx(&store, &registry, &config))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_schema_validation_requires_registration() {
        let (store, registry, mut config) = setup().await;
        assert!(SchemaValidationCheck
            .run(&ctx(&store, &registry, &config))
            .await
            .is_ok());
        config.to = v("9.0.0");
        assert!(SchemaValidationCheck
            .run(&ctx(&store, &registry, &config))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_integrity_flags_missing_fields() {
        let (store, registry, config) = setup().await;
        let mut good = Document::new();
        good.insert("name".into(), json!("fern"));
        store
            .seed(
                "plants",
                vec![
                    StoredDocument::new("p1", good),
                    StoredDocument::new("p2", Document::new()),
                ],
            )
            .await;

        let err = DataIntegrityCheck::default()
            .run(&ctx(&store, &registry, &config))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("p2"));
    }

    #[tokio::test]
    async fn test_warning_checks_do_not_block() {
        struct AlwaysSlow;

        #[async_trait]
        impl SafetyCheck for AlwaysSlow {
            fn name(&self) -> &str {
                "slow"
            }
            fn severity(&self) -> CheckSeverity {
                CheckSeverity::Warning
            }
            async fn run(&self, _ctx: &CheckContext<'_>) -> anyhow::Result<String> {
                bail!("too slow")
            }
        }

        let (store, registry, config) = setup().await;
        let checks: Vec<Arc<dyn SafetyCheck>> = vec![Arc::new(AlwaysSlow)];
        let outcomes = run_checks(&checks, &ctx(&store, &registry, &config)).await;
        assert!(!outcomes[0].passed);
        assert!(!outcomes[0].is_blocking());
    }
}
