//! Version registry: the authoritative current version, the catalogue of
//! registered schemas, and the history of applied versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::definition::SchemaDefinition;
use super::plan::{plan_path, MigrationPlan};
use super::validation::{validate_schema, validate_upgrade, ValidationIssue, ValidationReport};
use super::version::SchemaVersion;
use crate::error::{ErrorCode, Result, SchemaFlowError};
use crate::events::{EventBus, EventKind, EventSource, Severity};
use crate::store::{
    collect_all, collections, from_document, to_document, DocumentStore, Precondition, Query,
    StorageResult, WriteGroup,
};

const CURRENT_POINTER_ID: &str = "current";
const MAX_CAS_ATTEMPTS: usize = 16;

/// Why a version application was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationKind {
    Migration,
    Rollback,
}

/// One entry of the version application history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionApplication {
    pub id: String,
    pub kind: ApplicationKind,
    pub from: Option<SchemaVersion>,
    pub to: SchemaVersion,
    pub migration_id: String,
    pub applied_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VersionApplication {
    pub fn migration(
        migration_id: impl Into<String>,
        from: SchemaVersion,
        to: SchemaVersion,
        stats: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: ApplicationKind::Migration,
            from: Some(from),
            to,
            migration_id: migration_id.into(),
            applied_at: Utc::now(),
            stats,
            reason: None,
        }
    }
}

/// Outcome of a successful registration
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutcome {
    pub version: SchemaVersion,
    /// Whether the current-version pointer moved
    pub advanced_current: bool,
    pub current: SchemaVersion,
    pub warnings: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CurrentPointer {
    version: SchemaVersion,
    updated_at: DateTime<Utc>,
}

/// Registry service bound to one document store
pub struct VersionRegistry {
    store: Arc<dyn DocumentStore>,
    events: EventBus,
}

impl VersionRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Current schema version, if one has ever been registered
    pub async fn get_current_version(&self) -> Result<Option<SchemaVersion>> {
        Ok(self.read_pointer().await?.map(|(version, _)| version))
    }

    /// Validate without registering anything
    pub fn validate_schema(&self, def: &SchemaDefinition) -> ValidationReport {
        validate_schema(def)
    }

    /// Validate and register a definition, advancing the current version
    /// only when the new version is strictly greater.
    pub async fn register_schema(&self, def: SchemaDefinition) -> Result<RegistrationOutcome> {
        let mut report = validate_schema(&def);
        let current = self.get_current_version().await?;
        report.merge(validate_upgrade(current.as_ref(), &def));
        let code = if report
            .errors
            .iter()
            .any(|issue| issue.path == "breaking")
        {
            ErrorCode::VALIDATION_BREAKING_FLAG
        } else {
            ErrorCode::VALIDATION_SCHEMA_STRUCTURE
        };
        let warnings = report.into_result(code)?;

        let version_key = def.version.to_string();
        if self
            .store
            .get(collections::SCHEMA_REGISTRY, &version_key)
            .await?
            .is_some()
        {
            return Err(SchemaFlowError::validation_with_issues(
                ErrorCode::VALIDATION_DUPLICATE_VERSION,
                format!("schema version {} is already registered", def.version),
                Vec::new(),
            ));
        }

        let group = WriteGroup::new()
            .require(Precondition::document_absent(
                collections::SCHEMA_REGISTRY,
                &version_key,
            ))
            .set(collections::SCHEMA_REGISTRY, &version_key, to_document(&def)?);
        self.store.commit(group).await.map_err(|e| {
            if e.is_conflict() {
                SchemaFlowError::validation_with_issues(
                    ErrorCode::VALIDATION_DUPLICATE_VERSION,
                    format!("schema version {} was registered concurrently", def.version),
                    Vec::new(),
                )
            } else {
                e.into()
            }
        })?;

        let (advanced, current) = self.advance_current(def.version).await?;
        info!(
            "Registered schema {} ({}); current version is {}",
            def.id, def.version, current
        );
        self.events.emit(
            Severity::Info,
            EventSource::Registry,
            EventKind::SchemaRegistered {
                version: def.version.to_string(),
                advanced_current: advanced,
            },
            format!("schema {} registered", def.version),
        );

        Ok(RegistrationOutcome {
            version: def.version,
            advanced_current: advanced,
            current,
            warnings,
        })
    }

    /// Look up a registered schema by version
    pub async fn get_schema(&self, version: &SchemaVersion) -> Result<Option<SchemaDefinition>> {
        match self
            .store
            .get(collections::SCHEMA_REGISTRY, &version.to_string())
            .await?
        {
            Some(doc) => Ok(Some(from_document(&doc.data)?)),
            None => Ok(None),
        }
    }

    /// Every registered schema, ascending by version
    pub async fn list_schemas(&self) -> Result<Vec<SchemaDefinition>> {
        let docs = collect_all(
            self.store.as_ref(),
            Query::collection(collections::SCHEMA_REGISTRY).limit(200),
        )
        .await?;
        let mut schemas = docs
            .iter()
            .map(|doc| from_document::<SchemaDefinition>(&doc.data))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        schemas.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(schemas)
    }

    /// Plan the ordered set of schemas between `from` (exclusive) and `to`
    pub async fn plan_migration_path(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> Result<MigrationPlan> {
        let registered = self.list_schemas().await?;
        let plan = plan_path(&registered, from, to);
        debug!(
            "Planned {} -> {}: {} step(s), valid={}, breaking={}",
            from,
            to,
            plan.path.len(),
            plan.is_valid,
            plan.breaking_changes
        );
        Ok(plan)
    }

    /// Append an entry to the application history
    pub async fn record_application(&self, application: VersionApplication) -> Result<()> {
        let group = WriteGroup::new().set(
            collections::SCHEMA_HISTORY,
            &application.id,
            to_document(&application)?,
        );
        self.store.commit(group).await?;
        debug!(
            "Recorded {:?} application of {} for {}",
            application.kind, application.to, application.migration_id
        );
        Ok(())
    }

    /// Application history, oldest first
    pub async fn history(&self) -> Result<Vec<VersionApplication>> {
        let docs = collect_all(
            self.store.as_ref(),
            Query::collection(collections::SCHEMA_HISTORY).limit(200),
        )
        .await?;
        let mut history = docs
            .iter()
            .map(|doc| from_document::<VersionApplication>(&doc.data))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        history.sort_by(|a, b| a.applied_at.cmp(&b.applied_at));
        Ok(history)
    }

    /// Point the current version back at `version` during a rollback and
    /// record why.
    pub async fn reassert_version(
        &self,
        version: SchemaVersion,
        migration_id: &str,
        reason: &str,
    ) -> Result<()> {
        let mut previous = None;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let pointer = self.read_pointer().await?;
            previous = pointer.as_ref().map(|(v, _)| *v);
            let expected = pointer.map(|(_, raw)| raw);
            match self.write_pointer(version, expected).await {
                Ok(()) => {
                    let entry = VersionApplication {
                        id: Uuid::new_v4().to_string(),
                        kind: ApplicationKind::Rollback,
                        from: previous,
                        to: version,
                        migration_id: migration_id.to_string(),
                        applied_at: Utc::now(),
                        stats: None,
                        reason: Some(reason.to_string()),
                    };
                    self.record_application(entry).await?;
                    warn!(
                        "Current schema version reasserted to {} (was {:?}): {}",
                        version, previous, reason
                    );
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchemaFlowError::storage_with_code(
            ErrorCode::STORAGE_CONFLICT,
            format!(
                "could not reassert version {} (last seen {:?}) after {} attempts",
                version, previous, MAX_CAS_ATTEMPTS
            ),
            true,
        ))
    }

    /// Compare-and-set the pointer forward. Returns whether it moved and the
    /// version it now holds.
    async fn advance_current(&self, candidate: SchemaVersion) -> Result<(bool, SchemaVersion)> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let pointer = self.read_pointer().await?;
            if let Some((current, _)) = &pointer {
                if candidate <= *current {
                    return Ok((false, *current));
                }
            }
            let expected = pointer.map(|(_, raw)| raw);
            match self.write_pointer(candidate, expected).await {
                Ok(()) => return Ok((true, candidate)),
                Err(e) if e.is_conflict() => {
                    debug!("Version pointer changed underneath us (attempt {})", attempt);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchemaFlowError::storage_with_code(
            ErrorCode::STORAGE_CONFLICT,
            format!(
                "could not advance current version to {} after {} attempts",
                candidate, MAX_CAS_ATTEMPTS
            ),
            true,
        ))
    }

    async fn read_pointer(&self) -> Result<Option<(SchemaVersion, Value)>> {
        let Some(doc) = self
            .store
            .get(collections::SCHEMA_META, CURRENT_POINTER_ID)
            .await?
        else {
            return Ok(None);
        };
        let pointer: CurrentPointer = from_document(&doc.data)?;
        let raw = doc.data.get("version").cloned().unwrap_or(Value::Null);
        Ok(Some((pointer.version, raw)))
    }

    async fn write_pointer(
        &self,
        version: SchemaVersion,
        expected: Option<Value>,
    ) -> StorageResult<()> {
        let pointer = CurrentPointer {
            version,
            updated_at: Utc::now(),
        };
        let data = to_document(&pointer)?;
        let group = WriteGroup::new()
            .require(Precondition::field_equals(
                collections::SCHEMA_META,
                CURRENT_POINTER_ID,
                "version",
                expected,
            ))
            .set(collections::SCHEMA_META, CURRENT_POINTER_ID, data);
        self.store.commit(group).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::definition::{
        CollectionSchemaDefinition, FieldDefinition, FieldType, SchemaStatus,
    };
    use crate::store::MemoryStore;

    fn registry() -> VersionRegistry {
        VersionRegistry::new(Arc::new(MemoryStore::new()), EventBus::new())
    }

    fn schema(version: &str) -> SchemaDefinition {
        SchemaDefinition::new(
            "app",
            SchemaVersion::parse(version).unwrap(),
            vec![CollectionSchemaDefinition::new(
                "items",
                vec![FieldDefinition::new("name", FieldType::String)],
            )],
        )
        .with_status(SchemaStatus::Active)
    }

    #[tokio::test]
    async fn test_registration_advances_current() -> Result<()> {
        let registry = registry();
        assert_eq!(registry.get_current_version().await?, None);

        let outcome = registry.register_schema(schema("1.0.0")).await?;
        assert!(outcome.advanced_current);
        assert_eq!(
            registry.get_current_version().await?,
            Some(SchemaVersion::new(1, 0, 0))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_older_registration_does_not_regress() -> Result<()> {
        let registry = registry();
        registry.register_schema(schema("1.4.0")).await?;
        let outcome = registry.register_schema(schema("1.2.0")).await?;

        assert!(!outcome.advanced_current);
        assert_eq!(outcome.current, SchemaVersion::new(1, 4, 0));
        assert_eq!(registry.list_schemas().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() -> Result<()> {
        let registry = registry();
        registry.register_schema(schema("1.0.0")).await?;
        let err = registry.register_schema(schema("1.0.0")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::VALIDATION_DUPLICATE_VERSION);
        Ok(())
    }

    #[tokio::test]
    async fn test_major_bump_without_breaking_flag_rejected() -> Result<()> {
        let registry = registry();
        registry.register_schema(schema("1.0.0")).await?;
        let err = registry.register_schema(schema("2.0.0")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::VALIDATION_BREAKING_FLAG);

        registry.register_schema(schema("2.0.0").breaking()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_schema_not_registered() {
        let registry = registry();
        let mut bad = schema("1.0.0");
        bad.collections.clear();
        assert!(registry.register_schema(bad).await.is_err());
        assert!(registry.list_schemas().await.unwrap().is_empty());
        assert_eq!(registry.get_current_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reassert_version_records_history() -> Result<()> {
        let registry = registry();
        registry.register_schema(schema("1.0.0")).await?;
        registry.register_schema(schema("1.1.0")).await?;

        registry
            .reassert_version(SchemaVersion::new(1, 0, 0), "mig-1", "rollback")
            .await?;

        assert_eq!(
            registry.get_current_version().await?,
            Some(SchemaVersion::new(1, 0, 0))
        );
        let history = registry.history().await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, ApplicationKind::Rollback);
        assert_eq!(history[0].from, Some(SchemaVersion::new(1, 1, 0)));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_registrations_keep_highest() -> Result<()> {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for minor in 0..8u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .register_schema(schema(&format!("1.{}.0", minor)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("task panicked")?;
        }
        assert_eq!(
            registry.get_current_version().await?,
            Some(SchemaVersion::new(1, 7, 0))
        );
        Ok(())
    }
}
