//! Version registry behaviour across registration, planning and history

mod common;

use common::*;
use schemaflow::error::ErrorCode;
use schemaflow::events::EventBus;
use schemaflow::schema::{ApplicationKind, SchemaDefinition, SchemaStatus, VersionRegistry};
use schemaflow::store::{DocumentStore, MemoryStore};
use std::sync::Arc;

fn registry() -> VersionRegistry {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    VersionRegistry::new(store, EventBus::new())
}

#[tokio::test]
async fn test_breaking_intermediate_version_is_named_in_plan() {
    let registry = registry();
    registry.register_schema(garden_v1()).await.unwrap();
    registry
        .register_schema(garden_at("1.5.0").breaking())
        .await
        .unwrap();
    registry
        .register_schema(garden_at("2.0.0").breaking())
        .await
        .unwrap();

    let plan = registry
        .plan_migration_path(v("1.0.0"), v("2.0.0"))
        .await
        .unwrap();

    assert!(plan.is_valid);
    assert!(plan.breaking_changes);
    assert!(plan.warnings.iter().any(|w| w.contains("1.5.0")));
    assert_eq!(plan.versions(), vec![v("1.5.0"), v("2.0.0")]);
}

#[tokio::test]
async fn test_major_bump_requires_breaking_flag() {
    let registry = registry();
    registry.register_schema(garden_v1()).await.unwrap();

    let err = registry
        .register_schema(garden_at("2.0.0"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::VALIDATION_BREAKING_FLAG);
    assert_eq!(registry.get_current_version().await.unwrap(), Some(v("1.0.0")));
}

#[tokio::test]
async fn test_out_of_order_registration_keeps_highest_current() {
    let registry = registry();
    registry.register_schema(garden_at("1.3.0")).await.unwrap();
    let outcome = registry.register_schema(garden_at("1.1.0")).await.unwrap();

    assert!(!outcome.advanced_current);
    assert_eq!(outcome.current, v("1.3.0"));
    assert_eq!(registry.get_current_version().await.unwrap(), Some(v("1.3.0")));

    let listed: Vec<_> = registry
        .list_schemas()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.version)
        .collect();
    assert_eq!(listed, vec![v("1.1.0"), v("1.3.0")]);
}

#[tokio::test]
async fn test_duplicate_version_is_rejected() {
    let registry = registry();
    registry.register_schema(garden_v1()).await.unwrap();
    let err = registry.register_schema(garden_v1()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::VALIDATION_DUPLICATE_VERSION);
}

#[tokio::test]
async fn test_archived_schema_invalidates_plan() {
    let registry = registry();
    registry.register_schema(garden_v1()).await.unwrap();
    registry
        .register_schema(garden_at("1.1.0").with_status(SchemaStatus::Archived))
        .await
        .unwrap();

    let plan = registry
        .plan_migration_path(v("1.0.0"), v("1.1.0"))
        .await
        .unwrap();
    assert!(!plan.is_valid);
    assert!(plan.errors.iter().any(|e| e.contains("archived")));
}

#[tokio::test]
async fn test_yaml_definition_registers() {
    let yaml = r#"
id: garden@1.0.0
name: garden
version: 1.0.0
status: active
collections:
  - name: plants
    fields:
      - name: name
        type: string
        required: true
"#;
    let def = SchemaDefinition::from_yaml_str(yaml).unwrap();
    let registry = registry();
    let outcome = registry.register_schema(def).await.unwrap();
    assert!(outcome.advanced_current);
    assert!(registry.get_schema(&v("1.0.0")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_migration_and_rollback_are_recorded_in_history() {
    let garden = Garden::new().await;
    let result = garden.flow.migrate(v("1.0.0"), v("1.1.0"), false).await;
    assert!(result.success);

    garden
        .flow
        .registry()
        .reassert_version(v("1.0.0"), &result.migration_id, "smoke test")
        .await
        .unwrap();

    let history = garden.flow.registry().history().await.unwrap();
    assert!(history
        .iter()
        .any(|h| h.kind == ApplicationKind::Migration && h.to == v("1.1.0")));
    let rollback = history
        .iter()
        .find(|h| h.kind == ApplicationKind::Rollback)
        .unwrap();
    assert_eq!(rollback.to, v("1.0.0"));
    assert_eq!(rollback.reason.as_deref(), Some("smoke test"));
    assert_eq!(
        garden.flow.registry().get_current_version().await.unwrap(),
        Some(v("1.0.0"))
    );
}
