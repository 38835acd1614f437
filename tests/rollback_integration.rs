//! Backups taken before a migration restore the exact earlier state

mod common;

use common::*;
use schemaflow::error::ErrorCode;
use schemaflow::migration::MigrationOptions;
use schemaflow::safety::{MonitorStatus, RestoreOptions, RollbackStatus};
use schemaflow::schema::ApplicationKind;
use schemaflow::store::{collections, DocumentStore, StoredDocument, WriteGroup};
use serde_json::json;
use std::time::Duration;

async fn backup_plants(garden: &Garden) -> String {
    garden
        .flow
        .backups()
        .create_backup("manual", &[PLANTS.to_string()], &garden.flow.config().backup)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_rollback_restores_state_at_backup_time() {
    let garden = Garden::new().await;
    let before = garden.plants().await;
    let backup_id = backup_plants(&garden).await;

    let migration = garden.flow.migrate(v("1.0.0"), v("1.1.0"), false).await;
    assert!(migration.success);
    garden
        .store
        .seed(PLANTS, vec![plant("p4", "basil")])
        .await;
    assert_ne!(garden.plants().await, before);

    let result = garden
        .flow
        .rollbacks()
        .rollback(&migration.migration_id, v("1.0.0"), &backup_id, "bad data")
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(garden.plants().await, before);
    assert_eq!(
        garden.flow.registry().get_current_version().await.unwrap(),
        Some(v("1.0.0"))
    );

    let monitor = garden
        .flow
        .monitoring()
        .get_monitor(&migration.migration_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(monitor.status, MonitorStatus::RolledBack);

    let plan = garden
        .flow
        .rollbacks()
        .get_rollback(&result.rollback_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plan.status, RollbackStatus::Completed);
    assert!(garden
        .flow
        .backups()
        .get_backup(&backup_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_rollback_stops_a_running_migration() {
    let garden = Garden::new().await;
    garden
        .flow
        .registry()
        .register_schema(garden_at("1.2.0"))
        .await
        .unwrap();
    garden
        .flow
        .engine()
        .register_operations(
            v("1.2.0"),
            vec![slow_flag("flag-migrated", "migrated", Duration::from_millis(30))],
        )
        .await
        .unwrap();
    let before = garden.plants().await;
    let backup_id = backup_plants(&garden).await;
    let mut events = garden.flow.events().subscribe();

    let run = garden.flow.engine().execute_migration(
        v("1.0.0"),
        v("1.2.0"),
        MigrationOptions::default().with_batch_size(1),
        false,
    );
    let rollback = async {
        let id = next_migration_id(&mut events).await;
        progress_of(&mut events, &id, 1).await;
        garden
            .flow
            .rollbacks()
            .rollback(&id, v("1.0.0"), &backup_id, "flags written in error")
            .await
            .unwrap()
    };
    let (migration, rollback) = tokio::join!(run, rollback);

    assert!(rollback.success, "errors: {:?}", rollback.errors);
    assert!(!migration.success);
    assert!(migration.stats.documents_updated < 6);
    assert!(migration
        .errors
        .iter()
        .any(|e| e.contains("RolledBack")), "errors: {:?}", migration.errors);
    assert_eq!(garden.plants().await, before);

    let monitor = garden
        .flow
        .monitoring()
        .get_monitor(&migration.migration_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(monitor.status, MonitorStatus::RolledBack);
    let history = garden.flow.registry().history().await.unwrap();
    assert!(!history.iter().any(|application| {
        application.migration_id == migration.migration_id
            && application.kind == ApplicationKind::Migration
    }));
}

#[tokio::test]
async fn test_tampered_backup_halts_rollback() {
    let garden = Garden::new().await;
    let backup_id = backup_plants(&garden).await;
    let migration = garden.flow.migrate(v("1.0.0"), v("1.1.0"), false).await;
    assert!(migration.success);
    let migrated = garden.plants().await;

    let record = garden
        .store
        .get(collections::BACKUPS, &backup_id)
        .await
        .unwrap()
        .unwrap();
    let mut data = record.data;
    data.insert("document_count".into(), json!(99));
    garden
        .store
        .commit(WriteGroup::new().set(collections::BACKUPS, &backup_id, data))
        .await
        .unwrap();

    let result = garden
        .flow
        .rollbacks()
        .rollback(&migration.migration_id, v("1.0.0"), &backup_id, "bad data")
        .await
        .unwrap();

    assert!(!result.success);
    assert!(!result.errors.is_empty());
    assert_eq!(garden.plants().await, migrated);
    assert_eq!(
        garden.flow.registry().get_current_version().await.unwrap(),
        Some(v("1.1.0"))
    );
}

#[tokio::test]
async fn test_rollback_plan_needs_existing_backup() {
    let garden = Garden::new().await;
    let err = garden
        .flow
        .rollbacks()
        .create_rollback_plan("m1", v("1.0.0"), "backup-missing")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ROLLBACK_PLAN_INVALID);
}

#[tokio::test]
async fn test_restore_without_overwrite_keeps_live_documents() {
    let garden = Garden::new().await;
    let backup_id = backup_plants(&garden).await;
    garden
        .store
        .seed(
            PLANTS,
            vec![StoredDocument::new("p1", doc(json!({ "name": "tree fern" })))],
        )
        .await;

    let restore = garden
        .flow
        .backups()
        .restore_backup(&backup_id, &RestoreOptions::default())
        .await;

    assert!(restore.success, "errors: {:?}", restore.errors);
    assert_eq!(restore.documents_restored, 0);
    assert_eq!(restore.documents_skipped, 3);
    assert_eq!(
        garden.plants().await["p1"].get("name"),
        Some(&json!("tree fern"))
    );
}

#[tokio::test]
async fn test_backups_listed_newest_first_and_deletable() {
    let garden = Garden::new().await;
    let first = backup_plants(&garden).await;
    let second = backup_plants(&garden).await;

    let listed: Vec<String> = garden
        .flow
        .backups()
        .list_backups()
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&first) && listed.contains(&second));

    assert!(garden.flow.backups().delete_backup(&first).await.unwrap());
    assert!(!garden.flow.backups().delete_backup(&first).await.unwrap());
    assert!(garden
        .flow
        .backups()
        .get_backup(&first)
        .await
        .unwrap()
        .is_none());
}
