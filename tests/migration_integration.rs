//! End-to-end migration runs against the in-memory store

mod common;

use common::*;
use schemaflow::events::{EventBus, EventKind};
use schemaflow::migration::{MigrationEngine, MigrationOperation, MigrationOptions, RetryPolicy};
use schemaflow::schema::VersionRegistry;
use schemaflow::store::{Document, DocumentStore, MemoryStore, StoredDocument};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine without monitoring, so the only commits are the migration's own
async fn bare_engine(store: Arc<MemoryStore>) -> MigrationEngine {
    let dyn_store: Arc<dyn DocumentStore> = store;
    let events = EventBus::new();
    let registry = Arc::new(VersionRegistry::new(dyn_store.clone(), events.clone()));
    registry.register_schema(garden_v1()).await.unwrap();
    registry.register_schema(garden_v1_1()).await.unwrap();
    let engine = MigrationEngine::new(dyn_store, registry, events);
    engine
        .register_operations(v("1.1.0"), vec![add_degradation_rate()])
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn test_add_field_then_rerun_skips_everything() {
    let garden = Garden::new().await;

    let first = garden.flow.migrate(v("1.0.0"), v("1.1.0"), false).await;
    assert!(first.success, "errors: {:?}", first.errors);
    assert_eq!(first.stats.documents_updated, 3);
    for (id, plant) in garden.plants().await {
        assert_eq!(plant.get("degradationRate"), Some(&json!(0.5)), "{id}");
    }

    let second = garden.flow.migrate(v("1.0.0"), v("1.1.0"), false).await;
    assert!(second.success);
    assert_eq!(second.stats.documents_updated, 0);
    assert_eq!(second.stats.documents_skipped, 3);
}

#[tokio::test]
async fn test_rename_and_remove_are_idempotent() {
    let garden = Garden::new().await;
    let engine = garden.flow.engine();
    garden
        .flow
        .registry()
        .register_schema(garden_at("1.2.0"))
        .await
        .unwrap();
    engine
        .register_operations(
            v("1.2.0"),
            vec![
                MigrationOperation::rename_field("rename-height", PLANTS, "height", "heightCm"),
                MigrationOperation::remove_field("drop-rate", PLANTS, "degradationRate")
                    .depends_on("rename-height"),
            ],
        )
        .await
        .unwrap();

    let once = garden.flow.migrate(v("1.0.0"), v("1.2.0"), false).await;
    assert!(once.success, "errors: {:?}", once.errors);
    let after_once = garden.plants().await;

    let twice = garden.flow.migrate(v("1.1.0"), v("1.2.0"), false).await;
    assert!(twice.success);
    assert_eq!(twice.stats.documents_updated, 0);
    assert_eq!(garden.plants().await, after_once);

    let fern = &after_once["p1"];
    assert_eq!(fern.get("heightCm"), Some(&json!(10)));
    assert!(fern.get("height").is_none());
    assert!(fern.get("degradationRate").is_none());
}

#[tokio::test]
async fn test_dry_run_leaves_documents_untouched() {
    let garden = Garden::new().await;
    let before = garden.plants().await;
    let commits_before = garden.store.commit_sizes().await.len();

    let result = garden.flow.migrate(v("1.0.0"), v("1.1.0"), true).await;

    assert!(result.success);
    assert!(result.dry_run);
    assert_eq!(result.stats.documents_updated, 3);
    assert!(result.stats.mutations > 0);
    assert_eq!(garden.plants().await, before);
    assert_eq!(garden.store.commit_sizes().await.len(), commits_before);
}

#[tokio::test]
async fn test_write_groups_never_exceed_store_cap() {
    let store = MemoryStore::with_write_group_limit(2);
    let many: Vec<StoredDocument> = (0..25)
        .map(|i| plant(&format!("x{i:02}"), "clover"))
        .collect();
    store.seed(PLANTS, many).await;
    let garden = Garden::with_store(store, Default::default()).await;

    let result = garden
        .flow
        .engine()
        .execute_migration(
            v("1.0.0"),
            v("1.1.0"),
            MigrationOptions::default().with_batch_size(10),
            false,
        )
        .await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.stats.documents_updated, 28);
    assert!(result.stats.largest_write_group <= 2);
    assert!(garden.store.commit_sizes().await.iter().all(|size| *size <= 2));
}

#[tokio::test]
async fn test_transient_commit_failure_is_retried() {
    let store = Arc::new(MemoryStore::new());
    seed_plants(&store).await;
    let engine = bare_engine(store.clone()).await;

    store.fail_next_commits(1);
    let options =
        MigrationOptions::default().with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)));
    let result = engine
        .execute_migration(v("1.0.0"), v("1.1.0"), options, false)
        .await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert!(result.stats.retries >= 1);
    assert_eq!(store.snapshot(PLANTS).await.len(), 3);
    assert!(store
        .snapshot(PLANTS)
        .await
        .values()
        .all(|plant| plant.contains_key("degradationRate")));
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_run() {
    let store = Arc::new(MemoryStore::new());
    seed_plants(&store).await;
    let engine = bare_engine(store.clone()).await;

    store.fail_next_commits(10);
    let options =
        MigrationOptions::default().with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)));
    let result = engine
        .execute_migration(v("1.0.0"), v("1.1.0"), options, false)
        .await;

    assert!(!result.success);
    assert!(!result.errors.is_empty());
    assert!(store
        .snapshot(PLANTS)
        .await
        .values()
        .all(|plant| !plant.contains_key("degradationRate")));
}

#[tokio::test]
async fn test_continue_on_error_records_failed_documents() {
    let garden = Garden::new().await;
    garden
        .flow
        .registry()
        .register_schema(garden_at("1.2.0"))
        .await
        .unwrap();
    let transform = MigrationOperation::transform(
        "shout-names",
        PLANTS,
        Arc::new(|plant: &StoredDocument| -> anyhow::Result<Option<Document>> {
            let name = plant
                .data
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default();
            if name == "moss" {
                anyhow::bail!("moss cannot be shouted");
            }
            let mut data = plant.data.clone();
            data.insert("name".into(), json!(name.to_uppercase()));
            Ok(Some(data))
        }),
    );
    garden
        .flow
        .engine()
        .register_operations(v("1.2.0"), vec![transform])
        .await
        .unwrap();

    let options = MigrationOptions::default()
        .continue_on_error()
        .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)));
    let result = garden
        .flow
        .engine()
        .execute_migration(v("1.1.0"), v("1.2.0"), options, false)
        .await;

    assert!(result.success);
    assert_eq!(result.stats.documents_failed, 1);
    assert_eq!(result.stats.documents_updated, 2);
    assert!(result.errors.iter().any(|e| e.contains("p2")));
    let plants = garden.plants().await;
    assert_eq!(plants["p1"].get("name"), Some(&json!("FERN")));
    assert_eq!(plants["p2"].get("name"), Some(&json!("moss")));
}

#[tokio::test]
async fn test_progress_is_published_on_the_bus() {
    let garden = Garden::new().await;
    let mut events = garden.flow.events().subscribe();

    let result = garden.flow.migrate(v("1.0.0"), v("1.1.0"), false).await;
    assert!(result.success);

    let mut saw_progress = false;
    let mut saw_completion = false;
    while let Ok(event) = events.try_recv() {
        match event.kind {
            EventKind::MigrationProgress { .. } => saw_progress = true,
            EventKind::MigrationCompleted { success, .. } => saw_completion = success,
            _ => {}
        }
    }
    assert!(saw_progress);
    assert!(saw_completion);
}

#[tokio::test]
async fn test_backwards_path_is_rejected_before_any_write() {
    let garden = Garden::new().await;
    let before = garden.plants().await;

    let result = garden.flow.migrate(v("1.1.0"), v("1.0.0"), false).await;

    assert!(!result.success);
    assert!(result.errors[0].contains("E1008"));
    assert_eq!(garden.plants().await, before);
}

#[tokio::test]
async fn test_dependency_on_applied_version_resolves_from_intermediate() {
    let garden = Garden::new().await;
    let engine = garden.flow.engine();
    garden
        .flow
        .registry()
        .register_schema(garden_at("1.2.0"))
        .await
        .unwrap();
    engine
        .register_operations(
            v("1.2.0"),
            vec![
                MigrationOperation::add_field("add-color", PLANTS, "color", json!("green"))
                    .depends_on("add-degradation-rate"),
            ],
        )
        .await
        .unwrap();

    let first = garden.flow.migrate(v("1.0.0"), v("1.1.0"), false).await;
    assert!(first.success, "errors: {:?}", first.errors);

    let second = garden.flow.migrate(v("1.1.0"), v("1.2.0"), false).await;
    assert!(second.success, "errors: {:?}", second.errors);
    assert_eq!(second.operations.len(), 1);
    assert_eq!(second.operations[0].operation_id, "add-color");
    assert!(garden
        .plants()
        .await
        .values()
        .all(|plant| plant.get("color") == Some(&json!("green"))));
}

#[tokio::test]
async fn test_pause_holds_the_run_until_resumed() {
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
            vec![slow_flag("flag-migrated", "migrated", Duration::from_millis(20))],
        )
        .await
        .unwrap();
    let monitoring = garden.flow.monitoring();
    let mut events = garden.flow.events().subscribe();

    let run = garden.flow.engine().execute_migration(
        v("1.0.0"),
        v("1.2.0"),
        MigrationOptions::default().with_batch_size(1),
        false,
    );
    let control = async {
        let id = next_migration_id(&mut events).await;
        progress_of(&mut events, &id, 1).await;
        monitoring.pause_migration(&id).await.unwrap();
        monitoring.wait_until_parked(&id).await;

        let held = garden.plants().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(garden.plants().await, held, "documents changed while paused");

        let checkpoint = monitoring.resume_migration(&id).await.unwrap();
        assert_eq!(checkpoint.operation_index, 1);
        held
    };
    let (result, held) = tokio::join!(run, control);

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.stats.documents_updated, 6);
    let flagged_while_paused = held
        .values()
        .filter(|plant| plant.contains_key("migrated"))
        .count();
    assert!((1..3).contains(&flagged_while_paused));
    assert!(garden
        .plants()
        .await
        .values()
        .all(|plant| plant.get("migrated") == Some(&json!(true))));
}

#[tokio::test]
async fn test_resume_from_checkpoint_skips_completed_operations() {
    let garden = Garden::new().await;
    garden
        .flow
        .registry()
        .register_schema(garden_at("1.2.0"))
        .await
        .unwrap();
    let enabled = Arc::new(AtomicBool::new(false));
    let switch = enabled.clone();
    let flag = MigrationOperation::transform(
        "flag-migrated",
        PLANTS,
        Arc::new(move |plant: &StoredDocument| -> anyhow::Result<Option<Document>> {
            if !switch.load(Ordering::SeqCst) {
                anyhow::bail!("flagging is switched off");
            }
            let mut data = plant.data.clone();
            data.insert("migrated".into(), json!(true));
            Ok(Some(data))
        }),
    );
    let engine = garden.flow.engine();
    engine
        .register_operations(v("1.2.0"), vec![flag])
        .await
        .unwrap();

    let options = MigrationOptions::default().with_retry(RetryPolicy::none());
    let failed = engine
        .execute_migration(v("1.0.0"), v("1.2.0"), options.clone(), false)
        .await;
    assert!(!failed.success);
    let checkpoint = garden
        .flow
        .monitoring()
        .get_monitor(&failed.migration_id)
        .await
        .unwrap()
        .unwrap()
        .resume_point()
        .cloned()
        .unwrap();
    assert_eq!(checkpoint.operation_index, 1);

    // Undo the first operation on one plant; a resumed run must leave it be
    garden.store.seed(PLANTS, vec![plant("p1", "fern")]).await;
    enabled.store(true, Ordering::SeqCst);

    let resumed = engine
        .execute_migration(v("1.0.0"), v("1.2.0"), options.resume_from(checkpoint), false)
        .await;

    assert!(resumed.success, "errors: {:?}", resumed.errors);
    assert_eq!(resumed.operations.len(), 1);
    assert_eq!(resumed.operations[0].operation_id, "flag-migrated");
    let plants = garden.plants().await;
    assert!(plants["p1"].get("degradationRate").is_none());
    assert_eq!(plants["p2"].get("degradationRate"), Some(&json!(0.5)));
    assert!(plants
        .values()
        .all(|plant| plant.get("migrated") == Some(&json!(true))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_migration_runs_as_a_spawned_task() {
    let garden = Garden::new().await;
    let engine = Arc::clone(garden.flow.engine());

    let task = tokio::spawn(async move {
        engine
            .execute_migration(v("1.0.0"), v("1.1.0"), MigrationOptions::default(), false)
            .await
    });
    let result = task.await.expect("migration task panicked");

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.stats.documents_updated, 3);
    assert!(garden
        .plants()
        .await
        .values()
        .all(|plant| plant.get("degradationRate") == Some(&json!(0.5))));
}
