//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use schemaflow::config::SchemaFlowConfig;
use schemaflow::deploy::SimulatedTrafficController;
use schemaflow::events::{EventKind, StatusEvent};
use schemaflow::migration::{DocumentTransformer, MigrationOperation};
use schemaflow::schema::{
    CollectionSchemaDefinition, FieldDefinition, FieldType, SchemaDefinition, SchemaVersion,
};
use schemaflow::store::{Document, DocumentStore, MemoryStore, StoredDocument};
use schemaflow::SchemaFlow;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const PLANTS: &str = "plants";

pub fn v(s: &str) -> SchemaVersion {
    SchemaVersion::parse(s).unwrap()
}

/// Build a document from a JSON object literal
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn plant(id: &str, name: &str) -> StoredDocument {
    StoredDocument::new(id, doc(json!({ "name": name, "height": 10 })))
}

/// Three plants, none carrying `degradationRate`
pub async fn seed_plants(store: &MemoryStore) {
    store
        .seed(
            PLANTS,
            vec![
                plant("p1", "fern"),
                plant("p2", "moss"),
                plant("p3", "ivy"),
            ],
        )
        .await;
}

/// Configuration with every wait shortened for tests
pub fn fast_config() -> SchemaFlowConfig {
    let mut config = SchemaFlowConfig::default();
    config.monitoring.sample_interval = Duration::from_millis(20);
    config.migration.retry.initial_delay = Duration::from_millis(1);
    config.migration.retry.max_delay = Duration::from_millis(5);

    let deployment = &mut config.deployment;
    deployment.rolling.monitor_duration = Duration::from_millis(30);
    deployment.rolling.sample_interval = Duration::from_millis(10);
    deployment.blue_green.warmup_duration = Duration::ZERO;
    deployment.blue_green.switch_duration = Duration::ZERO;
    deployment.canary.monitor_duration = Duration::from_millis(30);
    deployment.canary.sample_interval = Duration::from_millis(10);
    config
}

pub fn garden_v1() -> SchemaDefinition {
    SchemaDefinition::new(
        "garden",
        v("1.0.0"),
        vec![CollectionSchemaDefinition::new(
            PLANTS,
            vec![
                FieldDefinition::new("name", FieldType::String).required(),
                FieldDefinition::new("height", FieldType::Number),
            ],
        )],
    )
}

pub fn garden_v1_1() -> SchemaDefinition {
    SchemaDefinition::new(
        "garden",
        v("1.1.0"),
        vec![CollectionSchemaDefinition::new(
            PLANTS,
            vec![
                FieldDefinition::new("name", FieldType::String).required(),
                FieldDefinition::new("height", FieldType::Number),
                FieldDefinition::new("degradationRate", FieldType::Number).required(),
            ],
        )],
    )
}

/// A later garden schema with the 1.1.0 collections
pub fn garden_at(version: &str) -> SchemaDefinition {
    SchemaDefinition::new("garden", v(version), garden_v1_1().collections)
}

pub fn add_degradation_rate() -> MigrationOperation {
    MigrationOperation::add_field("add-degradation-rate", PLANTS, "degradationRate", json!(0.5))
}

/// Sets a boolean flag on each plant, sleeping first so a run spans
/// several scheduler turns
pub struct SlowFlag {
    pub field: &'static str,
    pub delay: Duration,
}

#[async_trait]
impl DocumentTransformer for SlowFlag {
    async fn transform(&self, plant: &StoredDocument) -> anyhow::Result<Option<Document>> {
        if plant.data.contains_key(self.field) {
            return Ok(None);
        }
        tokio::time::sleep(self.delay).await;
        let mut data = plant.data.clone();
        data.insert(self.field.into(), json!(true));
        Ok(Some(data))
    }
}

pub fn slow_flag(id: &str, field: &'static str, delay: Duration) -> MigrationOperation {
    MigrationOperation::transform(id, PLANTS, Arc::new(SlowFlag { field, delay }))
}

/// Id of the next migration announced on the bus
pub async fn next_migration_id(events: &mut broadcast::Receiver<StatusEvent>) -> String {
    loop {
        let event = events.recv().await.expect("event bus closed");
        if let EventKind::MigrationStarted { migration_id, .. } = event.kind {
            return migration_id;
        }
    }
}

/// Wait for a progress event from operation `index` of `migration_id`
pub async fn progress_of(
    events: &mut broadcast::Receiver<StatusEvent>,
    migration_id: &str,
    index: usize,
) {
    loop {
        let event = events.recv().await.expect("event bus closed");
        if let EventKind::MigrationProgress {
            migration_id: id,
            operation_index,
            ..
        } = event.kind
        {
            if id == migration_id && operation_index == index {
                return;
            }
        }
    }
}

/// A garden store with plants seeded and schemas 1.0.0 and 1.1.0 registered
pub struct Garden {
    pub store: Arc<MemoryStore>,
    pub traffic: Arc<SimulatedTrafficController>,
    pub flow: SchemaFlow,
}

impl Garden {
    pub async fn new() -> Self {
        Self::with_store(MemoryStore::new(), SimulatedTrafficController::default()).await
    }

    pub async fn with_traffic(traffic: SimulatedTrafficController) -> Self {
        Self::with_store(MemoryStore::new(), traffic).await
    }

    pub async fn with_store(store: MemoryStore, traffic: SimulatedTrafficController) -> Self {
        let store = Arc::new(store);
        let traffic = Arc::new(traffic);
        seed_plants(&store).await;

        let dyn_store: Arc<dyn DocumentStore> = store.clone();
        let flow = SchemaFlow::with_traffic(dyn_store, fast_config(), traffic.clone());
        flow.register(garden_v1(), Vec::new()).await.unwrap();
        flow.register(garden_v1_1(), vec![add_degradation_rate()])
            .await
            .unwrap();

        Self {
            store,
            traffic,
            flow,
        }
    }

    pub async fn plants(&self) -> std::collections::BTreeMap<String, Document> {
        self.store.snapshot(PLANTS).await
    }
}
