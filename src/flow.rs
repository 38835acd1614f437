//! Single entry point wiring every component around one store

use std::sync::Arc;

use crate::config::SchemaFlowConfig;
use crate::deploy::{
    DeploymentConfig, DeploymentOrchestrator, DeploymentResult, SimulatedTrafficController,
    TrafficController,
};
use crate::error::Result;
use crate::events::EventBus;
use crate::migration::{MigrationEngine, MigrationOperation, MigrationResult};
use crate::safety::{BackupManager, DryRunEngine, DryRunReport, MonitoringService, RollbackSystem};
use crate::schema::{RegistrationOutcome, SchemaDefinition, SchemaVersion, VersionRegistry};
use crate::store::{DocumentStore, MemoryStore};

pub struct SchemaFlow {
    config: SchemaFlowConfig,
    store: Arc<dyn DocumentStore>,
    events: EventBus,
    registry: Arc<VersionRegistry>,
    engine: Arc<MigrationEngine>,
    backups: Arc<BackupManager>,
    monitoring: Arc<MonitoringService>,
    rollbacks: Arc<RollbackSystem>,
    dry_run: DryRunEngine,
    deployments: DeploymentOrchestrator,
}

impl SchemaFlow {
    /// Components around `store`, with simulated traffic control
    pub fn new(store: Arc<dyn DocumentStore>, config: SchemaFlowConfig) -> Self {
        Self::with_traffic(store, config, Arc::new(SimulatedTrafficController::default()))
    }

    pub fn with_traffic(
        store: Arc<dyn DocumentStore>,
        config: SchemaFlowConfig,
        traffic: Arc<dyn TrafficController>,
    ) -> Self {
        let events = EventBus::new();
        let registry = Arc::new(VersionRegistry::new(store.clone(), events.clone()));
        let monitoring = Arc::new(MonitoringService::new(
            store.clone(),
            events.clone(),
            config.monitoring.clone(),
        ));
        let engine = Arc::new(
            MigrationEngine::new(store.clone(), registry.clone(), events.clone())
                .with_monitoring(monitoring.clone()),
        );
        let backups = Arc::new(BackupManager::new(store.clone(), events.clone()));
        let rollbacks = Arc::new(RollbackSystem::new(
            store.clone(),
            registry.clone(),
            backups.clone(),
            monitoring.clone(),
            events.clone(),
        ));
        let dry_run = DryRunEngine::with_default_hooks(engine.clone());
        let deployments = DeploymentOrchestrator::new(
            store.clone(),
            engine.clone(),
            backups.clone(),
            rollbacks.clone(),
            traffic,
            events.clone(),
        );

        Self {
            config,
            store,
            events,
            registry,
            engine,
            backups,
            monitoring,
            rollbacks,
            dry_run,
            deployments,
        }
    }

    /// Everything backed by a fresh `MemoryStore`
    pub fn in_memory(config: SchemaFlowConfig) -> Self {
        let store = Arc::new(MemoryStore::with_config(config.store.clone()));
        Self::new(store, config)
    }

    pub fn config(&self) -> &SchemaFlowConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<VersionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<MigrationEngine> {
        &self.engine
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub fn monitoring(&self) -> &Arc<MonitoringService> {
        &self.monitoring
    }

    pub fn rollbacks(&self) -> &Arc<RollbackSystem> {
        &self.rollbacks
    }

    pub fn dry_run_engine(&self) -> &DryRunEngine {
        &self.dry_run
    }

    pub fn deployments(&self) -> &DeploymentOrchestrator {
        &self.deployments
    }

    /// Register a schema together with the operations that reach it
    pub async fn register(
        &self,
        def: SchemaDefinition,
        ops: Vec<MigrationOperation>,
    ) -> Result<RegistrationOutcome> {
        let version = def.version;
        let outcome = self.registry.register_schema(def).await?;
        self.engine.register_operations(version, ops).await?;
        Ok(outcome)
    }

    /// Migrate with the configured options
    pub async fn migrate(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
        dry_run: bool,
    ) -> MigrationResult {
        self.engine
            .execute_migration(from, to, self.config.migration.clone(), dry_run)
            .await
    }

    pub async fn dry_run(&self, from: SchemaVersion, to: SchemaVersion) -> DryRunReport {
        self.dry_run
            .run(from, to, self.config.migration.clone())
            .await
    }

    pub async fn deploy(&self, config: DeploymentConfig) -> DeploymentResult {
        self.deployments.deploy(config).await
    }
}
