//! Runtime configuration
//!
//! Settings come from a TOML file, then `SCHEMAFLOW_*` environment
//! variables override individual values.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::deploy::{
    BlueGreenParams, CanaryParams, DeploymentConfig, DeploymentStrategy, Environment,
    RollbackStrategy, RollingParams,
};
use crate::error::{ErrorCode, Result, SchemaFlowError};
use crate::migration::MigrationOptions;
use crate::safety::{BackupConfig, MonitoringConfig};
use crate::schema::SchemaVersion;
use crate::store::MemoryStoreConfig;

pub mod loader;

pub use loader::ConfigLoader;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaFlowConfig {
    pub log: LoggingConfig,
    pub store: MemoryStoreConfig,
    pub migration: MigrationOptions,
    pub backup: BackupConfig,
    pub monitoring: MonitoringConfig,
    pub deployment: DeploymentDefaults,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Explicit filter directive, e.g. `info` or `schemaflow=debug`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// 0 = info, 1 = debug, 2+ = trace
    pub verbose: u8,
}

impl LoggingConfig {
    pub fn log_level(&self) -> String {
        if let Some(level) = &self.level {
            return level.clone();
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
        .to_string()
    }
}

/// Strategy parameters applied to deployments built from this config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentDefaults {
    pub rolling: RollingParams,
    pub blue_green: BlueGreenParams,
    pub canary: CanaryParams,
    pub rollback: RollbackStrategy,
}

impl SchemaFlowConfig {
    /// Apply `SCHEMAFLOW_*` overrides from the process environment
    pub fn merge_env_vars(&mut self) {
        self.merge_env_from(|key| std::env::var(key).ok());
    }

    fn merge_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("SCHEMAFLOW_LOG_LEVEL") {
            self.log.level = Some(level);
        }

        if let Some(value) = lookup("SCHEMAFLOW_BATCH_SIZE") {
            match value.parse::<usize>() {
                Ok(batch_size) => self.migration.batch_size = batch_size,
                Err(_) => warn!("Ignoring SCHEMAFLOW_BATCH_SIZE={}", value),
            }
        }

        if let Some(value) = lookup("SCHEMAFLOW_CONCURRENCY") {
            match value.parse::<usize>() {
                Ok(concurrency) => self.migration.concurrency = concurrency,
                Err(_) => warn!("Ignoring SCHEMAFLOW_CONCURRENCY={}", value),
            }
        }

        if let Some(value) = lookup("SCHEMAFLOW_CONTINUE_ON_ERROR") {
            match value.parse::<bool>() {
                Ok(flag) => self.migration.continue_on_error = flag,
                Err(_) => warn!("Ignoring SCHEMAFLOW_CONTINUE_ON_ERROR={}", value),
            }
        }

        if let Some(value) = lookup("SCHEMAFLOW_WRITE_GROUP_LIMIT") {
            match value.parse::<usize>() {
                Ok(limit) => self.migration.write_group_limit = Some(limit),
                Err(_) => warn!("Ignoring SCHEMAFLOW_WRITE_GROUP_LIMIT={}", value),
            }
        }

        if let Some(value) = lookup("SCHEMAFLOW_BACKUP_RETENTION") {
            match humantime_serde::re::humantime::parse_duration(&value) {
                Ok(retention) => self.backup.retention = retention,
                Err(_) => warn!("Ignoring SCHEMAFLOW_BACKUP_RETENTION={}", value),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let migration = &self.migration;
        if migration.batch_size == 0 {
            return Err(invalid("migration.batch_size must be at least 1"));
        }
        if migration.concurrency == 0 {
            return Err(invalid("migration.concurrency must be at least 1"));
        }
        if migration.write_group_limit == Some(0) || self.store.max_write_group_size == 0 {
            return Err(invalid("write group limits must be at least 1"));
        }
        if migration.retry.attempts == 0 {
            return Err(invalid("migration.retry.attempts must be at least 1"));
        }
        if self.backup.page_size == 0 {
            return Err(invalid("backup.page_size must be at least 1"));
        }
        if self.monitoring.sample_interval == Duration::ZERO {
            return Err(invalid("monitoring.sample_interval must be positive"));
        }

        let thresholds = &self.monitoring.thresholds;
        for (name, value) in [
            ("monitoring.thresholds.error_rate", thresholds.error_rate),
            (
                "monitoring.thresholds.throughput_ratio",
                thresholds.throughput_ratio,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{} must be between 0 and 1, got {}", name, value)));
            }
        }
        if thresholds.memory_soft_mb > thresholds.memory_hard_mb {
            return Err(invalid(format!(
                "memory soft limit {} MiB is above the hard limit {} MiB",
                thresholds.memory_soft_mb, thresholds.memory_hard_mb
            )));
        }

        // Strategy parameters share DeploymentConfig's rules
        self.deployment_config(
            "config-check",
            Environment::Development,
            DeploymentStrategy::RollingUpdate,
            SchemaVersion::new(0, 0, 0),
            SchemaVersion::new(0, 0, 0),
        )
        .validate()
    }

    /// A deployment carrying this config's defaults
    pub fn deployment_config(
        &self,
        name: impl Into<String>,
        environment: Environment,
        strategy: DeploymentStrategy,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> DeploymentConfig {
        let defaults = &self.deployment;
        DeploymentConfig {
            migration: self.migration.clone(),
            rolling: defaults.rolling.clone(),
            blue_green: defaults.blue_green.clone(),
            canary: defaults.canary.clone(),
            rollback: defaults.rollback.clone(),
            backup: self.backup.clone(),
            ..DeploymentConfig::new(name, environment, strategy, from, to)
        }
    }
}

fn invalid(message: impl Into<String>) -> SchemaFlowError {
    SchemaFlowError::config_with_code(ErrorCode::CONFIG_INVALID_VALUE, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SchemaFlowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.migration.batch_size, 100);
        assert_eq!(config.migration.concurrency, 4);
        assert_eq!(config.store.max_write_group_size, 500);
        assert_eq!(config.log.log_level(), "info");
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("SCHEMAFLOW_LOG_LEVEL", "schemaflow=trace"),
            ("SCHEMAFLOW_BATCH_SIZE", "25"),
            ("SCHEMAFLOW_CONTINUE_ON_ERROR", "true"),
            ("SCHEMAFLOW_WRITE_GROUP_LIMIT", "50"),
            ("SCHEMAFLOW_BACKUP_RETENTION", "2days"),
        ]);
        let mut config = SchemaFlowConfig::default();
        config.merge_env_from(|key| vars.get(key).cloned());

        assert_eq!(config.log.log_level(), "schemaflow=trace");
        assert_eq!(config.migration.batch_size, 25);
        assert!(config.migration.continue_on_error);
        assert_eq!(config.migration.write_group_limit, Some(50));
        assert_eq!(config.backup.retention, Duration::from_secs(2 * 24 * 3600));
    }

    #[test]
    fn test_unparseable_env_values_are_ignored() {
        let vars = env(&[
            ("SCHEMAFLOW_CONCURRENCY", "lots"),
            ("SCHEMAFLOW_CONTINUE_ON_ERROR", "maybe"),
        ]);
        let mut config = SchemaFlowConfig::default();
        config.merge_env_from(|key| vars.get(key).cloned());
        assert_eq!(config.migration.concurrency, 4);
        assert!(!config.migration.continue_on_error);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = SchemaFlowConfig::default();
        config.migration.batch_size = 0;
        assert_eq!(
            config.validate().unwrap_err().code(),
            ErrorCode::CONFIG_INVALID_VALUE
        );

        let mut config = SchemaFlowConfig::default();
        config.migration.write_group_limit = Some(0);
        assert!(config.validate().is_err());

        let mut config = SchemaFlowConfig::default();
        config.monitoring.thresholds.error_rate = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deployment_config_inherits_defaults() {
        let mut config = SchemaFlowConfig::default();
        config.deployment.canary.traffic_percentage = 5.0;
        config.migration.batch_size = 42;
        let deployment = config.deployment_config(
            "nightly",
            Environment::Staging,
            DeploymentStrategy::Canary,
            SchemaVersion::new(1, 0, 0),
            SchemaVersion::new(1, 1, 0),
        );
        assert_eq!(deployment.canary.traffic_percentage, 5.0);
        assert_eq!(deployment.migration.batch_size, 42);
        assert!(deployment.rollback.automatic);
    }
}
