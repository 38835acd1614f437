//! Deployment configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{ErrorCode, Result, SchemaFlowError};
use crate::migration::MigrationOptions;
use crate::safety::BackupConfig;
use crate::schema::SchemaVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    RollingUpdate,
    BlueGreen,
    Canary,
    Immediate,
    Scheduled,
}

impl fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentStrategy::RollingUpdate => "rolling_update",
            DeploymentStrategy::BlueGreen => "blue_green",
            DeploymentStrategy::Canary => "canary",
            DeploymentStrategy::Immediate => "immediate",
            DeploymentStrategy::Scheduled => "scheduled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingParams {
    pub batch_size: usize,
    /// How long traffic is watched after the rollout
    #[serde(with = "humantime_serde")]
    pub monitor_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Minimum average success rate, in percent, while monitoring
    pub health_threshold: f64,
}

impl Default for RollingParams {
    fn default() -> Self {
        Self {
            batch_size: 100,
            monitor_duration: Duration::from_secs(60),
            sample_interval: Duration::from_secs(10),
            health_threshold: 95.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueGreenParams {
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub warmup_duration: Duration,
    /// Time allowed for the traffic switch to settle
    #[serde(with = "humantime_serde")]
    pub switch_duration: Duration,
}

impl Default for BlueGreenParams {
    fn default() -> Self {
        Self {
            batch_size: 500,
            warmup_duration: Duration::from_secs(30),
            switch_duration: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryParams {
    /// Share of traffic routed to the canary, in percent
    pub traffic_percentage: f64,
    /// Minimum average success rate, in percent
    pub success_threshold: f64,
    #[serde(with = "humantime_serde")]
    pub monitor_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
}

impl Default for CanaryParams {
    fn default() -> Self {
        Self {
            traffic_percentage: 10.0,
            success_threshold: 99.5,
            monitor_duration: Duration::from_secs(300),
            sample_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledParams {
    pub start_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackStrategy {
    /// Roll back from the deployment's backup when a phase fails
    pub automatic: bool,
}

impl Default for RollbackStrategy {
    fn default() -> Self {
        Self { automatic: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Caller-chosen id; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub environment: Environment,
    pub strategy: DeploymentStrategy,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    #[serde(default)]
    pub migration: MigrationOptions,
    #[serde(default)]
    pub rolling: RollingParams,
    #[serde(default)]
    pub blue_green: BlueGreenParams,
    #[serde(default)]
    pub canary: CanaryParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<ScheduledParams>,
    #[serde(default)]
    pub rollback: RollbackStrategy,
    #[serde(default)]
    pub backup: BackupConfig,
}

impl DeploymentConfig {
    pub fn new(
        name: impl Into<String>,
        environment: Environment,
        strategy: DeploymentStrategy,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            environment,
            strategy,
            from,
            to,
            migration: MigrationOptions::default(),
            rolling: RollingParams::default(),
            blue_green: BlueGreenParams::default(),
            canary: CanaryParams::default(),
            scheduled: None,
            rollback: RollbackStrategy::default(),
            backup: BackupConfig::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_canary(mut self, canary: CanaryParams) -> Self {
        self.canary = canary;
        self
    }

    pub fn with_rolling(mut self, rolling: RollingParams) -> Self {
        self.rolling = rolling;
        self
    }

    pub fn with_blue_green(mut self, blue_green: BlueGreenParams) -> Self {
        self.blue_green = blue_green;
        self
    }

    pub fn scheduled_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.scheduled = Some(ScheduledParams { start_at });
        self
    }

    pub fn manual_rollback(mut self) -> Self {
        self.rollback.automatic = false;
        self
    }

    /// Reject configurations no deployment could run with
    pub fn validate(&self) -> Result<()> {
        if self.strategy == DeploymentStrategy::Immediate
            && self.environment == Environment::Production
        {
            return Err(SchemaFlowError::deployment(
                ErrorCode::DEPLOYMENT_STRATEGY_REJECTED,
                "immediate deployments are not allowed in production",
                None,
            ));
        }
        if self.from > self.to {
            return Err(SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_INVALID_PATH,
                format!("cannot deploy backwards from {} to {}", self.from, self.to),
            ));
        }
        if self.strategy == DeploymentStrategy::Scheduled && self.scheduled.is_none() {
            return Err(SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                "scheduled deployments need a start time",
            ));
        }
        let canary = &self.canary;
        if !(canary.traffic_percentage > 0.0 && canary.traffic_percentage < 100.0) {
            return Err(SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!(
                    "canary traffic percentage must be between 0 and 100, got {}",
                    canary.traffic_percentage
                ),
            ));
        }
        for (name, value) in [
            ("canary success threshold", canary.success_threshold),
            ("rolling health threshold", self.rolling.health_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(SchemaFlowError::config_with_code(
                    ErrorCode::CONFIG_INVALID_VALUE,
                    format!("{} must be a percentage, got {}", name, value),
                ));
            }
        }
        if self.rolling.batch_size == 0 || self.blue_green.batch_size == 0 {
            return Err(SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                "deployment batch sizes must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> SchemaVersion {
        SchemaVersion::parse(s).unwrap()
    }

    #[test]
    fn test_immediate_rejected_in_production() {
        let config = DeploymentConfig::new(
            "hotfix",
            Environment::Production,
            DeploymentStrategy::Immediate,
            v("1.0.0"),
            v("1.1.0"),
        );
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::DEPLOYMENT_STRATEGY_REJECTED);

        let staging = DeploymentConfig {
            environment: Environment::Staging,
            ..config
        };
        assert!(staging.validate().is_ok());
    }

    #[test]
    fn test_scheduled_needs_start_time() {
        let config = DeploymentConfig::new(
            "nightly",
            Environment::Staging,
            DeploymentStrategy::Scheduled,
            v("1.0.0"),
            v("1.1.0"),
        );
        assert!(config.validate().is_err());
        assert!(config.scheduled_at(Utc::now()).validate().is_ok());
    }

    #[test]
    fn test_canary_bounds() {
        let config = DeploymentConfig::new(
            "canary",
            Environment::Production,
            DeploymentStrategy::Canary,
            v("1.0.0"),
            v("1.1.0"),
        );
        let full = config.clone().with_canary(CanaryParams {
            traffic_percentage: 100.0,
            ..CanaryParams::default()
        });
        assert!(full.validate().is_err());
        let odd = config.with_canary(CanaryParams {
            success_threshold: 120.0,
            ..CanaryParams::default()
        });
        assert!(odd.validate().is_err());
    }

    #[test]
    fn test_parses_from_yaml() {
        let yaml = r#"
name: nightly
environment: staging
strategy: canary
from: 1.0.0
to: 1.2.0
canary:
  traffic_percentage: 5.0
  success_threshold: 99.0
  monitor_duration: 2m
  sample_interval: 10s
"#;
        let config: DeploymentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.strategy, DeploymentStrategy::Canary);
        assert_eq!(config.canary.monitor_duration, Duration::from_secs(120));
        assert!(config.rollback.automatic);
        assert!(config.validate().is_ok());
    }
}
