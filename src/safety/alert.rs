//! Built-in alert rules for migration monitors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::events::Severity;

pub const RULE_LOW_THROUGHPUT: &str = "low_throughput";
pub const RULE_HIGH_ERROR_RATE: &str = "high_error_rate";
pub const RULE_STUCK: &str = "stuck";
pub const RULE_MEMORY_SOFT: &str = "memory_soft_limit";
pub const RULE_MEMORY_HARD: &str = "memory_hard_limit";

/// Live metrics of a running migration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationMetrics {
    pub documents_processed: u64,
    pub documents_failed: u64,
    pub documents_per_second: f64,
    /// Failed documents as a fraction of processed ones
    pub error_rate: f64,
    pub memory_mb: f64,
    pub operation_index: usize,
    pub total_operations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampled_at: Option<DateTime<Utc>>,
}

/// An alert raised against a monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorAlert {
    pub id: String,
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

impl MonitorAlert {
    pub fn new(rule: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule: rule.into(),
            severity,
            message: message.into(),
            triggered_at: Utc::now(),
            acknowledged: false,
        }
    }
}

/// Thresholds for the built-in rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Expected documents per second
    pub throughput_baseline: f64,
    /// Fraction of the baseline below which throughput is low
    pub throughput_ratio: f64,
    pub error_rate: f64,
    #[serde(with = "humantime_serde")]
    pub stuck_after: Duration,
    pub memory_soft_mb: f64,
    pub memory_hard_mb: f64,
    /// Minimum gap between two alerts of the same rule
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            throughput_baseline: 100.0,
            throughput_ratio: 0.5,
            error_rate: 0.05,
            stuck_after: Duration::from_secs(300),
            memory_soft_mb: 512.0,
            memory_hard_mb: 1024.0,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Evaluate every rule against a sample, ignoring cooldowns.
///
/// `last_progress` is the time of the latest checkpoint, or the start of
/// the run when there is none yet.
pub fn evaluate_rules(
    metrics: &MigrationMetrics,
    thresholds: &AlertThresholds,
    last_progress: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vec<MonitorAlert> {
    let mut alerts = Vec::new();

    let floor = thresholds.throughput_baseline * thresholds.throughput_ratio;
    if metrics.documents_processed > 0 && metrics.documents_per_second < floor {
        alerts.push(MonitorAlert::new(
            RULE_LOW_THROUGHPUT,
            Severity::Warning,
            format!(
                "throughput {:.1} docs/s is below {:.1} docs/s",
                metrics.documents_per_second, floor
            ),
        ));
    }

    if metrics.error_rate > thresholds.error_rate {
        alerts.push(MonitorAlert::new(
            RULE_HIGH_ERROR_RATE,
            Severity::Error,
            format!(
                "error rate {:.1}% exceeds {:.1}%",
                metrics.error_rate * 100.0,
                thresholds.error_rate * 100.0
            ),
        ));
    }

    let idle = (now - last_progress).to_std().unwrap_or_default();
    if idle >= thresholds.stuck_after {
        alerts.push(MonitorAlert::new(
            RULE_STUCK,
            Severity::Critical,
            format!("no checkpoint progress for {}s", idle.as_secs()),
        ));
    }

    if metrics.memory_mb > thresholds.memory_hard_mb {
        alerts.push(MonitorAlert::new(
            RULE_MEMORY_HARD,
            Severity::Critical,
            format!(
                "memory {:.0} MiB exceeds hard limit {:.0} MiB",
                metrics.memory_mb, thresholds.memory_hard_mb
            ),
        ));
    } else if metrics.memory_mb > thresholds.memory_soft_mb {
        alerts.push(MonitorAlert::new(
            RULE_MEMORY_SOFT,
            Severity::Warning,
            format!(
                "memory {:.0} MiB exceeds soft limit {:.0} MiB",
                metrics.memory_mb, thresholds.memory_soft_mb
            ),
        ));
    }

    alerts
}

/// Applies the rules with a per-rule cooldown
#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    thresholds: AlertThresholds,
    last_fired: HashMap<String, DateTime<Utc>>,
}

impl AlertEvaluator {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            last_fired: HashMap::new(),
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Alerts that fire now, after suppressing rules still cooling down
    pub fn check(
        &mut self,
        metrics: &MigrationMetrics,
        last_progress: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<MonitorAlert> {
        let cooldown = chrono::Duration::from_std(self.thresholds.cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut fired = Vec::new();
        for alert in evaluate_rules(metrics, &self.thresholds, last_progress, now) {
            if let Some(last) = self.last_fired.get(&alert.rule) {
                if now - *last < cooldown {
                    continue;
                }
            }
            self.last_fired.insert(alert.rule.clone(), now);
            fired.push(alert);
        }
        fired
    }
}
