//! Traffic shaping collaborator used by blue/green and canary rollouts

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::schema::SchemaVersion;

/// Side of a blue/green pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficTarget {
    Blue,
    Green,
}

impl TrafficTarget {
    pub fn other(self) -> Self {
        match self {
            TrafficTarget::Blue => TrafficTarget::Green,
            TrafficTarget::Green => TrafficTarget::Blue,
        }
    }
}

/// Routes application traffic between schema versions
#[async_trait]
pub trait TrafficController: Send + Sync {
    /// Stand up the parallel target serving `version`
    async fn prepare_target(
        &self,
        deployment_id: &str,
        version: SchemaVersion,
    ) -> anyhow::Result<TrafficTarget>;

    async fn warm_up(&self, deployment_id: &str, target: TrafficTarget) -> anyhow::Result<()>;

    /// Send `percentage` of traffic to the new version
    async fn route_percentage(&self, deployment_id: &str, percentage: f64) -> anyhow::Result<()>;

    /// Success rate of requests served by the new version, in percent
    async fn observe_success_rate(&self, deployment_id: &str) -> anyhow::Result<f64>;

    /// Move all traffic to `target`
    async fn switch_traffic(&self, deployment_id: &str, target: TrafficTarget)
        -> anyhow::Result<()>;

    /// Target currently receiving traffic
    async fn active_target(&self) -> TrafficTarget;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TrafficAction {
    Prepared { target: TrafficTarget },
    WarmedUp { target: TrafficTarget },
    Routed { percentage: f64 },
    Switched { target: TrafficTarget },
}

#[derive(Debug)]
struct SimulatedState {
    success_rate: f64,
    routed: f64,
    active: TrafficTarget,
    actions: Vec<TrafficAction>,
}

/// In-process controller reporting a configurable success rate
#[derive(Debug)]
pub struct SimulatedTrafficController {
    state: RwLock<SimulatedState>,
    jitter: f64,
    latency: Duration,
}

impl SimulatedTrafficController {
    pub fn new(success_rate: f64) -> Self {
        Self {
            state: RwLock::new(SimulatedState {
                success_rate,
                routed: 0.0,
                active: TrafficTarget::Blue,
                actions: Vec::new(),
            }),
            jitter: 0.0,
            latency: Duration::ZERO,
        }
    }

    /// Vary observed rates by up to `jitter` percentage points
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.abs();
        self
    }

    /// Delay applied to every traffic change
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn set_success_rate(&self, success_rate: f64) {
        self.state.write().await.success_rate = success_rate;
    }

    pub async fn routed_percentage(&self) -> f64 {
        self.state.read().await.routed
    }

    pub async fn actions(&self) -> Vec<TrafficAction> {
        self.state.read().await.actions.clone()
    }

    async fn settle(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for SimulatedTrafficController {
    fn default() -> Self {
        Self::new(100.0)
    }
}

#[async_trait]
impl TrafficController for SimulatedTrafficController {
    async fn prepare_target(
        &self,
        deployment_id: &str,
        version: SchemaVersion,
    ) -> anyhow::Result<TrafficTarget> {
        self.settle().await;
        let mut state = self.state.write().await;
        let target = state.active.other();
        debug!("{}: prepared {:?} for {}", deployment_id, target, version);
        state.actions.push(TrafficAction::Prepared { target });
        Ok(target)
    }

    async fn warm_up(&self, deployment_id: &str, target: TrafficTarget) -> anyhow::Result<()> {
        self.settle().await;
        debug!("{}: warmed up {:?}", deployment_id, target);
        self.state
            .write()
            .await
            .actions
            .push(TrafficAction::WarmedUp { target });
        Ok(())
    }

    async fn route_percentage(&self, deployment_id: &str, percentage: f64) -> anyhow::Result<()> {
        if !(0.0..=100.0).contains(&percentage) {
            anyhow::bail!("cannot route {}% of traffic", percentage);
        }
        self.settle().await;
        let mut state = self.state.write().await;
        debug!("{}: routing {}% to new version", deployment_id, percentage);
        state.routed = percentage;
        state.actions.push(TrafficAction::Routed { percentage });
        Ok(())
    }

    async fn observe_success_rate(&self, _deployment_id: &str) -> anyhow::Result<f64> {
        let success_rate = self.state.read().await.success_rate;
        if self.jitter == 0.0 {
            return Ok(success_rate);
        }
        let offset = rand::rng().random_range(-self.jitter..=self.jitter);
        Ok((success_rate + offset).clamp(0.0, 100.0))
    }

    async fn switch_traffic(
        &self,
        deployment_id: &str,
        target: TrafficTarget,
    ) -> anyhow::Result<()> {
        self.settle().await;
        let mut state = self.state.write().await;
        debug!("{}: switching traffic to {:?}", deployment_id, target);
        state.active = target;
        state.actions.push(TrafficAction::Switched { target });
        Ok(())
    }

    async fn active_target(&self) -> TrafficTarget {
        self.state.read().await.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blue_green_switch_records_actions() -> anyhow::Result<()> {
        let traffic = SimulatedTrafficController::default();
        let version = SchemaVersion::parse("1.1.0")?;
        let target = traffic.prepare_target("d1", version).await?;
        assert_eq!(target, TrafficTarget::Green);
        traffic.switch_traffic("d1", target).await?;
        assert_eq!(traffic.active_target().await, TrafficTarget::Green);
        assert_eq!(traffic.actions().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_jitter_stays_in_range() -> anyhow::Result<()> {
        let traffic = SimulatedTrafficController::new(99.0).with_jitter(2.0);
        for _ in 0..50 {
            let rate = traffic.observe_success_rate("d1").await?;
            assert!((97.0..=100.0).contains(&rate));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_invalid_percentage() {
        let traffic = SimulatedTrafficController::default();
        assert!(traffic.route_percentage("d1", 150.0).await.is_err());
    }
}
