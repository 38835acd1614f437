//! Typed status events
//!
//! Long-running work publishes [`StatusEvent`]s on an [`EventBus`]. Callers
//! subscribe to the bus, or attach a [`NotificationSink`], instead of
//! registering callbacks on a shared emitter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1024;

/// Event severity levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Component that emitted an event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Registry,
    Migration,
    Backup,
    Monitor,
    Rollback,
    Deployment,
}

/// What happened
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    SchemaRegistered {
        version: String,
        advanced_current: bool,
    },
    MigrationStarted {
        migration_id: String,
        from: String,
        to: String,
        dry_run: bool,
    },
    MigrationProgress {
        migration_id: String,
        operation_index: usize,
        total_operations: usize,
        documents_processed: u64,
    },
    MigrationCompleted {
        migration_id: String,
        success: bool,
        documents_updated: u64,
    },
    BackupCreated {
        backup_id: String,
        documents: u64,
    },
    BackupRestored {
        backup_id: String,
        documents: u64,
    },
    BackupsExpired {
        count: usize,
    },
    AlertRaised {
        monitor_id: String,
        rule: String,
    },
    CheckpointCreated {
        monitor_id: String,
        operation_index: usize,
    },
    RollbackCompleted {
        rollback_id: String,
        success: bool,
    },
    DeploymentPhase {
        deployment_id: String,
        phase: String,
        status: String,
    },
    DeploymentFinished {
        deployment_id: String,
        status: String,
    },
}

/// A single status notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub source: EventSource,
    pub kind: EventKind,
    pub message: String,
}

impl StatusEvent {
    pub fn new(
        severity: Severity,
        source: EventSource,
        kind: EventKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity,
            source,
            kind,
            message: message.into(),
        }
    }
}

/// External consumer of status events
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &StatusEvent) -> anyhow::Result<()>;
}

/// Broadcast channel for status events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish without waiting; events with no subscriber are dropped
    pub fn publish(&self, event: StatusEvent) {
        match event.severity {
            Severity::Info => debug!(source = ?event.source, "{}", event.message),
            Severity::Warning => warn!(source = ?event.source, "{}", event.message),
            Severity::Error | Severity::Critical => {
                error!(source = ?event.source, "{}", event.message)
            }
        }
        let _ = self.sender.send(event);
    }

    /// Convenience for building and publishing in one call
    pub fn emit(
        &self,
        severity: Severity,
        source: EventSource,
        kind: EventKind,
        message: impl Into<String>,
    ) {
        self.publish(StatusEvent::new(severity, source, kind, message));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    /// Pump every future event into `sink` until the bus is dropped
    pub fn forward_to(&self, sink: Arc<dyn NotificationSink>) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if let Err(e) = sink.notify(&event).await {
                            error!("Failed to send notification via {}: {}", sink.name(), e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Notification sink {} lagged, skipped {} events", sink.name(), skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed, stopping sink {}", sink.name());
                        break;
                    }
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
