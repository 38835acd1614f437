//! Core trait definitions for the document store abstraction

use async_trait::async_trait;
use tokio::sync::watch;

use super::error::StorageResult;
use super::types::*;

/// Receiver that always holds the newest document matching a query
pub type LatestSubscription = watch::Receiver<Option<StoredDocument>>;

/// The storage substrate migrations run against.
///
/// Only these primitives are required from a backend; everything the crate
/// persists for itself lives in ordinary documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Maximum number of mutations accepted by a single write group
    fn max_write_group_size(&self) -> usize;

    /// Fetch a document by id
    async fn get(&self, collection: &str, id: &str) -> StorageResult<Option<StoredDocument>>;

    /// Run a cursor-paginated query
    async fn query(&self, query: &Query) -> StorageResult<Page>;

    /// Apply a write group atomically.
    ///
    /// Fails without applying anything when the group exceeds
    /// `max_write_group_size` or any precondition does not hold.
    async fn commit(&self, group: WriteGroup) -> StorageResult<CommitReceipt>;

    /// List collections that currently hold documents
    async fn list_collections(&self) -> StorageResult<Vec<String>>;

    /// Watch the first document of `query` as it changes
    async fn subscribe_latest(&self, query: Query) -> StorageResult<LatestSubscription>;

    /// Check the health of the backend
    async fn health_check(&self) -> StorageResult<HealthStatus>;
}
