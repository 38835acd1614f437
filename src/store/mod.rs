//! Document store abstraction
//!
//! Everything the crate migrates, and everything it records about its own
//! work, goes through the [`DocumentStore`] trait. Bookkeeping lives in the
//! underscore-prefixed collections listed in [`collections`].

pub mod backends;
pub mod batch;
pub mod error;
pub mod traits;
pub mod types;

pub use backends::{MemoryStore, MemoryStoreConfig};
pub use batch::{BatchTotals, WriteBatcher};
pub use error::{StorageError, StorageResult};
pub use traits::{DocumentStore, LatestSubscription};
pub use types::{
    from_document, to_document, CommitReceipt, Cursor, Document, HealthStatus, Mutation, Page,
    Precondition, Predicate, Query, StoredDocument, WriteGroup, DOCUMENT_ID,
};

/// Names of the collections used for the crate's own records
pub mod collections {
    pub const SCHEMA_REGISTRY: &str = "_schema_registry";
    pub const SCHEMA_META: &str = "_schema_meta";
    pub const SCHEMA_HISTORY: &str = "_schema_history";
    pub const BACKUPS: &str = "_backups";
    pub const BACKUP_DATA: &str = "_backup_data";
    pub const MIGRATION_MONITORS: &str = "_migration_monitors";
    pub const ROLLBACKS: &str = "_rollbacks";
    pub const DEPLOYMENTS: &str = "_deployments";
    pub const DEPLOYMENT_PROBES: &str = "_deployment_probes";

    /// True for collections that hold bookkeeping rather than application data
    pub fn is_internal(name: &str) -> bool {
        name.starts_with('_')
    }
}

/// Read every document matching `query`, following cursors until exhausted
pub async fn collect_all(
    store: &dyn DocumentStore,
    query: Query,
) -> StorageResult<Vec<StoredDocument>> {
    let mut documents = Vec::new();
    let mut cursor = None;
    loop {
        let page = store.query(&query.clone().start_after(cursor)).await?;
        documents.extend(page.documents);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(documents)
}
