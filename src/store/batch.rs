//! Capacity-aware accumulation of mutations into atomic write groups

use tracing::trace;

use super::error::StorageResult;
use super::traits::DocumentStore;
use super::types::{Mutation, WriteGroup};

/// Totals reported by a [`WriteBatcher`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchTotals {
    /// Write groups committed (or that would have been, in dry-run mode)
    pub groups: usize,
    /// Mutations committed (or intended)
    pub mutations: usize,
    /// Largest group produced
    pub largest_group: usize,
}

/// Accumulates mutations and commits them in groups no larger than the
/// store's cap.
///
/// Only one group is open at a time; `push` does not return until a full
/// group has been committed. In dry-run mode groups are counted and
/// discarded instead of committed.
pub struct WriteBatcher<'a> {
    store: &'a dyn DocumentStore,
    limit: usize,
    dry_run: bool,
    pending: WriteGroup,
    totals: BatchTotals,
}

impl<'a> WriteBatcher<'a> {
    pub fn new(store: &'a dyn DocumentStore, dry_run: bool) -> Self {
        Self::with_limit(store, store.max_write_group_size(), dry_run)
    }

    /// Use a limit below the store's own cap
    pub fn with_limit(store: &'a dyn DocumentStore, limit: usize, dry_run: bool) -> Self {
        let limit = limit.clamp(1, store.max_write_group_size().max(1));
        Self {
            store,
            limit,
            dry_run,
            pending: WriteGroup::new(),
            totals: BatchTotals::default(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Add a mutation, committing the open group first if it is full
    pub async fn push(&mut self, mutation: Mutation) -> StorageResult<()> {
        if self.pending.len() >= self.limit {
            self.flush().await?;
        }
        self.pending.push(mutation);
        Ok(())
    }

    /// Commit whatever is pending
    pub async fn flush(&mut self) -> StorageResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let group = std::mem::take(&mut self.pending);
        let size = group.len();

        if self.dry_run {
            trace!("Dry run: would commit write group of {} mutations", size);
        } else if let Err(err) = self.store.commit(group.clone()).await {
            self.pending = group;
            return Err(err);
        }

        self.totals.groups += 1;
        self.totals.mutations += size;
        self.totals.largest_group = self.totals.largest_group.max(size);
        Ok(())
    }

    /// Mutations waiting in the open group
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop the open group without committing it
    pub fn discard(&mut self) {
        self.pending = WriteGroup::new();
    }

    pub fn totals(&self) -> BatchTotals {
        self.totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backends::MemoryStore;
    use crate::store::types::Document;

    fn set(id: usize) -> Mutation {
        Mutation::Set {
            collection: "docs".to_string(),
            id: format!("doc-{id}"),
            data: Document::new(),
        }
    }

    #[tokio::test]
    async fn test_batcher_splits_at_store_limit() -> StorageResult<()> {
        let store = MemoryStore::with_write_group_limit(4);
        let mut batcher = WriteBatcher::new(&store, false);
        for i in 0..10 {
            batcher.push(set(i)).await?;
        }
        batcher.flush().await?;

        assert_eq!(store.commit_sizes().await, vec![4, 4, 2]);
        assert_eq!(batcher.totals().groups, 3);
        assert_eq!(batcher.totals().largest_group, 4);
        assert_eq!(store.snapshot("docs").await.len(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_counts_without_writing() -> StorageResult<()> {
        let store = MemoryStore::with_write_group_limit(3);
        let mut batcher = WriteBatcher::new(&store, true);
        for i in 0..7 {
            batcher.push(set(i)).await?;
        }
        batcher.flush().await?;

        assert_eq!(batcher.totals().mutations, 7);
        assert_eq!(batcher.totals().groups, 3);
        assert!(store.commit_sizes().await.is_empty());
        assert!(store.snapshot("docs").await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_group_pending() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        let mut batcher = WriteBatcher::new(&store, false);
        batcher.push(set(1)).await.unwrap();

        assert!(batcher.flush().await.is_err());
        assert_eq!(batcher.pending(), 1);
        assert!(batcher.flush().await.is_ok());
        assert_eq!(batcher.pending(), 0);
    }
}
