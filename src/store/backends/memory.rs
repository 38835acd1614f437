//! In-memory document store backend

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, trace};

use crate::store::{
    error::{StorageError, StorageResult},
    traits::{DocumentStore, LatestSubscription},
    types::*,
};

type Collections = BTreeMap<String, BTreeMap<String, Document>>;

/// Memory store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Maximum mutations per atomic write group
    #[serde(default = "default_write_group_limit")]
    pub max_write_group_size: usize,
}

fn default_write_group_limit() -> usize {
    500
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_write_group_size: default_write_group_limit(),
        }
    }
}

/// In-memory backend used for tests and local runs
pub struct MemoryStore {
    config: MemoryStoreConfig,
    collections: Arc<RwLock<Collections>>,
    subscriptions: Arc<Mutex<Vec<(Query, watch::Sender<Option<StoredDocument>>)>>>,
    fail_next_commits: AtomicUsize,
    unavailable: AtomicBool,
    commit_sizes: Arc<Mutex<Vec<usize>>>,
}

impl MemoryStore {
    /// Create a store with the default write group limit
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store from explicit configuration
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            config,
            collections: Arc::new(RwLock::new(BTreeMap::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            fail_next_commits: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
            commit_sizes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a store with a specific write group limit
    pub fn with_write_group_limit(limit: usize) -> Self {
        Self::with_config(MemoryStoreConfig {
            max_write_group_size: limit,
        })
    }

    /// Insert documents directly, bypassing write groups (test setup)
    pub async fn seed(&self, collection: &str, documents: Vec<StoredDocument>) {
        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();
        for doc in documents {
            target.insert(doc.id, doc.data);
        }
    }

    /// Copy of every document in a collection keyed by id
    pub async fn snapshot(&self, collection: &str) -> BTreeMap<String, Document> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Make the next `count` commits fail with a retryable error
    pub fn fail_next_commits(&self, count: usize) {
        self.fail_next_commits.store(count, AtomicOrdering::SeqCst);
    }

    /// Simulate the backend going away (or coming back)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }

    /// Sizes of every write group committed so far
    pub async fn commit_sizes(&self) -> Vec<usize> {
        self.commit_sizes.lock().await.clone()
    }

    fn ensure_available(&self) -> StorageResult<()> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(StorageError::unavailable("memory store is offline"));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next_commits
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn run_query(collections: &Collections, query: &Query) -> Page {
    let Some(collection) = collections.get(&query.collection) else {
        return Page::default();
    };

    let mut matching: Vec<StoredDocument> = collection
        .iter()
        .filter(|(_, doc)| query.predicates.iter().all(|p| p.matches(doc)))
        .map(|(id, doc)| StoredDocument::new(id.clone(), doc.clone()))
        .collect();

    let order_key = |doc: &StoredDocument| (doc.order_value(&query.order_by), doc.id.clone());
    let cmp = |a: &(serde_json::Value, String), b: &(serde_json::Value, String)| {
        let ordering = compare_values(&a.0, &b.0).then_with(|| a.1.cmp(&b.1));
        if query.descending {
            ordering.reverse()
        } else {
            ordering
        }
    };
    matching.sort_by(|a, b| cmp(&order_key(a), &order_key(b)));

    if let Some(cursor) = &query.start_after {
        let position = (cursor.order_value.clone(), cursor.id.clone());
        matching.retain(|doc| cmp(&order_key(doc), &position) == Ordering::Greater);
    }

    let limit = query.limit.max(1);
    let has_more = matching.len() > limit;
    matching.truncate(limit);

    let next_cursor = if has_more {
        matching.last().map(|doc| Cursor {
            order_value: doc.order_value(&query.order_by),
            id: doc.id.clone(),
        })
    } else {
        None
    };

    Page {
        documents: matching,
        next_cursor,
    }
}

fn apply_mutation(collections: &mut Collections, mutation: Mutation) {
    match mutation {
        Mutation::Set {
            collection,
            id,
            data,
        } => {
            collections.entry(collection).or_default().insert(id, data);
        }
        Mutation::Merge {
            collection,
            id,
            fields,
        } => {
            let doc = collections
                .entry(collection)
                .or_default()
                .entry(id)
                .or_default();
            for (key, value) in fields {
                doc.insert(key, value);
            }
        }
        Mutation::Delete { collection, id } => {
            if let Some(docs) = collections.get_mut(&collection) {
                docs.remove(&id);
                if docs.is_empty() {
                    collections.remove(&collection);
                }
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn max_write_group_size(&self) -> usize {
        self.config.max_write_group_size
    }

    async fn get(&self, collection: &str, id: &str) -> StorageResult<Option<StoredDocument>> {
        self.ensure_available()?;
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| StoredDocument::new(id, doc.clone())))
    }

    async fn query(&self, query: &Query) -> StorageResult<Page> {
        self.ensure_available()?;
        if query.limit == 0 {
            return Err(StorageError::invalid("query limit must be positive"));
        }
        let collections = self.collections.read().await;
        Ok(run_query(&collections, query))
    }

    async fn commit(&self, group: WriteGroup) -> StorageResult<CommitReceipt> {
        self.ensure_available()?;

        let size = group.mutations.len();
        if size > self.config.max_write_group_size {
            return Err(StorageError::CapacityExceeded {
                size,
                limit: self.config.max_write_group_size,
            });
        }

        if self.take_injected_failure() {
            debug!("Injected commit failure for group of {} mutations", size);
            return Err(StorageError::CommitFailed(
                "injected transient failure".to_string(),
            ));
        }

        let mut collections = self.collections.write().await;
        for precondition in &group.preconditions {
            let current = collections
                .get(&precondition.collection)
                .and_then(|docs| docs.get(&precondition.id));
            if !precondition.holds(current) {
                return Err(StorageError::conflict(format!(
                    "precondition failed for {}/{}",
                    precondition.collection, precondition.id
                )));
            }
        }

        for mutation in group.mutations {
            apply_mutation(&mut collections, mutation);
        }
        trace!("Committed write group of {} mutations", size);

        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.retain(|(_, sender)| !sender.is_closed());
        for (query, sender) in subscriptions.iter() {
            let latest = run_query(&collections, &query.clone().limit(1))
                .documents
                .into_iter()
                .next();
            sender.send_if_modified(|current| {
                if *current != latest {
                    *current = latest.clone();
                    true
                } else {
                    false
                }
            });
        }
        drop(subscriptions);
        drop(collections);

        self.commit_sizes.lock().await.push(size);

        Ok(CommitReceipt {
            mutations_applied: size,
            committed_at: Utc::now(),
        })
    }

    async fn list_collections(&self) -> StorageResult<Vec<String>> {
        self.ensure_available()?;
        Ok(self.collections.read().await.keys().cloned().collect())
    }

    async fn subscribe_latest(&self, query: Query) -> StorageResult<LatestSubscription> {
        self.ensure_available()?;
        let initial = {
            let collections = self.collections.read().await;
            run_query(&collections, &query.clone().limit(1))
                .documents
                .into_iter()
                .next()
        };
        let (sender, receiver) = watch::channel(initial);
        self.subscriptions.lock().await.push((query, sender));
        Ok(receiver)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let offline = self.unavailable.load(AtomicOrdering::SeqCst);
        Ok(HealthStatus {
            healthy: !offline,
            backend_type: "memory".to_string(),
            latency_ms: 0,
            errors: if offline {
                vec!["memory store is offline".to_string()]
            } else {
                vec![]
            },
        })
    }
}
