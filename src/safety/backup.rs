//! Collection backups kept inside the document store.
//!
//! A backup copies every document of the named collections into
//! `_backup_data`, one document per original tagged with the backup id,
//! source collection and original id. The `_backups` record carries the
//! per-collection counts and a SHA-256 checksum over that metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{ErrorCode, Result, SchemaFlowError};
use crate::events::{EventBus, EventKind, EventSource, Severity};
use crate::store::{
    collect_all, collections, from_document, to_document, Document, DocumentStore, Mutation,
    Predicate, Query, StorageResult, WriteBatcher, WriteGroup,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Creating,
    Completed,
    Failed,
    Expired,
}

/// Counts for one collection inside a backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionBackup {
    pub name: String,
    pub documents: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    /// Migration or deployment the backup was taken for
    pub owning_id: String,
    pub collections: Vec<CollectionBackup>,
    pub document_count: u64,
    pub size_bytes: u64,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == BackupStatus::Expired || self.expires_at <= now
    }

    /// SHA-256 over the record's identifying metadata and counts
    pub fn compute_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.owning_id.as_bytes());
        hasher.update(self.created_at.to_rfc3339().as_bytes());

        let mut sorted: Vec<&CollectionBackup> = self.collections.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        for collection in sorted {
            hasher.update(collection.name.as_bytes());
            hasher.update(collection.documents.to_string().as_bytes());
            hasher.update(collection.bytes.to_string().as_bytes());
        }
        hasher.update(self.document_count.to_string().as_bytes());
        hasher.update(self.size_bytes.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn collection(&self, name: &str) -> Option<&CollectionBackup> {
        self.collections.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// How long the backup stays restorable
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Documents read per page while copying
    pub page_size: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Replace documents that exist in the live collection
    #[serde(default)]
    pub overwrite_existing: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Restore only these collections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_collections: Option<Vec<String>>,
    /// Delete live documents the backup does not contain
    #[serde(default)]
    pub remove_extraneous: bool,
}

impl RestoreOptions {
    /// Options that bring collections back to exactly the backed-up state
    pub fn exact() -> Self {
        Self {
            overwrite_existing: true,
            remove_extraneous: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionRestore {
    pub name: String,
    pub restored: u64,
    pub skipped: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub backup_id: String,
    pub success: bool,
    pub dry_run: bool,
    pub collections: Vec<CollectionRestore>,
    pub documents_restored: u64,
    pub documents_skipped: u64,
    pub documents_removed: u64,
    pub errors: Vec<String>,
}

impl RestoreResult {
    fn new(backup_id: &str, dry_run: bool) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            success: false,
            dry_run,
            collections: Vec::new(),
            documents_restored: 0,
            documents_skipped: 0,
            documents_removed: 0,
            errors: Vec::new(),
        }
    }

    fn failed(backup_id: &str, dry_run: bool, error: &SchemaFlowError) -> Self {
        let mut result = Self::new(backup_id, dry_run);
        result.errors.push(error.to_string());
        result
    }
}

/// Creates, restores and expires backups
pub struct BackupManager {
    store: Arc<dyn DocumentStore>,
    events: EventBus,
}

impl BackupManager {
    pub fn new(store: Arc<dyn DocumentStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Copy every document of `collection_names` into a new backup
    pub async fn create_backup(
        &self,
        owning_id: &str,
        collection_names: &[String],
        config: &BackupConfig,
    ) -> Result<String> {
        let id = format!("backup-{}", Uuid::new_v4());
        let span = info_span!("backup", id = %id, owner = %owning_id);
        self.create_backup_inner(id, owning_id, collection_names, config)
            .instrument(span)
            .await
    }

    async fn create_backup_inner(
        &self,
        id: String,
        owning_id: &str,
        collection_names: &[String],
        config: &BackupConfig,
    ) -> Result<String> {
        let created_at = Utc::now();
        let retention = chrono::Duration::from_std(config.retention).map_err(|e| {
            SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("backup retention out of range: {}", e),
            )
        })?;
        let mut record = BackupRecord {
            id: id.clone(),
            owning_id: owning_id.to_string(),
            collections: Vec::new(),
            document_count: 0,
            size_bytes: 0,
            status: BackupStatus::Creating,
            created_at,
            expires_at: created_at + retention,
            checksum: String::new(),
            error: None,
        };
        self.save_record(&record).await?;

        let mut names: Vec<&String> = collection_names.iter().collect();
        names.sort();
        names.dedup();

        for name in names {
            match self.copy_collection(&id, name, created_at, config).await {
                Ok(copied) => {
                    debug!(
                        "Backed up {} document(s) of {} ({} bytes)",
                        copied.documents, copied.name, copied.bytes
                    );
                    record.document_count += copied.documents;
                    record.size_bytes += copied.bytes;
                    record.collections.push(copied);
                }
                Err(e) => {
                    error!("Backup {} failed on {}: {}", id, name, e);
                    record.status = BackupStatus::Failed;
                    record.error = Some(e.to_string());
                    if let Err(save_err) = self.save_record(&record).await {
                        warn!("Could not mark backup {} as failed: {}", id, save_err);
                    }
                    return Err(SchemaFlowError::safety(
                        ErrorCode::SAFETY_BACKUP_FAILED,
                        format!("backup of collection {} failed", name),
                    )
                    .with_source(SchemaFlowError::from(e)));
                }
            }
        }

        record.status = BackupStatus::Completed;
        record.checksum = record.compute_checksum();
        self.save_record(&record).await?;

        info!(
            "Backup {} completed: {} document(s) across {} collection(s)",
            id,
            record.document_count,
            record.collections.len()
        );
        self.events.emit(
            Severity::Info,
            EventSource::Backup,
            EventKind::BackupCreated {
                backup_id: id.clone(),
                documents: record.document_count,
            },
            format!("backup {} created for {}", id, owning_id),
        );
        Ok(id)
    }

    async fn copy_collection(
        &self,
        backup_id: &str,
        collection: &str,
        backed_up_at: DateTime<Utc>,
        config: &BackupConfig,
    ) -> StorageResult<CollectionBackup> {
        let mut copied = CollectionBackup {
            name: collection.to_string(),
            documents: 0,
            bytes: 0,
        };
        let mut batcher = WriteBatcher::new(self.store.as_ref(), false);
        let mut cursor = None;
        loop {
            let query = Query::collection(collection)
                .limit(config.page_size.max(1))
                .start_after(cursor.take());
            let page = self.store.query(&query).await?;
            for doc in page.documents {
                copied.documents += 1;
                copied.bytes += serde_json::to_vec(&doc.data)?.len() as u64;
                let data = backup_entry(backup_id, collection, &doc.id, backed_up_at, doc.data);
                batcher
                    .push(Mutation::Set {
                        collection: collections::BACKUP_DATA.to_string(),
                        id: backup_entry_id(backup_id, collection, &doc.id),
                        data,
                    })
                    .await?;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        batcher.flush().await?;
        Ok(copied)
    }

    /// Replay a backup into its original collections.
    ///
    /// Failures are reported in the result.
    pub async fn restore_backup(&self, backup_id: &str, options: &RestoreOptions) -> RestoreResult {
        let span = info_span!("restore", backup = %backup_id, dry_run = options.dry_run);
        async {
            let record = match self.restorable_record(backup_id).await {
                Ok(record) => record,
                Err(e) => {
                    error!("Backup {} cannot be restored: {}", backup_id, e);
                    return RestoreResult::failed(backup_id, options.dry_run, &e);
                }
            };

            let mut result = RestoreResult::new(backup_id, options.dry_run);
            for collection in &record.collections {
                if let Some(only) = &options.specific_collections {
                    if !only.contains(&collection.name) {
                        continue;
                    }
                }
                match self.restore_collection(&record, collection, options).await {
                    Ok(restored) => {
                        result.documents_restored += restored.restored;
                        result.documents_skipped += restored.skipped;
                        result.documents_removed += restored.removed;
                        result.collections.push(restored);
                    }
                    Err(e) => {
                        error!("Restoring {} from {} failed: {}", collection.name, backup_id, e);
                        result
                            .errors
                            .push(format!("collection {}: {}", collection.name, e));
                    }
                }
            }
            result.success = result.errors.is_empty();

            info!(
                "Restore of {} {}: {} restored, {} skipped, {} removed{}",
                backup_id,
                if result.success { "finished" } else { "failed" },
                result.documents_restored,
                result.documents_skipped,
                result.documents_removed,
                if options.dry_run { " (dry run)" } else { "" }
            );
            if result.success && !options.dry_run {
                self.events.emit(
                    Severity::Info,
                    EventSource::Backup,
                    EventKind::BackupRestored {
                        backup_id: backup_id.to_string(),
                        documents: result.documents_restored,
                    },
                    format!("backup {} restored", backup_id),
                );
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Load a backup record and check it may be restored
    async fn restorable_record(&self, backup_id: &str) -> Result<BackupRecord> {
        let record = self.get_backup(backup_id).await?.ok_or_else(|| {
            SchemaFlowError::safety(
                ErrorCode::SAFETY_BACKUP_NOT_FOUND,
                format!("backup {} not found", backup_id),
            )
        })?;
        if record.status != BackupStatus::Completed || record.is_expired(Utc::now()) {
            return Err(SchemaFlowError::safety(
                ErrorCode::SAFETY_BACKUP_UNUSABLE,
                format!(
                    "backup {} is {:?} and expires at {}",
                    backup_id, record.status, record.expires_at
                ),
            ));
        }
        if record.checksum != record.compute_checksum() {
            return Err(SchemaFlowError::safety(
                ErrorCode::SAFETY_CHECKSUM_MISMATCH,
                format!("backup {} failed checksum verification", backup_id),
            ));
        }
        Ok(record)
    }

    async fn restore_collection(
        &self,
        record: &BackupRecord,
        collection: &CollectionBackup,
        options: &RestoreOptions,
    ) -> Result<CollectionRestore> {
        let entries = self.backup_entries(&record.id, &collection.name).await?;
        if entries.len() as u64 != collection.documents {
            return Err(SchemaFlowError::safety(
                ErrorCode::SAFETY_CHECKSUM_MISMATCH,
                format!(
                    "backup {} holds {} document(s) of {}, record says {}",
                    record.id,
                    entries.len(),
                    collection.name,
                    collection.documents
                ),
            ));
        }

        let live: HashMap<String, Document> =
            collect_all(self.store.as_ref(), Query::collection(&collection.name).limit(500))
                .await?
                .into_iter()
                .map(|doc| (doc.id, doc.data))
                .collect();

        let mut restored = CollectionRestore {
            name: collection.name.clone(),
            ..CollectionRestore::default()
        };
        let mut batcher = WriteBatcher::new(self.store.as_ref(), options.dry_run);
        for (original_id, data) in &entries {
            if live.contains_key(original_id) && !options.overwrite_existing {
                restored.skipped += 1;
                continue;
            }
            batcher
                .push(Mutation::Set {
                    collection: collection.name.clone(),
                    id: original_id.clone(),
                    data: data.clone(),
                })
                .await?;
            restored.restored += 1;
        }
        if options.remove_extraneous {
            for id in live.keys().filter(|id| !entries.contains_key(*id)) {
                batcher
                    .push(Mutation::Delete {
                        collection: collection.name.clone(),
                        id: id.clone(),
                    })
                    .await?;
                restored.removed += 1;
            }
        }
        batcher.flush().await?;
        Ok(restored)
    }

    /// Backed-up documents of one collection keyed by original id
    async fn backup_entries(
        &self,
        backup_id: &str,
        collection: &str,
    ) -> Result<BTreeMap<String, Document>> {
        let query = Query::collection(collections::BACKUP_DATA)
            .filter(Predicate::Eq("backup_id".into(), json!(backup_id)))
            .filter(Predicate::Eq("collection".into(), json!(collection)))
            .limit(500);
        let mut entries = BTreeMap::new();
        for doc in collect_all(self.store.as_ref(), query).await? {
            let original_id = doc
                .data
                .get("original_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let data = match doc.data.get("data") {
                Some(Value::Object(data)) => Some(data.clone()),
                _ => None,
            };
            match (original_id, data) {
                (Some(id), Some(data)) => {
                    entries.insert(id, data);
                }
                _ => {
                    return Err(SchemaFlowError::safety(
                        ErrorCode::SAFETY_BACKUP_UNUSABLE,
                        format!("malformed backup entry {}", doc.id),
                    ))
                }
            }
        }
        Ok(entries)
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        match self.store.get(collections::BACKUPS, backup_id).await? {
            Some(doc) => Ok(Some(from_document(&doc.data)?)),
            None => Ok(None),
        }
    }

    /// Every backup record, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let docs = collect_all(
            self.store.as_ref(),
            Query::collection(collections::BACKUPS).limit(500),
        )
        .await?;
        let mut records = docs
            .iter()
            .map(|doc| from_document::<BackupRecord>(&doc.data))
            .collect::<StorageResult<Vec<_>>>()?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Remove a backup's data and record. Returns false if it did not exist.
    pub async fn delete_backup(&self, backup_id: &str) -> Result<bool> {
        let query = Query::collection(collections::BACKUP_DATA)
            .filter(Predicate::Eq("backup_id".into(), json!(backup_id)))
            .limit(500);
        let entries = collect_all(self.store.as_ref(), query).await?;
        let existed = self.get_backup(backup_id).await?.is_some();

        let mut batcher = WriteBatcher::new(self.store.as_ref(), false);
        for entry in entries {
            batcher
                .push(Mutation::Delete {
                    collection: collections::BACKUP_DATA.to_string(),
                    id: entry.id,
                })
                .await?;
        }
        batcher.flush().await?;
        self.store
            .commit(WriteGroup::new().delete(collections::BACKUPS, backup_id))
            .await?;
        debug!("Deleted backup {}", backup_id);
        Ok(existed)
    }

    /// Delete every backup whose retention has passed
    pub async fn delete_expired_backups(&self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<BackupRecord> = self
            .list_backups()
            .await?
            .into_iter()
            .filter(|record| record.is_expired(now))
            .collect();
        for record in &expired {
            self.delete_backup(&record.id).await?;
        }
        if !expired.is_empty() {
            info!("Deleted {} expired backup(s)", expired.len());
            self.events.emit(
                Severity::Info,
                EventSource::Backup,
                EventKind::BackupsExpired {
                    count: expired.len(),
                },
                format!("{} expired backup(s) deleted", expired.len()),
            );
        }
        Ok(expired.len())
    }

    async fn save_record(&self, record: &BackupRecord) -> Result<()> {
        self.store
            .commit(WriteGroup::new().set(collections::BACKUPS, &record.id, to_document(record)?))
            .await?;
        Ok(())
    }
}

fn backup_entry_id(backup_id: &str, collection: &str, document_id: &str) -> String {
    format!("{}:{}:{}", backup_id, collection, document_id)
}

fn backup_entry(
    backup_id: &str,
    collection: &str,
    original_id: &str,
    backed_up_at: DateTime<Utc>,
    data: Document,
) -> Document {
    let mut entry = Document::new();
    entry.insert("backup_id".into(), json!(backup_id));
    entry.insert("collection".into(), json!(collection));
    entry.insert("original_id".into(), json!(original_id));
    entry.insert("backed_up_at".into(), json!(backed_up_at.to_rfc3339()));
    entry.insert("data".into(), Value::Object(data));
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoredDocument};

    fn doc(id: &str, value: Value) -> StoredDocument {
        let Value::Object(data) = value else {
            panic!("test documents must be objects");
        };
        StoredDocument::new(id, data)
    }

    async fn seeded() -> (Arc<MemoryStore>, BackupManager) {
        let store = Arc::new(MemoryStore::new());
        store
            .seed(
                "plants",
                vec![
                    doc("p1", json!({"name": "fern"})),
                    doc("p2", json!({"name": "moss"})),
                ],
            )
            .await;
        let manager = BackupManager::new(store.clone(), EventBus::new());
        (store, manager)
    }

    #[tokio::test]
    async fn test_backup_records_counts_and_checksum() -> Result<()> {
        let (_store, manager) = seeded().await;
        let id = manager
            .create_backup("mig-1", &["plants".to_string()], &BackupConfig::default())
            .await?;

        let record = manager.get_backup(&id).await?.unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.document_count, 2);
        assert!(record.size_bytes > 0);
        assert_eq!(record.checksum, record.compute_checksum());
        assert_eq!(record.checksum.len(), 64);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_skips_existing_unless_overwrite() -> Result<()> {
        let (store, manager) = seeded().await;
        let id = manager
            .create_backup("mig-1", &["plants".to_string()], &BackupConfig::default())
            .await?;
        store
            .commit(
                WriteGroup::new()
                    .set("plants", "p1", json!({"name": "changed"}).as_object().cloned().unwrap())
                    .delete("plants", "p2"),
            )
            .await?;

        let result = manager.restore_backup(&id, &RestoreOptions::default()).await;
        assert!(result.success);
        assert_eq!(result.documents_restored, 1);
        assert_eq!(result.documents_skipped, 1);
        assert_eq!(store.snapshot("plants").await["p1"]["name"], "changed");

        let exact = manager.restore_backup(&id, &RestoreOptions::exact()).await;
        assert!(exact.success);
        assert_eq!(store.snapshot("plants").await["p1"]["name"], "fern");
        Ok(())
    }

    #[tokio::test]
    async fn test_exact_restore_removes_new_documents() -> Result<()> {
        let (store, manager) = seeded().await;
        let id = manager
            .create_backup("mig-1", &["plants".to_string()], &BackupConfig::default())
            .await?;
        let before = store.snapshot("plants").await;
        store
            .seed("plants", vec![doc("p3", json!({"name": "ivy"}))])
            .await;

        let result = manager.restore_backup(&id, &RestoreOptions::exact()).await;
        assert_eq!(result.documents_removed, 1);
        assert_eq!(store.snapshot("plants").await, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_restore_writes_nothing() -> Result<()> {
        let (store, manager) = seeded().await;
        let id = manager
            .create_backup("mig-1", &["plants".to_string()], &BackupConfig::default())
            .await?;
        store
            .commit(WriteGroup::new().delete("plants", "p1"))
            .await?;

        let options = RestoreOptions {
            dry_run: true,
            ..RestoreOptions::default()
        };
        let result = manager.restore_backup(&id, &options).await;
        assert!(result.success);
        assert_eq!(result.documents_restored, 1);
        assert!(!store.snapshot("plants").await.contains_key("p1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_tampered_record_is_refused() -> Result<()> {
        let (store, manager) = seeded().await;
        let id = manager
            .create_backup("mig-1", &["plants".to_string()], &BackupConfig::default())
            .await?;
        let mut record = manager.get_backup(&id).await?.unwrap();
        record.document_count = 99;
        store
            .commit(WriteGroup::new().set(collections::BACKUPS, &id, to_document(&record)?))
            .await?;

        let result = manager.restore_backup(&id, &RestoreOptions::exact()).await;
        assert!(!result.success);
        assert!(result.errors[0].contains("checksum"));
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_backups_are_deleted() -> Result<()> {
        let (store, manager) = seeded().await;
        let config = BackupConfig {
            retention: Duration::ZERO,
            ..BackupConfig::default()
        };
        let id = manager
            .create_backup("mig-1", &["plants".to_string()], &config)
            .await?;

        let result = manager.restore_backup(&id, &RestoreOptions::exact()).await;
        assert!(!result.success);

        assert_eq!(manager.delete_expired_backups().await?, 1);
        assert!(manager.get_backup(&id).await?.is_none());
        assert!(store.snapshot(collections::BACKUP_DATA).await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_backup_is_marked() -> Result<()> {
        let (store, manager) = seeded().await;
        store.fail_next_commits(1);
        // The first commit is the "creating" record itself
        assert!(manager
            .create_backup("mig-1", &["plants".to_string()], &BackupConfig::default())
            .await
            .is_err());

        store.fail_next_commits(0);
        let id = manager
            .create_backup("mig-2", &["plants".to_string()], &BackupConfig::default())
            .await?;
        let backups = manager.list_backups().await?;
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].id, id);
        Ok(())
    }
}
