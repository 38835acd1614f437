//! Per-document application of a migration operation
//!
//! One function per operation kind, dispatched from an exhaustive match.
//! Everything here only decides what should change; writing is the
//! engine's job.

use serde_json::Value;

use super::convert::default_conversion;
use super::operation::OperationKind;
use crate::store::{Document, Mutation, StoredDocument};

/// What to do with one document
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    /// Nothing to do; the document already has the target shape
    Unchanged,
    /// Mutations to apply for this document
    Update(Vec<Mutation>),
    /// Left untouched for a reason worth reporting
    Rejected(String),
}

/// Decide the change `kind` makes to `document` in `collection`
pub async fn apply_operation(
    kind: &OperationKind,
    collection: &str,
    document: &StoredDocument,
) -> anyhow::Result<DocumentChange> {
    match kind {
        OperationKind::AddField { field, default } => {
            Ok(add_field(collection, document, field, default))
        }
        OperationKind::RemoveField { field, archive_to } => Ok(remove_field(
            collection,
            document,
            field,
            archive_to.as_deref(),
        )),
        OperationKind::RenameField {
            from,
            to,
            preserve_old_field,
        } => Ok(rename_field(
            collection,
            document,
            from,
            to,
            *preserve_old_field,
        )),
        OperationKind::ChangeFieldType {
            field,
            target,
            converter,
        } => {
            let Some(current) = document.data.get(field) else {
                return Ok(DocumentChange::Unchanged);
            };
            if target.accepts(current) {
                return Ok(DocumentChange::Unchanged);
            }
            let converted = match converter {
                Some(converter) => converter.convert(current)?,
                None => default_conversion(current, *target)?,
            };
            if &converted == current {
                return Ok(DocumentChange::Unchanged);
            }
            let mut data = document.data.clone();
            data.insert(field.clone(), converted);
            Ok(replace(collection, document, data))
        }
        OperationKind::TransformData {
            transformer,
            validator,
        } => {
            let Some(transformed) = transformer.transform(document).await? else {
                return Ok(DocumentChange::Unchanged);
            };
            if transformed == document.data {
                return Ok(DocumentChange::Unchanged);
            }
            if let Some(validator) = validator {
                if let Err(reason) = validator.validate(&transformed).await {
                    return Ok(DocumentChange::Rejected(format!(
                        "transformed document {} rejected: {:#}",
                        document.id, reason
                    )));
                }
            }
            Ok(replace(collection, document, transformed))
        }
        // Custom operations work on whole pages, see the engine
        OperationKind::Custom { .. } => Ok(DocumentChange::Unchanged),
    }
}

fn replace(collection: &str, document: &StoredDocument, data: Document) -> DocumentChange {
    DocumentChange::Update(vec![Mutation::Set {
        collection: collection.to_string(),
        id: document.id.clone(),
        data,
    }])
}

fn add_field(
    collection: &str,
    document: &StoredDocument,
    field: &str,
    default: &Value,
) -> DocumentChange {
    if document.data.contains_key(field) {
        return DocumentChange::Unchanged;
    }
    let mut data = document.data.clone();
    data.insert(field.to_string(), default.clone());
    replace(collection, document, data)
}

fn remove_field(
    collection: &str,
    document: &StoredDocument,
    field: &str,
    archive_to: Option<&str>,
) -> DocumentChange {
    let Some(removed) = document.data.get(field) else {
        return DocumentChange::Unchanged;
    };

    let mut mutations = Vec::with_capacity(2);
    if let Some(archive) = archive_to {
        let mut fields = Document::new();
        fields.insert(field.to_string(), removed.clone());
        fields.insert(
            "source_collection".to_string(),
            Value::String(collection.to_string()),
        );
        fields.insert("source_id".to_string(), Value::String(document.id.clone()));
        mutations.push(Mutation::Merge {
            collection: archive.to_string(),
            id: format!("{}_{}", collection, document.id),
            fields,
        });
    }

    let mut data = document.data.clone();
    data.remove(field);
    mutations.push(Mutation::Set {
        collection: collection.to_string(),
        id: document.id.clone(),
        data,
    });
    DocumentChange::Update(mutations)
}

fn rename_field(
    collection: &str,
    document: &StoredDocument,
    from: &str,
    to: &str,
    preserve_old_field: bool,
) -> DocumentChange {
    let Some(value) = document.data.get(from) else {
        return DocumentChange::Unchanged;
    };
    if preserve_old_field && document.data.get(to) == Some(value) {
        return DocumentChange::Unchanged;
    }
    let mut data = document.data.clone();
    data.insert(to.to_string(), value.clone());
    if !preserve_old_field {
        data.remove(from);
    }
    replace(collection, document, data)
}
