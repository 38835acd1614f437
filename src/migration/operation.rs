//! Migration operations and the hooks callers plug into them

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::schema::FieldType;
use crate::store::{Document, Mutation, StoredDocument};

/// Converts one field value to a new representation
pub trait FieldConverter: Send + Sync {
    fn convert(&self, value: &Value) -> anyhow::Result<Value>;
}

impl<F> FieldConverter for F
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn convert(&self, value: &Value) -> anyhow::Result<Value> {
        self(value)
    }
}

/// Rewrites a whole document. `Ok(None)` leaves the document untouched.
#[async_trait]
pub trait DocumentTransformer: Send + Sync {
    async fn transform(&self, document: &StoredDocument) -> anyhow::Result<Option<Document>>;
}

#[async_trait]
impl<F> DocumentTransformer for F
where
    F: Fn(&StoredDocument) -> anyhow::Result<Option<Document>> + Send + Sync,
{
    async fn transform(&self, document: &StoredDocument) -> anyhow::Result<Option<Document>> {
        self(document)
    }
}

/// Accepts or rejects a transformed document. A rejection skips the
/// document and is reported as a warning.
#[async_trait]
pub trait DocumentValidator: Send + Sync {
    async fn validate(&self, document: &Document) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> DocumentValidator for F
where
    F: Fn(&Document) -> anyhow::Result<()> + Send + Sync,
{
    async fn validate(&self, document: &Document) -> anyhow::Result<()> {
        self(document)
    }
}

/// Free-form logic run against each page of the target collection.
///
/// The returned mutations go through the same write path as every other
/// operation, so dry runs and group limits apply to them too.
#[async_trait]
pub trait CustomExecutor: Send + Sync {
    async fn execute(
        &self,
        collection: &str,
        documents: &[StoredDocument],
    ) -> anyhow::Result<Vec<Mutation>>;
}

#[async_trait]
impl<F> CustomExecutor for F
where
    F: Fn(&str, &[StoredDocument]) -> anyhow::Result<Vec<Mutation>> + Send + Sync,
{
    async fn execute(
        &self,
        collection: &str,
        documents: &[StoredDocument],
    ) -> anyhow::Result<Vec<Mutation>> {
        self(collection, documents)
    }
}

/// The per-kind payload of an operation
#[derive(Clone)]
pub enum OperationKind {
    AddField {
        field: String,
        default: Value,
    },
    RemoveField {
        field: String,
        /// Collection that receives removed values before deletion
        archive_to: Option<String>,
    },
    RenameField {
        from: String,
        to: String,
        preserve_old_field: bool,
    },
    ChangeFieldType {
        field: String,
        target: FieldType,
        converter: Option<Arc<dyn FieldConverter>>,
    },
    TransformData {
        transformer: Arc<dyn DocumentTransformer>,
        validator: Option<Arc<dyn DocumentValidator>>,
    },
    Custom {
        executor: Arc<dyn CustomExecutor>,
    },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::AddField { .. } => "add_field",
            OperationKind::RemoveField { .. } => "remove_field",
            OperationKind::RenameField { .. } => "rename_field",
            OperationKind::ChangeFieldType { .. } => "change_field_type",
            OperationKind::TransformData { .. } => "transform_data",
            OperationKind::Custom { .. } => "custom",
        }
    }
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::AddField { field, default } => f
                .debug_struct("AddField")
                .field("field", field)
                .field("default", default)
                .finish(),
            OperationKind::RemoveField { field, archive_to } => f
                .debug_struct("RemoveField")
                .field("field", field)
                .field("archive_to", archive_to)
                .finish(),
            OperationKind::RenameField {
                from,
                to,
                preserve_old_field,
            } => f
                .debug_struct("RenameField")
                .field("from", from)
                .field("to", to)
                .field("preserve_old_field", preserve_old_field)
                .finish(),
            OperationKind::ChangeFieldType {
                field,
                target,
                converter,
            } => f
                .debug_struct("ChangeFieldType")
                .field("field", field)
                .field("target", target)
                .field("custom_converter", &converter.is_some())
                .finish(),
            OperationKind::TransformData { validator, .. } => f
                .debug_struct("TransformData")
                .field("validated", &validator.is_some())
                .finish(),
            OperationKind::Custom { .. } => f.write_str("Custom"),
        }
    }
}

/// One discrete mutation applied across a collection
#[derive(Debug, Clone)]
pub struct MigrationOperation {
    pub id: String,
    pub collection: String,
    pub description: String,
    /// Lower runs first among operations whose dependencies are met
    pub priority: i32,
    pub depends_on: Vec<String>,
    pub kind: OperationKind,
}

impl MigrationOperation {
    pub fn new(
        id: impl Into<String>,
        collection: impl Into<String>,
        kind: OperationKind,
    ) -> Self {
        let id = id.into();
        let collection = collection.into();
        Self {
            description: format!("{} on {}", kind.name(), collection),
            id,
            collection,
            priority: 0,
            depends_on: Vec::new(),
            kind,
        }
    }

    pub fn add_field(
        id: impl Into<String>,
        collection: impl Into<String>,
        field: impl Into<String>,
        default: Value,
    ) -> Self {
        Self::new(
            id,
            collection,
            OperationKind::AddField {
                field: field.into(),
                default,
            },
        )
    }

    pub fn remove_field(
        id: impl Into<String>,
        collection: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            collection,
            OperationKind::RemoveField {
                field: field.into(),
                archive_to: None,
            },
        )
    }

    pub fn rename_field(
        id: impl Into<String>,
        collection: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            collection,
            OperationKind::RenameField {
                from: from.into(),
                to: to.into(),
                preserve_old_field: false,
            },
        )
    }

    pub fn change_field_type(
        id: impl Into<String>,
        collection: impl Into<String>,
        field: impl Into<String>,
        target: FieldType,
    ) -> Self {
        Self::new(
            id,
            collection,
            OperationKind::ChangeFieldType {
                field: field.into(),
                target,
                converter: None,
            },
        )
    }

    pub fn transform(
        id: impl Into<String>,
        collection: impl Into<String>,
        transformer: Arc<dyn DocumentTransformer>,
    ) -> Self {
        Self::new(
            id,
            collection,
            OperationKind::TransformData {
                transformer,
                validator: None,
            },
        )
    }

    pub fn custom(
        id: impl Into<String>,
        collection: impl Into<String>,
        executor: Arc<dyn CustomExecutor>,
    ) -> Self {
        Self::new(id, collection, OperationKind::Custom { executor })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Archive removed values into `collection`. Only meaningful for remove-field.
    pub fn archive_to(mut self, collection: impl Into<String>) -> Self {
        if let OperationKind::RemoveField { archive_to, .. } = &mut self.kind {
            *archive_to = Some(collection.into());
        }
        self
    }

    /// Keep the old field after a rename
    pub fn preserve_old_field(mut self) -> Self {
        if let OperationKind::RenameField {
            preserve_old_field, ..
        } = &mut self.kind
        {
            *preserve_old_field = true;
        }
        self
    }

    pub fn with_converter(mut self, custom: Arc<dyn FieldConverter>) -> Self {
        if let OperationKind::ChangeFieldType { converter, .. } = &mut self.kind {
            *converter = Some(custom);
        }
        self
    }

    pub fn with_validator(mut self, custom: Arc<dyn DocumentValidator>) -> Self {
        if let OperationKind::TransformData { validator, .. } = &mut self.kind {
            *validator = Some(custom);
        }
        self
    }

    /// Every collection this operation may write to
    pub fn written_collections(&self) -> Vec<String> {
        let mut collections = vec![self.collection.clone()];
        if let OperationKind::RemoveField {
            archive_to: Some(archive),
            ..
        } = &self.kind
        {
            collections.push(archive.clone());
        }
        collections
    }
}
