//! Schema versions, definitions and the version registry
//!
//! A schema definition is immutable once registered. The registry keeps the
//! single authoritative "current version" pointer and only ever moves it
//! forward during registration; rollbacks reassert an older version
//! explicitly and leave a history entry behind.

pub mod definition;
pub mod plan;
pub mod registry;
pub mod validation;
pub mod version;

pub use definition::{
    CollectionSchemaDefinition, CompatibilityBounds, FieldDefinition, FieldType,
    FieldValidation, IndexDefinition, IndexField, IndexOrder, SchemaDefinition, SchemaStatus,
    ValidationRule,
};
pub use plan::{plan_path, MigrationPlan};
pub use registry::{ApplicationKind, RegistrationOutcome, VersionApplication, VersionRegistry};
pub use validation::{
    ensure_valid, is_valid_field_name, validate_schema, validate_upgrade, ValidationIssue,
    ValidationReport,
};
pub use version::SchemaVersion;
