//! Structural validation of schema definitions
//!
//! Everything here is pure: no storage access, no registration. Callers can
//! validate a definition before deciding to register it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::definition::{CollectionSchemaDefinition, FieldType, SchemaDefinition};
use super::version::SchemaVersion;
use crate::error::{ErrorCode, SchemaFlowError};

pub const MAX_SCHEMA_NAME_LEN: usize = 128;
pub const MAX_COLLECTION_NAME_LEN: usize = 64;

static FIELD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("field name pattern compiles"));

/// A single finding, located by a dotted path into the definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Outcome of validating a definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warning(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            path: path.into(),
            message: message.into(),
        });
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Turn a failing report into a validation error
    pub fn into_result(self, code: u16) -> Result<Vec<ValidationIssue>, SchemaFlowError> {
        if self.is_valid() {
            return Ok(self.warnings);
        }
        let issues: Vec<String> = self.errors.iter().map(|i| i.to_string()).collect();
        Err(SchemaFlowError::validation_with_issues(
            code,
            format!("{} problem(s) found", issues.len()),
            issues,
        ))
    }
}

/// Check that a field name is usable as a document key
pub fn is_valid_field_name(name: &str) -> bool {
    FIELD_NAME.is_match(name)
}

/// Validate the structure of a schema definition
pub fn validate_schema(def: &SchemaDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();

    let name_len = def.name.chars().count();
    if name_len == 0 || name_len > MAX_SCHEMA_NAME_LEN {
        report.error(
            "name",
            format!(
                "schema name must be 1-{} characters, got {}",
                MAX_SCHEMA_NAME_LEN, name_len
            ),
        );
    }
    if def.id.trim().is_empty() {
        report.error("id", "schema id must not be empty");
    }

    if def.collections.is_empty() {
        report.error("collections", "schema must define at least one collection");
    }

    if let (Some(min), Some(max)) = (
        def.compatibility.min_version,
        def.compatibility.max_version,
    ) {
        if min > max {
            report.error(
                "compatibility",
                format!("minimum version {} is above maximum {}", min, max),
            );
        }
    }

    let mut seen = HashSet::new();
    for (index, collection) in def.collections.iter().enumerate() {
        let path = format!("collections[{}]", index);
        if !seen.insert(collection.name.as_str()) {
            report.error(
                &path,
                format!("duplicate collection name '{}'", collection.name),
            );
        }
        report.merge(validate_collection(&path, collection, &def.version));
    }

    report
}

fn validate_collection(
    path: &str,
    collection: &CollectionSchemaDefinition,
    version: &SchemaVersion,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    let len = collection.name.chars().count();
    if len == 0 || len > MAX_COLLECTION_NAME_LEN {
        report.error(
            format!("{}.name", path),
            format!(
                "collection name must be 1-{} characters",
                MAX_COLLECTION_NAME_LEN
            ),
        );
    }
    if collection.name.contains('/') {
        report.error(
            format!("{}.name", path),
            format!("collection name '{}' must not contain '/'", collection.name),
        );
    }
    if collection.name.starts_with('_') {
        report.error(
            format!("{}.name", path),
            format!(
                "collection name '{}' is reserved for internal bookkeeping",
                collection.name
            ),
        );
    }

    let mut field_names = HashSet::new();
    for (index, field) in collection.fields.iter().enumerate() {
        let field_path = format!("{}.fields[{}]", path, index);

        if !is_valid_field_name(&field.name) {
            report.error(
                &field_path,
                format!(
                    "field name '{}' must match [A-Za-z][A-Za-z0-9_]*",
                    field.name
                ),
            );
        }
        if !field_names.insert(field.name.as_str()) {
            report.error(&field_path, format!("duplicate field name '{}'", field.name));
        }

        if let Some(validation) = &field.validation {
            if let Some(pattern) = &validation.pattern {
                if let Err(e) = Regex::new(pattern) {
                    report.error(
                        format!("{}.validation.pattern", field_path),
                        format!("invalid pattern '{}': {}", pattern, e),
                    );
                }
            }
            if let (Some(min), Some(max)) = (validation.min, validation.max) {
                if min > max {
                    report.error(
                        format!("{}.validation", field_path),
                        format!("min {} is greater than max {}", min, max),
                    );
                }
            }
            if let (Some(min), Some(max)) = (validation.min_length, validation.max_length) {
                if min > max {
                    report.error(
                        format!("{}.validation", field_path),
                        format!("min_length {} is greater than max_length {}", min, max),
                    );
                }
            }
        }

        if let (Some(added), Some(removed)) = (field.added_in, field.removed_in) {
            if removed <= added {
                report.warning(
                    &field_path,
                    format!(
                        "field '{}' is removed in {} but only added in {}",
                        field.name, removed, added
                    ),
                );
            }
        }
        if field.required && field.removed_in.is_some_and(|removed| removed <= *version) {
            report.warning(
                &field_path,
                format!("required field '{}' is already removed", field.name),
            );
        }
    }

    for (index, index_def) in collection.indexes.iter().enumerate() {
        let index_path = format!("{}.indexes[{}]", path, index);
        if index_def.fields.is_empty() {
            report.error(&index_path, "index must reference at least one field");
        }

        let mut array_fields = 0;
        for index_field in &index_def.fields {
            match collection.field(&index_field.field) {
                None => report.error(
                    &index_path,
                    format!("index references unknown field '{}'", index_field.field),
                ),
                Some(field) if field.field_type == FieldType::Array => array_fields += 1,
                Some(_) => {}
            }
        }
        if index_def.is_composite() && array_fields > 1 {
            report.error(
                &index_path,
                format!(
                    "composite index contains {} array fields, at most one is allowed",
                    array_fields
                ),
            );
        }
    }

    report
}

/// Check a definition against the version currently in force
pub fn validate_upgrade(current: Option<&SchemaVersion>, def: &SchemaDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();
    if let Some(current) = current {
        if def.version.is_major_bump_over(current) && !def.breaking {
            report.error(
                "breaking",
                format!(
                    "major version bump {} -> {} must be flagged as breaking",
                    current, def.version
                ),
            );
        }
    }
    report
}

/// Convenience wrapper that fails with a validation error
pub fn ensure_valid(def: &SchemaDefinition) -> Result<Vec<ValidationIssue>, SchemaFlowError> {
    validate_schema(def).into_result(ErrorCode::VALIDATION_SCHEMA_STRUCTURE)
}
