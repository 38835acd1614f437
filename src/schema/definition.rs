//! Schema, collection and field definitions supplied by the schema catalogue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::version::SchemaVersion;
use crate::error::{ErrorCode, SchemaFlowError};

/// Lifecycle status of a registered schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchemaStatus {
    #[default]
    Draft,
    Active,
    Deprecated,
    Archived,
}

/// Primitive type tag of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Map,
    Timestamp,
    Geopoint,
    Reference,
    Bytes,
    Null,
}

impl FieldType {
    /// Whether a JSON value is an acceptable representation of this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String | FieldType::Reference | FieldType::Bytes => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Map => value.is_object(),
            FieldType::Timestamp => value.is_string() || value.is_number(),
            FieldType::Geopoint => value
                .as_object()
                .map(|o| o.contains_key("latitude") && o.contains_key("longitude"))
                .unwrap_or(false),
            FieldType::Null => value.is_null(),
        }
    }
}

/// Validation bounds for a single field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldValidation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<Value>>,
}

/// One field of a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<FieldValidation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_in: Option<SchemaVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_in: Option<SchemaVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            validation: None,
            default: None,
            added_in: None,
            removed_in: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_validation(mut self, validation: FieldValidation) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Whether the field is part of the schema at `version`
    pub fn is_live_at(&self, version: &SchemaVersion) -> bool {
        let added = self.added_in.map(|v| v <= *version).unwrap_or(true);
        let removed = self.removed_in.map(|v| v <= *version).unwrap_or(false);
        added && !removed
    }
}

/// Sort direction or mode of an indexed field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexOrder {
    #[default]
    Ascending,
    Descending,
    ArrayContains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexField {
    pub field: String,
    #[serde(default)]
    pub order: IndexOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub fields: Vec<IndexField>,
}

impl IndexDefinition {
    pub fn is_composite(&self) -> bool {
        self.fields.len() > 1
    }
}

/// Collection-level validation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub name: String,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One collection of the application schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchemaDefinition {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
}

impl CollectionSchemaDefinition {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDefinition>) -> Self {
        Self {
            name: name.into(),
            fields,
            indexes: Vec::new(),
            validation_rules: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Required fields that are live at `version`
    pub fn required_fields_at<'a>(
        &'a self,
        version: &'a SchemaVersion,
    ) -> impl Iterator<Item = &'a FieldDefinition> + 'a {
        self.fields
            .iter()
            .filter(move |f| f.required && f.is_live_at(version))
    }
}

/// Range of versions a schema can be reached from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<SchemaVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<SchemaVersion>,
}

impl CompatibilityBounds {
    pub fn admits(&self, running: &SchemaVersion) -> bool {
        self.min_version.map(|min| *running >= min).unwrap_or(true)
            && self.max_version.map(|max| *running <= max).unwrap_or(true)
    }
}

/// An immutable, versioned application schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub id: String,
    pub name: String,
    pub version: SchemaVersion,
    pub collections: Vec<CollectionSchemaDefinition>,
    #[serde(default)]
    pub status: SchemaStatus,
    #[serde(default)]
    pub compatibility: CompatibilityBounds,
    #[serde(default)]
    pub breaking: bool,
    /// Expected wall-clock minutes to migrate onto this version
    #[serde(default)]
    pub estimated_migration_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl SchemaDefinition {
    pub fn new(
        name: impl Into<String>,
        version: SchemaVersion,
        collections: Vec<CollectionSchemaDefinition>,
    ) -> Self {
        let name = name.into();
        Self {
            id: format!("{}@{}", name, version),
            name,
            version,
            collections,
            status: SchemaStatus::Draft,
            compatibility: CompatibilityBounds::default(),
            breaking: false,
            estimated_migration_minutes: 0,
            description: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: SchemaStatus) -> Self {
        self.status = status;
        self
    }

    pub fn breaking(mut self) -> Self {
        self.breaking = true;
        self
    }

    pub fn with_estimated_minutes(mut self, minutes: u32) -> Self {
        self.estimated_migration_minutes = minutes;
        self
    }

    pub fn with_compatibility(mut self, compatibility: CompatibilityBounds) -> Self {
        self.compatibility = compatibility;
        self
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSchemaDefinition> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Load a definition from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self, SchemaFlowError> {
        serde_yaml::from_str(content).map_err(|e| {
            SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_PARSE_ERROR,
                format!("invalid schema definition YAML: {}", e),
            )
        })
    }

    /// Load a definition from JSON text
    pub fn from_json_str(content: &str) -> Result<Self, SchemaFlowError> {
        serde_json::from_str(content).map_err(|e| {
            SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_PARSE_ERROR,
                format!("invalid schema definition JSON: {}", e),
            )
        })
    }
}
