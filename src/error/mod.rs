use std::fmt::Display;
use thiserror::Error;

pub mod codes;


pub use codes::{describe_error_code, ErrorCode};

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SchemaFlowError>;

/// Broad error category, used to decide retry and abort behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Storage,
    Migration,
    Safety,
    Rollback,
    Deployment,
    Other,
}

/// The unified error type for schemaflow
#[derive(Error, Debug)]
pub enum SchemaFlowError {
    #[error("[E{code:04}] Configuration error: {message}")]
    Config {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Validation error: {message}")]
    Validation {
        code: u16,
        message: String,
        issues: Vec<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Storage error: {message}")]
    Storage {
        code: u16,
        message: String,
        retryable: bool,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Migration error: {message}")]
    Migration {
        code: u16,
        message: String,
        operation_id: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Safety error: {message}")]
    Safety {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Rollback error: {message}")]
    Rollback {
        code: u16,
        message: String,
        rollback_id: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Deployment error: {message}")]
    Deployment {
        code: u16,
        message: String,
        phase: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] {message}")]
    Other {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SchemaFlowError {
    /// Create a configuration error with default code
    pub fn config(message: impl Into<String>) -> Self {
        Self::config_with_code(ErrorCode::CONFIG_GENERIC, message)
    }

    /// Create a configuration error with specific code
    pub fn config_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a validation error with default code
    pub fn validation(message: impl Into<String>) -> Self {
        Self::validation_with_issues(ErrorCode::VALIDATION_GENERIC, message, Vec::new())
    }

    /// Create a validation error carrying the individual issues found
    pub fn validation_with_issues(
        code: u16,
        message: impl Into<String>,
        issues: Vec<String>,
    ) -> Self {
        Self::Validation {
            code,
            message: message.into(),
            issues,
            source: None,
        }
    }

    /// Create a storage error with specific code
    pub fn storage_with_code(code: u16, message: impl Into<String>, retryable: bool) -> Self {
        Self::Storage {
            code,
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Create a migration error with default code
    pub fn migration(message: impl Into<String>) -> Self {
        Self::migration_with_code(ErrorCode::MIGRATION_GENERIC, message, None)
    }

    /// Create a migration error tied to an operation
    pub fn migration_with_code(
        code: u16,
        message: impl Into<String>,
        operation_id: Option<String>,
    ) -> Self {
        Self::Migration {
            code,
            message: message.into(),
            operation_id,
            source: None,
        }
    }

    /// Create a safety error with specific code
    pub fn safety(code: u16, message: impl Into<String>) -> Self {
        Self::Safety {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a rollback error with specific code
    pub fn rollback(code: u16, message: impl Into<String>, rollback_id: Option<String>) -> Self {
        Self::Rollback {
            code,
            message: message.into(),
            rollback_id,
            source: None,
        }
    }

    /// Create a deployment error with specific code
    pub fn deployment(code: u16, message: impl Into<String>, phase: Option<String>) -> Self {
        Self::Deployment {
            code,
            message: message.into(),
            phase,
            source: None,
        }
    }

    /// Create a generic other error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            code: ErrorCode::OTHER_GENERIC,
            message: message.into(),
            source: None,
        }
    }

    /// Add a source error to this error
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        match &mut self {
            Self::Config { source: src, .. }
            | Self::Validation { source: src, .. }
            | Self::Storage { source: src, .. }
            | Self::Migration { source: src, .. }
            | Self::Safety { source: src, .. }
            | Self::Rollback { source: src, .. }
            | Self::Deployment { source: src, .. }
            | Self::Other { source: src, .. } => {
                *src = Some(source.into());
            }
        }
        self
    }

    /// Add context to the error message
    pub fn with_context(mut self, context: impl Display) -> Self {
        match &mut self {
            Self::Config { message, .. }
            | Self::Validation { message, .. }
            | Self::Storage { message, .. }
            | Self::Migration { message, .. }
            | Self::Safety { message, .. }
            | Self::Rollback { message, .. }
            | Self::Deployment { message, .. }
            | Self::Other { message, .. } => {
                *message = format!("{}: {}", message, context);
            }
        }
        self
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Config { code, .. }
            | Self::Validation { code, .. }
            | Self::Storage { code, .. }
            | Self::Migration { code, .. }
            | Self::Safety { code, .. }
            | Self::Rollback { code, .. }
            | Self::Deployment { code, .. }
            | Self::Other { code, .. } => *code,
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config { .. } => ErrorCategory::Configuration,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Storage { .. } => ErrorCategory::Storage,
            Self::Migration { .. } => ErrorCategory::Migration,
            Self::Safety { .. } => ErrorCategory::Safety,
            Self::Rollback { .. } => ErrorCategory::Rollback,
            Self::Deployment { .. } => ErrorCategory::Deployment,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }

    /// Transient errors may succeed when the same batch is tried again.
    /// Configuration and validation failures never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { retryable, .. } => *retryable,
            Self::Migration { code, .. } => *code == ErrorCode::MIGRATION_HOOK_FAILED,
            _ => false,
        }
    }

    /// Validation issues attached to this error, if any
    pub fn issues(&self) -> &[String] {
        match self {
            Self::Validation { issues, .. } => issues,
            _ => &[],
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Config { message, .. } => format!("Configuration problem: {}", message),
            Self::Validation {
                message, issues, ..
            } => {
                if issues.is_empty() {
                    format!("Validation failed: {}", message)
                } else {
                    format!("Validation failed: {} ({})", message, issues.join("; "))
                }
            }
            Self::Storage { message, .. } => format!("Storage error: {}", message),
            Self::Migration {
                message,
                operation_id,
                ..
            } => match operation_id {
                Some(op) => format!("Migration operation '{}' failed: {}", op, message),
                None => format!("Migration failed: {}", message),
            },
            Self::Safety { message, .. } => format!("Safety check: {}", message),
            Self::Rollback { message, .. } => format!(
                "Rollback failed, operator intervention required: {}",
                message
            ),
            Self::Deployment { message, phase, .. } => match phase {
                Some(p) => format!("Deployment phase '{}' failed: {}", p, message),
                None => format!("Deployment failed: {}", message),
            },
            Self::Other { message, .. } => message.clone(),
        }
    }
}

impl From<serde_json::Error> for SchemaFlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage_with_code(ErrorCode::STORAGE_SERIALIZATION_ERROR, err.to_string(), false)
            .with_source(err)
    }
}

impl From<anyhow::Error> for SchemaFlowError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            code: ErrorCode::OTHER_GENERIC,
            message: format!("{:#}", err),
            source: None,
        }
    }
}
