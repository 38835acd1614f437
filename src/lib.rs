//! # SchemaFlow
//!
//! Schema versioning, batched document migrations and safe rollouts for
//! document databases.
//!
//! ## Modules
//!
//! - `schema` - Versioned schema definitions, validation and the version registry
//! - `migration` - Ordered, batched, retryable migration operations
//! - `safety` - Backups, dry-run analysis, live monitoring and rollback
//! - `deploy` - Deployment strategies, safety checks and traffic control
//! - `store` - Document store abstraction and the in-memory backend
//! - `events` - Status events and notification sinks
//! - `config` - TOML configuration with environment overrides
//! - `app` - Logging setup for embedding applications
pub mod app;
pub mod config;
pub mod deploy;
pub mod error;
pub mod events;
pub mod flow;
pub mod migration;
pub mod safety;
pub mod schema;
pub mod store;

pub use error::{Result, SchemaFlowError};
pub use flow::SchemaFlow;

#[cfg(test)]
mod property_tests;
