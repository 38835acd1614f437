//! Migration engine
//!
//! Operations are registered per schema version. A run resolves the version
//! path through the registry, orders the operations of each version by
//! dependency and priority, and applies them page by page. Every mutation,
//! real or simulated, passes through a [`crate::store::WriteBatcher`], so a
//! dry run follows the exact code path of a real run up to the commit.

pub mod apply;
pub mod context;
pub mod convert;
pub mod engine;
pub mod operation;
pub mod ordering;
pub mod retry;

pub use apply::{apply_operation, DocumentChange};
pub use context::{
    MigrationContext, MigrationOptions, MigrationResult, MigrationStats, OperationReport,
};
pub use convert::default_conversion;
pub use engine::MigrationEngine;
pub use operation::{
    CustomExecutor, DocumentTransformer, DocumentValidator, FieldConverter, MigrationOperation,
    OperationKind,
};
pub use ordering::{order_operations, OperationGraph};
pub use retry::{BackoffStrategy, RetryExecutor, RetryPolicy};
