//! Process-level setup shared by embedding applications

pub mod logging;

pub use logging::init_logging;
