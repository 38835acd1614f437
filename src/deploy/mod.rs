//! Deployment orchestration: strategies, safety checks and traffic control

pub mod checks;
pub mod config;
pub mod orchestrator;
pub mod traffic;

pub use checks::{
    run_checks, CheckContext, CheckOutcome, CheckSeverity, DataIntegrityCheck,
    PerformanceBaselineCheck, SafetyCheck, SchemaValidationCheck, StoreConnectivityCheck,
};
pub use config::{
    BlueGreenParams, CanaryParams, DeploymentConfig, DeploymentStrategy, Environment,
    RollbackStrategy, RollingParams, ScheduledParams,
};
pub use orchestrator::{
    DeploymentOrchestrator, DeploymentPhase, DeploymentResult, DeploymentStatus, PhaseStatus,
    RollbackInfo,
};
pub use traffic::{SimulatedTrafficController, TrafficAction, TrafficController, TrafficTarget};
