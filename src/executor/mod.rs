pub mod validator;
pub mod risk;
pub mod simulator;
pub mod runner;
pub mod sandbox;
pub mod planner;
pub mod rollback;
pub mod orchestrator;

// Re-exports for convenience (used in main.rs and ui module)
pub use orchestrator::{
    CancelHandle, ConfirmationAnswer, ConfirmationHandler, ConfirmationRequest, FailureContext,
    FailureDecision, PlanEvent, PlanOrchestrator, PlanReport, StepCheck, StepReport,
};
pub use planner::{Plan, PlanState, Step, StepId, StepState};
pub use risk::{RiskAssessment, RiskAssessor, RiskLevel};
pub use sandbox::{ExecutionResult, ExecutionStatus, SandboxExecutor};
pub use validator::{CommandValidator, ValidationResult};
