pub mod catalog;
pub mod config;
pub mod creation;
pub mod decision;
pub mod domain;

pub use catalog::{StepCatalog, StepTemplate};
pub use creation::{assemble_instance, NewApprovalInstance, ValidationError};
pub use decision::{
    apply_decision, DecisionAction, DecisionError, DecisionOutcome, DecisionOutcomeKind,
    DecisionRequest,
};
pub use domain::instance::{
    ApprovalInstance, InstanceId, InstanceStatus, InstanceWithSteps, Priority, ResolutionMode,
};
pub use domain::step::{Assignee, Step, StepId, StepStatus};
