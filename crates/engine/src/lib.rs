pub mod bootstrap;
pub mod hooks;
pub mod resolver;
pub mod service;

pub use bootstrap::build_engine;
pub use hooks::{
    NextApproverHook, PostCommitEvent, PostCommitHook, ReferenceSyncHook, RequesterOutcomeHook,
};
pub use resolver::{ResolveError, ResolvedChain, ResolverStrategy, WorkflowDefinitionResolver};
pub use service::{ApprovalEngine, EngineError};
