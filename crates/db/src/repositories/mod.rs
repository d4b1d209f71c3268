use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use flowgate_core::catalog::StepTemplate;
use flowgate_core::decision::{DecisionError, DecisionOutcomeKind, DecisionRequest};
use flowgate_core::domain::instance::{ApprovalInstance, InstanceId, InstanceWithSteps};
use flowgate_core::domain::step::Step;

pub mod chain;
pub mod directory;
pub mod instance;
pub mod memory;
pub mod reference;

pub use chain::SqlChainRepository;
pub use directory::SqlDirectoryRepository;
pub use instance::SqlInstanceRepository;
pub use memory::{
    InMemoryChainRepository, InMemoryDirectoryRepository, InMemoryInstanceRepository,
    InMemoryReferenceSyncRepository,
};
pub use reference::SqlReferenceSyncRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Failures from the combined load/apply/persist decision path.
#[derive(Debug, Error)]
pub enum DecideError {
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error("approval instance {0} not found")]
    InstanceNotFound(InstanceId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<sqlx::Error> for DecideError {
    fn from(error: sqlx::Error) -> Self {
        Self::Repository(RepositoryError::Database(error))
    }
}

/// A committed decision: the step that was decided, the resulting outcome
/// kind, and the instance as re-read after commit.
#[derive(Clone, Debug)]
pub struct DecisionApplied {
    pub kind: DecisionOutcomeKind,
    pub step: Step,
    pub instance: InstanceWithSteps,
}

/// A user as known to the org directory. Placement (zone/depot) feeds the
/// hierarchy resolver; role feeds notification fan-out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryUser {
    pub user_id: String,
    pub display_name: String,
    pub role: String,
    pub zone_id: Option<String>,
    pub depot_id: Option<String>,
    pub active: bool,
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Persist a freshly assembled instance and all of its steps in one
    /// transaction. Partial creation is never observable.
    async fn create_with_steps(&self, created: &InstanceWithSteps) -> Result<(), RepositoryError>;

    async fn fetch(&self, id: &InstanceId) -> Result<Option<InstanceWithSteps>, RepositoryError>;

    /// Load, apply the decision, and persist atomically. The pending-status
    /// guard on the step update makes concurrent decisions on the same step
    /// resolve to exactly one winner.
    async fn decide(
        &self,
        id: &InstanceId,
        request: &DecisionRequest,
    ) -> Result<DecisionApplied, DecideError>;

    async fn list_pending_for_role(
        &self,
        role: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalInstance>, RepositoryError>;

    async fn list_pending_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalInstance>, RepositoryError>;

    /// Soft-delete. Returns false when the instance does not exist or was
    /// already inactive.
    async fn deactivate(&self, id: &InstanceId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ChainRepository: Send + Sync {
    /// Look up the configured approver chain for a request type at the given
    /// org placement. Tries zone+depot, then zone, then depot, then the
    /// global default; returns the first non-empty tier, ordered by sequence.
    async fn resolve_chain(
        &self,
        request_type: &str,
        zone_id: Option<&str>,
        depot_id: Option<&str>,
    ) -> Result<Vec<StepTemplate>, RepositoryError>;
}

#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    async fn active_role_holders(&self, role: &str) -> Result<Vec<DirectoryUser>, RepositoryError>;

    async fn find_user(&self, user_id: &str) -> Result<Option<DirectoryUser>, RepositoryError>;
}

#[async_trait]
pub trait ReferenceSyncRepository: Send + Sync {
    /// Stamp the originating business record as approved. Returns false when
    /// no record matches the reference id.
    async fn mark_approved(
        &self,
        reference_id: &str,
        approved_by: &str,
        approved_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn mark_rejected(&self, reference_id: &str) -> Result<bool, RepositoryError>;
}
