use std::sync::Arc;

use thiserror::Error;

use flowgate_core::catalog::{StepCatalog, StepTemplate};
use flowgate_core::creation::NewApprovalInstance;
use flowgate_core::domain::instance::ResolutionMode;
use flowgate_db::repositories::{ChainRepository, RepositoryError};

/// How step chains are produced for new instances. A deployment picks one
/// strategy at startup; instances record which one built them.
pub enum ResolverStrategy {
    /// Fixed per-type chains from the injected catalog. Unknown types fall
    /// back to the generic chain, so this strategy never fails.
    Catalog(StepCatalog),
    /// Chains looked up from configured approver assignments by the
    /// requester's org placement, with zone/depot fallback.
    Hierarchy(Arc<dyn ChainRepository>),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no approval chain defined for `{request_type}` (zone: {zone:?}, depot: {depot:?})")]
    DefinitionNotFound { request_type: String, zone: Option<String>, depot: Option<String> },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Debug)]
pub struct ResolvedChain {
    pub templates: Vec<StepTemplate>,
    pub mode: ResolutionMode,
}

pub struct WorkflowDefinitionResolver {
    strategy: ResolverStrategy,
}

impl WorkflowDefinitionResolver {
    pub fn new(strategy: ResolverStrategy) -> Self {
        Self { strategy }
    }

    pub async fn resolve(&self, new: &NewApprovalInstance) -> Result<ResolvedChain, ResolveError> {
        match &self.strategy {
            ResolverStrategy::Catalog(catalog) => Ok(ResolvedChain {
                templates: catalog.resolve(&new.request_type).to_vec(),
                mode: ResolutionMode::Catalog,
            }),
            ResolverStrategy::Hierarchy(chains) => {
                let found = chains
                    .resolve_chain(
                        &new.request_type,
                        new.requester_zone.as_deref(),
                        new.requester_depot.as_deref(),
                    )
                    .await?;
                if found.is_empty() {
                    return Err(ResolveError::DefinitionNotFound {
                        request_type: new.request_type.clone(),
                        zone: new.requester_zone.clone(),
                        depot: new.requester_depot.clone(),
                    });
                }
                Ok(ResolvedChain { templates: renumber(found), mode: ResolutionMode::Hierarchy })
            }
        }
    }
}

/// Configured assignments may carry gaps in their sequence numbers; persisted
/// steps must be contiguous from 1 for the pointer arithmetic to hold.
fn renumber(mut templates: Vec<StepTemplate>) -> Vec<StepTemplate> {
    templates.sort_by_key(|template| template.sequence);
    for (index, template) in templates.iter_mut().enumerate() {
        template.sequence = index as u32 + 1;
    }
    templates
}
