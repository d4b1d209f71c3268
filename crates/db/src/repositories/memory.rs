use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use flowgate_core::catalog::StepTemplate;
use flowgate_core::decision::{apply_decision, DecisionRequest};
use flowgate_core::domain::instance::{ApprovalInstance, InstanceId, InstanceWithSteps};
use flowgate_core::domain::step::StepStatus;

use super::{
    ChainRepository, DecideError, DecisionApplied, DirectoryRepository, DirectoryUser,
    InstanceRepository, ReferenceSyncRepository, RepositoryError,
};

#[derive(Default)]
pub struct InMemoryInstanceRepository {
    instances: RwLock<HashMap<String, InstanceWithSteps>>,
}

#[async_trait::async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn create_with_steps(&self, created: &InstanceWithSteps) -> Result<(), RepositoryError> {
        let mut instances = self.instances.write().await;
        instances.insert(created.instance.id.0.clone(), created.clone());
        Ok(())
    }

    async fn fetch(&self, id: &InstanceId) -> Result<Option<InstanceWithSteps>, RepositoryError> {
        let instances = self.instances.read().await;
        Ok(instances.get(&id.0).cloned())
    }

    async fn decide(
        &self,
        id: &InstanceId,
        request: &DecisionRequest,
    ) -> Result<DecisionApplied, DecideError> {
        let mut instances = self.instances.write().await;
        let stored =
            instances.get_mut(&id.0).ok_or_else(|| DecideError::InstanceNotFound(id.clone()))?;

        let outcome = apply_decision(&stored.instance, &stored.steps, request, Utc::now())?;

        stored.instance = outcome.instance.clone();
        if let Some(step) = stored.steps.iter_mut().find(|s| s.id == outcome.step.id) {
            *step = outcome.step.clone();
        }

        Ok(DecisionApplied { kind: outcome.kind, step: outcome.step, instance: stored.clone() })
    }

    async fn list_pending_for_role(
        &self,
        role: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalInstance>, RepositoryError> {
        let instances = self.instances.read().await;
        let mut matching: Vec<ApprovalInstance> = instances
            .values()
            .filter(|pair| pair.instance.active && pair.instance.is_open())
            .filter(|pair| {
                pair.current_step().is_some_and(|step| {
                    step.status == StepStatus::Pending
                        && step.assignee.role.as_deref() == Some(role)
                })
            })
            .map(|pair| pair.instance.clone())
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn list_pending_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalInstance>, RepositoryError> {
        let instances = self.instances.read().await;
        let mut matching: Vec<ApprovalInstance> = instances
            .values()
            .filter(|pair| pair.instance.active && pair.instance.is_open())
            .filter(|pair| {
                pair.current_step().is_some_and(|step| {
                    step.status == StepStatus::Pending
                        && step.assignee.user.as_deref() == Some(user_id)
                })
            })
            .map(|pair| pair.instance.clone())
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn deactivate(&self, id: &InstanceId) -> Result<bool, RepositoryError> {
        let mut instances = self.instances.write().await;
        match instances.get_mut(&id.0) {
            Some(pair) if pair.instance.active => {
                pair.instance.active = false;
                pair.instance.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Chains keyed by (request_type, zone, depot); `None` components model the
/// wider tiers exactly as the SQL table does.
#[derive(Default)]
pub struct InMemoryChainRepository {
    chains: RwLock<HashMap<(String, Option<String>, Option<String>), Vec<StepTemplate>>>,
}

impl InMemoryChainRepository {
    pub async fn insert(
        &self,
        request_type: &str,
        zone_id: Option<&str>,
        depot_id: Option<&str>,
        chain: Vec<StepTemplate>,
    ) {
        let mut chains = self.chains.write().await;
        chains.insert(
            (request_type.to_string(), zone_id.map(String::from), depot_id.map(String::from)),
            chain,
        );
    }
}

#[async_trait::async_trait]
impl ChainRepository for InMemoryChainRepository {
    async fn resolve_chain(
        &self,
        request_type: &str,
        zone_id: Option<&str>,
        depot_id: Option<&str>,
    ) -> Result<Vec<StepTemplate>, RepositoryError> {
        let chains = self.chains.read().await;
        let lookup = |zone: Option<&str>, depot: Option<&str>| {
            chains
                .get(&(request_type.to_string(), zone.map(String::from), depot.map(String::from)))
                .filter(|chain| !chain.is_empty())
                .cloned()
        };

        if zone_id.is_some() && depot_id.is_some() {
            if let Some(chain) = lookup(zone_id, depot_id) {
                return Ok(chain);
            }
        }
        if zone_id.is_some() {
            if let Some(chain) = lookup(zone_id, None) {
                return Ok(chain);
            }
        }
        if depot_id.is_some() {
            if let Some(chain) = lookup(None, depot_id) {
                return Ok(chain);
            }
        }
        Ok(lookup(None, None).unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryDirectoryRepository {
    users: RwLock<HashMap<String, DirectoryUser>>,
}

impl InMemoryDirectoryRepository {
    pub async fn insert(&self, user: DirectoryUser) {
        let mut users = self.users.write().await;
        users.insert(user.user_id.clone(), user);
    }
}

#[async_trait::async_trait]
impl DirectoryRepository for InMemoryDirectoryRepository {
    async fn active_role_holders(&self, role: &str) -> Result<Vec<DirectoryUser>, RepositoryError> {
        let users = self.users.read().await;
        let mut holders: Vec<DirectoryUser> =
            users.values().filter(|user| user.active && user.role == role).cloned().collect();
        holders.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(holders)
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<DirectoryUser>, RepositoryError> {
        let users = self.users.read().await;
        Ok(users.get(user_id).cloned())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReferenceStamp {
    Approved { approved_by: String },
    Rejected,
}

#[derive(Default)]
pub struct InMemoryReferenceSyncRepository {
    stamps: RwLock<HashMap<String, ReferenceStamp>>,
}

impl InMemoryReferenceSyncRepository {
    pub async fn stamp_for(&self, reference_id: &str) -> Option<ReferenceStamp> {
        let stamps = self.stamps.read().await;
        stamps.get(reference_id).cloned()
    }
}

#[async_trait::async_trait]
impl ReferenceSyncRepository for InMemoryReferenceSyncRepository {
    async fn mark_approved(
        &self,
        reference_id: &str,
        approved_by: &str,
        _approved_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut stamps = self.stamps.write().await;
        stamps.insert(
            reference_id.to_string(),
            ReferenceStamp::Approved { approved_by: approved_by.to_string() },
        );
        Ok(true)
    }

    async fn mark_rejected(&self, reference_id: &str) -> Result<bool, RepositoryError> {
        let mut stamps = self.stamps.write().await;
        stamps.insert(reference_id.to_string(), ReferenceStamp::Rejected);
        Ok(true)
    }
}
