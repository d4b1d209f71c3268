use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use flowgate_core::creation::{assemble_instance, NewApprovalInstance, ValidationError};
use flowgate_core::decision::{DecisionOutcomeKind, DecisionRequest};
use flowgate_core::domain::instance::{ApprovalInstance, InstanceId, InstanceWithSteps};
use flowgate_db::repositories::{
    DecideError, DecisionApplied, InstanceRepository, RepositoryError,
};

use crate::hooks::{PostCommitEvent, PostCommitHook};
use crate::resolver::{ResolveError, WorkflowDefinitionResolver};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Decide(#[from] DecideError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Front door for the approval workflow: resolves chains, persists instances
/// and decisions, then runs post-commit hooks. Hook failures are logged and
/// swallowed; the committed state is already final by the time they run.
pub struct ApprovalEngine {
    resolver: WorkflowDefinitionResolver,
    instances: Arc<dyn InstanceRepository>,
    hooks: Vec<Arc<dyn PostCommitHook>>,
}

impl ApprovalEngine {
    pub fn new(resolver: WorkflowDefinitionResolver, instances: Arc<dyn InstanceRepository>) -> Self {
        Self { resolver, instances, hooks: Vec::new() }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostCommitHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Resolve the chain, assemble, and persist instance plus steps in one
    /// transaction. Nothing is written when resolution or validation fails.
    pub async fn create(&self, new: NewApprovalInstance) -> Result<InstanceWithSteps, EngineError> {
        let resolved = self.resolver.resolve(&new).await?;
        let created = assemble_instance(&new, &resolved.templates, resolved.mode, Utc::now())?;
        self.instances.create_with_steps(&created).await?;

        info!(
            event_name = "approval_instance_created",
            instance_id = %created.instance.id,
            request_type = %created.instance.request_type,
            resolution = created.instance.resolution.as_str(),
            total_steps = created.instance.total_steps,
            current_step = created.instance.current_step,
            "approval instance created"
        );

        self.run_hooks(&PostCommitEvent::Created { instance: created.clone() }).await;
        Ok(created)
    }

    pub async fn decide(
        &self,
        id: &InstanceId,
        request: &DecisionRequest,
    ) -> Result<DecisionApplied, EngineError> {
        let applied = self.instances.decide(id, request).await?;

        info!(
            event_name = "approval_decision_applied",
            instance_id = %id,
            step_id = %applied.step.id,
            actor = %request.actor,
            outcome = ?applied.kind,
            "decision committed"
        );

        let event = match applied.kind {
            DecisionOutcomeKind::Advanced { .. } => PostCommitEvent::StepApproved {
                instance: applied.instance.clone(),
                step: applied.step.clone(),
            },
            DecisionOutcomeKind::FullyApproved => PostCommitEvent::FinalApproved {
                instance: applied.instance.clone(),
                step: applied.step.clone(),
            },
            DecisionOutcomeKind::Rejected => PostCommitEvent::Rejected {
                instance: applied.instance.clone(),
                step: applied.step.clone(),
            },
        };
        self.run_hooks(&event).await;
        Ok(applied)
    }

    pub async fn instance(
        &self,
        id: &InstanceId,
    ) -> Result<Option<InstanceWithSteps>, EngineError> {
        Ok(self.instances.fetch(id).await?)
    }

    pub async fn pending_for_role(
        &self,
        role: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalInstance>, EngineError> {
        Ok(self.instances.list_pending_for_role(role, limit).await?)
    }

    pub async fn pending_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalInstance>, EngineError> {
        Ok(self.instances.list_pending_for_user(user_id, limit).await?)
    }

    pub async fn deactivate(&self, id: &InstanceId) -> Result<bool, EngineError> {
        Ok(self.instances.deactivate(id).await?)
    }

    async fn run_hooks(&self, event: &PostCommitEvent) {
        for hook in &self.hooks {
            if let Err(error) = hook.handle(event).await {
                warn!(
                    event_name = "post_commit_hook_failed",
                    hook = hook.name(),
                    instance_id = %event.instance().instance.id,
                    error = %error,
                    "post-commit hook failed; committed state is unaffected"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use flowgate_core::catalog::{StepCatalog, StepTemplate};
    use flowgate_core::creation::{NewApprovalInstance, ValidationError};
    use flowgate_core::decision::{DecisionOutcomeKind, DecisionRequest};
    use flowgate_core::domain::instance::{InstanceStatus, Priority};
    use flowgate_core::domain::step::Assignee;
    use flowgate_db::repositories::memory::ReferenceStamp;
    use flowgate_db::repositories::{
        DirectoryUser, InMemoryChainRepository, InMemoryDirectoryRepository,
        InMemoryInstanceRepository, InMemoryReferenceSyncRepository,
    };
    use flowgate_notify::{
        EmailTemplateRenderer, InMemoryEmailSender, InMemoryNotificationDispatcher,
    };

    use crate::hooks::{NextApproverHook, ReferenceSyncHook, RequesterOutcomeHook};
    use crate::resolver::{ResolveError, ResolverStrategy, WorkflowDefinitionResolver};

    use super::{ApprovalEngine, EngineError};

    fn new_order(reference_id: &str) -> NewApprovalInstance {
        NewApprovalInstance {
            request_type: "order".to_string(),
            reference_type: "order".to_string(),
            reference_id: reference_id.to_string(),
            reference_number: Some(format!("SO-{reference_id}")),
            requester_id: "u-rep".to_string(),
            requester_zone: Some("zone-north".to_string()),
            requester_depot: Some("depot-01".to_string()),
            priority: Priority::Medium,
            payload: serde_json::json!({"total": 480.0}),
        }
    }

    fn user(user_id: &str, role: &str) -> DirectoryUser {
        DirectoryUser {
            user_id: user_id.to_string(),
            display_name: format!("User {user_id}"),
            role: role.to_string(),
            zone_id: None,
            depot_id: None,
            active: true,
        }
    }

    struct Harness {
        engine: ApprovalEngine,
        dispatcher: Arc<InMemoryNotificationDispatcher>,
        references: Arc<InMemoryReferenceSyncRepository>,
    }

    fn catalog_harness() -> Harness {
        let directory = Arc::new(InMemoryDirectoryRepository::default());
        let dispatcher = Arc::new(InMemoryNotificationDispatcher::default());
        let references = Arc::new(InMemoryReferenceSyncRepository::default());
        let instances = Arc::new(InMemoryInstanceRepository::default());

        let resolver =
            WorkflowDefinitionResolver::new(ResolverStrategy::Catalog(StepCatalog::default()));
        let engine = ApprovalEngine::new(resolver, instances)
            .with_hook(Arc::new(NextApproverHook::new(directory.clone(), dispatcher.clone())))
            .with_hook(Arc::new(RequesterOutcomeHook::new(directory, dispatcher.clone())))
            .with_hook(Arc::new(ReferenceSyncHook::new(references.clone())));

        Harness { engine, dispatcher, references }
    }

    async fn seeded_harness() -> Harness {
        let directory = Arc::new(InMemoryDirectoryRepository::default());
        directory.insert(user("u-mgr", "sales_manager")).await;
        directory.insert(user("u-fin", "finance_manager")).await;
        directory.insert(user("u-dir", "sales_director")).await;
        directory.insert(user("u-rep", "salesperson")).await;

        let dispatcher = Arc::new(InMemoryNotificationDispatcher::default());
        let references = Arc::new(InMemoryReferenceSyncRepository::default());
        let instances = Arc::new(InMemoryInstanceRepository::default());
        let resolver =
            WorkflowDefinitionResolver::new(ResolverStrategy::Catalog(StepCatalog::default()));
        let engine = ApprovalEngine::new(resolver, instances)
            .with_hook(Arc::new(NextApproverHook::new(directory.clone(), dispatcher.clone())))
            .with_hook(Arc::new(RequesterOutcomeHook::new(directory, dispatcher.clone())))
            .with_hook(Arc::new(ReferenceSyncHook::new(references.clone())));

        Harness { engine, dispatcher, references }
    }

    #[tokio::test]
    async fn order_walks_the_full_chain_with_side_effects() {
        let harness = seeded_harness().await;

        let created = harness.engine.create(new_order("ord-1")).await.expect("create");
        assert_eq!(created.instance.current_step, 2, "submission is auto-completed");

        // Creation notifies the sales manager at step 2.
        let after_create = harness.dispatcher.sent().await;
        assert_eq!(after_create.len(), 1);
        assert_eq!(after_create[0].user_id, "u-mgr");

        let id = created.instance.id.clone();
        harness
            .engine
            .decide(&id, &DecisionRequest::approve("u-mgr"))
            .await
            .expect("sales review");
        harness
            .engine
            .decide(&id, &DecisionRequest::approve("u-fin"))
            .await
            .expect("finance review");
        let applied = harness
            .engine
            .decide(&id, &DecisionRequest::approve("u-dir"))
            .await
            .expect("final approval");

        assert_eq!(applied.kind, DecisionOutcomeKind::FullyApproved);
        assert_eq!(applied.instance.instance.status, InstanceStatus::Approved);

        // step 2 -> notify u-fin, step 3 -> notify u-dir, final -> notify requester.
        let sent = harness.dispatcher.sent().await;
        assert_eq!(sent.len(), 4);
        assert_eq!(sent.last().expect("outcome").user_id, "u-rep");
        assert_eq!(sent.last().expect("outcome").category, "approval_outcome");

        assert_eq!(
            harness.references.stamp_for("ord-1").await,
            Some(ReferenceStamp::Approved { approved_by: "u-dir".to_string() })
        );
    }

    #[tokio::test]
    async fn rejection_notifies_requester_and_stamps_reference() {
        let harness = seeded_harness().await;
        let created = harness.engine.create(new_order("ord-2")).await.expect("create");
        let id = created.instance.id.clone();

        harness
            .engine
            .decide(&id, &DecisionRequest::reject("u-mgr", "credit hold"))
            .await
            .expect("reject");

        let sent = harness.dispatcher.sent().await;
        let outcome = sent.last().expect("outcome notification");
        assert_eq!(outcome.user_id, "u-rep");
        assert!(outcome.message.contains("credit hold"));

        assert_eq!(harness.references.stamp_for("ord-2").await, Some(ReferenceStamp::Rejected));
    }

    #[tokio::test]
    async fn hierarchy_resolution_failure_persists_nothing() {
        let chains = Arc::new(InMemoryChainRepository::default());
        let instances = Arc::new(InMemoryInstanceRepository::default());
        let resolver = WorkflowDefinitionResolver::new(ResolverStrategy::Hierarchy(chains));
        let engine = ApprovalEngine::new(resolver, instances.clone());

        let error = engine.create(new_order("ord-3")).await.expect_err("nothing configured");
        assert!(matches!(error, EngineError::Resolve(ResolveError::DefinitionNotFound { .. })));

        let pending = engine.pending_for_role("sales_manager", 10).await.expect("list");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn hierarchy_chain_feeds_created_instances() {
        let chains = Arc::new(InMemoryChainRepository::default());
        chains
            .insert(
                "order",
                None,
                None,
                vec![
                    StepTemplate::required(1, "Review", Assignee::role("manager")),
                    StepTemplate::required(2, "Final", Assignee::user("u-dir")),
                ],
            )
            .await;
        let instances = Arc::new(InMemoryInstanceRepository::default());
        let resolver = WorkflowDefinitionResolver::new(ResolverStrategy::Hierarchy(chains));
        let engine = ApprovalEngine::new(resolver, instances);

        let created = engine.create(new_order("ord-4")).await.expect("create");
        assert_eq!(created.instance.total_steps, 2);
        assert_eq!(created.instance.current_step, 1, "hierarchy chains have no submission step");
        assert_eq!(created.steps[1].assignee.user.as_deref(), Some("u-dir"));
    }

    #[tokio::test]
    async fn enabled_email_rides_along_with_approver_notifications() {
        let directory = Arc::new(InMemoryDirectoryRepository::default());
        directory.insert(user("u-mgr", "sales_manager")).await;
        directory.insert(user("u-fin", "finance_manager")).await;
        let dispatcher = Arc::new(InMemoryNotificationDispatcher::default());
        let emails = Arc::new(InMemoryEmailSender::default());
        let instances = Arc::new(InMemoryInstanceRepository::default());
        let resolver =
            WorkflowDefinitionResolver::new(ResolverStrategy::Catalog(StepCatalog::default()));
        let renderer = EmailTemplateRenderer::new().expect("templates compile");
        let engine = ApprovalEngine::new(resolver, instances).with_hook(Arc::new(
            NextApproverHook::new(directory, dispatcher).with_email(renderer, emails.clone()),
        ));

        let created = engine.create(new_order("ord-9")).await.expect("create");
        engine
            .decide(&created.instance.id, &DecisionRequest::approve("u-mgr"))
            .await
            .expect("advance");

        let sent = emails.sent().await;
        assert_eq!(sent.len(), 2, "creation and the advance each mail the next approver");
        let (to, email) = &sent[1];
        assert_eq!(to, "u-fin");
        assert!(email.subject.contains("SO-ord-9"));
        assert!(email.body.contains("Finance Review"));
    }

    #[tokio::test]
    async fn failing_hook_does_not_fail_the_decision() {
        let directory = Arc::new(InMemoryDirectoryRepository::default());
        directory.insert(user("u-mgr", "sales_manager")).await;
        let dispatcher = Arc::new(InMemoryNotificationDispatcher::failing());
        let instances = Arc::new(InMemoryInstanceRepository::default());
        let resolver =
            WorkflowDefinitionResolver::new(ResolverStrategy::Catalog(StepCatalog::default()));
        let engine = ApprovalEngine::new(resolver, instances)
            .with_hook(Arc::new(NextApproverHook::new(directory, dispatcher.clone())));

        let created = engine.create(new_order("ord-5")).await.expect("create despite hook failure");
        let applied = engine
            .decide(&created.instance.id, &DecisionRequest::approve("u-mgr"))
            .await
            .expect("decide despite hook failure");
        assert_eq!(applied.kind, DecisionOutcomeKind::Advanced { next_sequence: 3 });
        assert!(dispatcher.sent().await.is_empty());
    }

    #[tokio::test]
    async fn validation_failures_surface_before_any_write() {
        let harness = seeded_harness().await;
        let mut new = new_order("ord-6");
        new.requester_id = String::new();

        let error = harness.engine.create(new).await.expect_err("missing requester");
        assert!(matches!(
            error,
            EngineError::Validation(ValidationError::MissingField { field: "requester_id" })
        ));
        assert!(harness.dispatcher.sent().await.is_empty());
    }

    #[tokio::test]
    async fn deactivated_instances_drop_out_of_queues() {
        let harness = seeded_harness().await;
        let created = harness.engine.create(new_order("ord-7")).await.expect("create");

        assert_eq!(harness.engine.pending_for_role("sales_manager", 10).await.expect("list").len(), 1);
        assert!(harness.engine.deactivate(&created.instance.id).await.expect("deactivate"));
        assert!(harness.engine.pending_for_role("sales_manager", 10).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn empty_directory_means_no_notifications_not_failures() {
        let harness = catalog_harness();
        harness.engine.create(new_order("ord-8")).await.expect("create");
        assert!(harness.dispatcher.sent().await.is_empty());
    }
}
