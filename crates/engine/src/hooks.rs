use std::sync::Arc;

use anyhow::Context as _;
use tracing::info;

use flowgate_core::domain::instance::InstanceWithSteps;
use flowgate_core::domain::step::Step;
use flowgate_db::repositories::{DirectoryRepository, DirectoryUser, ReferenceSyncRepository};
use flowgate_notify::{EmailSender, EmailTemplateRenderer, Notification, NotificationDispatcher};

/// What just committed. Hooks observe these after the transaction; they can
/// fail without affecting the committed state.
#[derive(Clone, Debug)]
pub enum PostCommitEvent {
    Created { instance: InstanceWithSteps },
    StepApproved { instance: InstanceWithSteps, step: Step },
    FinalApproved { instance: InstanceWithSteps, step: Step },
    Rejected { instance: InstanceWithSteps, step: Step },
}

impl PostCommitEvent {
    pub fn instance(&self) -> &InstanceWithSteps {
        match self {
            Self::Created { instance }
            | Self::StepApproved { instance, .. }
            | Self::FinalApproved { instance, .. }
            | Self::Rejected { instance, .. } => instance,
        }
    }
}

#[async_trait::async_trait]
pub trait PostCommitHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &PostCommitEvent) -> anyhow::Result<()>;
}

fn reference_label(instance: &InstanceWithSteps) -> String {
    instance
        .instance
        .reference_number
        .clone()
        .unwrap_or_else(|| instance.instance.reference_id.clone())
}

/// Notifies whoever is assigned to the newly current step, whenever the chain
/// gains a new pending head (creation or a non-final approval).
pub struct NextApproverHook {
    directory: Arc<dyn DirectoryRepository>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    email: Option<(EmailTemplateRenderer, Arc<dyn EmailSender>)>,
}

impl NextApproverHook {
    pub fn new(
        directory: Arc<dyn DirectoryRepository>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self { directory, dispatcher, email: None }
    }

    pub fn with_email(
        mut self,
        renderer: EmailTemplateRenderer,
        sender: Arc<dyn EmailSender>,
    ) -> Self {
        self.email = Some((renderer, sender));
        self
    }

    async fn recipients(&self, step: &Step) -> anyhow::Result<Vec<DirectoryUser>> {
        if let Some(user_id) = step.assignee.user.as_deref() {
            if let Some(user) =
                self.directory.find_user(user_id).await.context("directory lookup")?
            {
                return Ok(vec![user]);
            }
            return Ok(Vec::new());
        }
        if let Some(role) = step.assignee.role.as_deref() {
            return self.directory.active_role_holders(role).await.context("role holder lookup");
        }
        Ok(Vec::new())
    }

    async fn notify_step(&self, pair: &InstanceWithSteps, step: &Step) -> anyhow::Result<()> {
        let reference = reference_label(pair);
        let requester = self
            .directory
            .find_user(&pair.instance.requester_id)
            .await
            .context("requester lookup")?;
        let requester_name = requester
            .map(|user| user.display_name)
            .unwrap_or_else(|| pair.instance.requester_id.clone());

        for recipient in self.recipients(step).await? {
            let notification = Notification::new(
                &recipient.user_id,
                "approval_requested",
                format!("Approval needed: {reference}"),
                format!("\"{}\" is waiting on your decision.", step.name),
            )
            .with_priority(pair.instance.priority)
            .with_action_url(format!("/approvals/{}", pair.instance.id))
            .with_data(serde_json::json!({
                "instance_id": pair.instance.id.0,
                "step_id": step.id.0,
                "sequence": step.sequence,
            }));
            self.dispatcher.dispatch(notification).await.context("dispatch notification")?;

            if let Some((renderer, sender)) = &self.email {
                let email = renderer.render_request(
                    &recipient.display_name,
                    &requester_name,
                    &reference,
                    &pair.instance.request_type,
                    &step.name,
                    pair.instance.priority.as_str(),
                    None,
                )?;
                sender.send(&recipient.user_id, &email).await.context("send email")?;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PostCommitHook for NextApproverHook {
    fn name(&self) -> &'static str {
        "next_approver"
    }

    async fn handle(&self, event: &PostCommitEvent) -> anyhow::Result<()> {
        match event {
            PostCommitEvent::Created { instance }
            | PostCommitEvent::StepApproved { instance, .. } => {
                let Some(step) = instance.current_step() else { return Ok(()) };
                if !step.is_pending() {
                    return Ok(());
                }
                self.notify_step(instance, step).await
            }
            PostCommitEvent::FinalApproved { .. } | PostCommitEvent::Rejected { .. } => Ok(()),
        }
    }
}

/// Tells the requester how their request ended.
pub struct RequesterOutcomeHook {
    directory: Arc<dyn DirectoryRepository>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    email: Option<(EmailTemplateRenderer, Arc<dyn EmailSender>)>,
}

impl RequesterOutcomeHook {
    pub fn new(
        directory: Arc<dyn DirectoryRepository>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self { directory, dispatcher, email: None }
    }

    pub fn with_email(
        mut self,
        renderer: EmailTemplateRenderer,
        sender: Arc<dyn EmailSender>,
    ) -> Self {
        self.email = Some((renderer, sender));
        self
    }

    async fn notify_outcome(
        &self,
        pair: &InstanceWithSteps,
        outcome: &str,
        decided_by: &str,
        reason: Option<&str>,
    ) -> anyhow::Result<()> {
        let reference = reference_label(pair);
        let requester_id = &pair.instance.requester_id;
        let message = match reason {
            Some(reason) => format!("{reference} was {outcome} by {decided_by}: {reason}"),
            None => format!("{reference} was {outcome} by {decided_by}."),
        };

        let notification = Notification::new(
            requester_id,
            "approval_outcome",
            format!("{reference} {outcome}"),
            message,
        )
        .with_priority(pair.instance.priority)
        .with_action_url(format!("/approvals/{}", pair.instance.id))
        .with_data(serde_json::json!({
            "instance_id": pair.instance.id.0,
            "outcome": outcome,
        }));
        self.dispatcher.dispatch(notification).await.context("dispatch notification")?;

        if let Some((renderer, sender)) = &self.email {
            let requester = self
                .directory
                .find_user(requester_id)
                .await
                .context("requester lookup")?;
            let recipient_name =
                requester.map(|user| user.display_name).unwrap_or_else(|| requester_id.clone());
            let email = renderer.render_outcome(
                &recipient_name,
                &reference,
                &pair.instance.request_type,
                outcome,
                decided_by,
                reason,
            )?;
            sender.send(requester_id, &email).await.context("send email")?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PostCommitHook for RequesterOutcomeHook {
    fn name(&self) -> &'static str {
        "requester_outcome"
    }

    async fn handle(&self, event: &PostCommitEvent) -> anyhow::Result<()> {
        match event {
            PostCommitEvent::FinalApproved { instance, step } => {
                let decided_by = step.decided_by.as_deref().unwrap_or("unknown");
                self.notify_outcome(instance, "approved", decided_by, None).await
            }
            PostCommitEvent::Rejected { instance, step } => {
                let decided_by = step.decided_by.as_deref().unwrap_or("unknown");
                self.notify_outcome(
                    instance,
                    "rejected",
                    decided_by,
                    instance.instance.rejection_reason.as_deref(),
                )
                .await
            }
            PostCommitEvent::Created { .. } | PostCommitEvent::StepApproved { .. } => Ok(()),
        }
    }
}

/// Stamps the final outcome onto the originating business record. Only order
/// references carry the denormalized approval columns today.
pub struct ReferenceSyncHook {
    references: Arc<dyn ReferenceSyncRepository>,
}

impl ReferenceSyncHook {
    pub fn new(references: Arc<dyn ReferenceSyncRepository>) -> Self {
        Self { references }
    }
}

#[async_trait::async_trait]
impl PostCommitHook for ReferenceSyncHook {
    fn name(&self) -> &'static str {
        "reference_sync"
    }

    async fn handle(&self, event: &PostCommitEvent) -> anyhow::Result<()> {
        if event.instance().instance.reference_type != "order" {
            return Ok(());
        }

        match event {
            PostCommitEvent::FinalApproved { instance, .. } => {
                let approved_by = instance
                    .instance
                    .final_approved_by
                    .clone()
                    .context("approved instance is missing final_approved_by")?;
                let approved_at = instance
                    .instance
                    .final_approved_at
                    .context("approved instance is missing final_approved_at")?;
                let stamped = self
                    .references
                    .mark_approved(&instance.instance.reference_id, &approved_by, approved_at)
                    .await
                    .context("stamp approval")?;
                if !stamped {
                    info!(
                        event_name = "reference_sync_skipped",
                        reference_id = %instance.instance.reference_id,
                        "no matching order row to stamp"
                    );
                }
                Ok(())
            }
            PostCommitEvent::Rejected { instance, .. } => {
                self.references
                    .mark_rejected(&instance.instance.reference_id)
                    .await
                    .context("stamp rejection")?;
                Ok(())
            }
            PostCommitEvent::Created { .. } | PostCommitEvent::StepApproved { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use flowgate_core::catalog::StepCatalog;
    use flowgate_core::creation::{assemble_instance, NewApprovalInstance};
    use flowgate_core::domain::instance::{InstanceStatus, Priority, ResolutionMode};
    use flowgate_db::repositories::{
        DirectoryUser, InMemoryDirectoryRepository, InMemoryReferenceSyncRepository,
    };
    use flowgate_db::repositories::memory::ReferenceStamp;
    use flowgate_notify::InMemoryNotificationDispatcher;

    use super::{NextApproverHook, PostCommitEvent, PostCommitHook, ReferenceSyncHook};

    fn assembled() -> flowgate_core::domain::instance::InstanceWithSteps {
        let catalog = StepCatalog::default();
        let new = NewApprovalInstance {
            request_type: "order".to_string(),
            reference_type: "order".to_string(),
            reference_id: "ord-1".to_string(),
            reference_number: Some("SO-0001".to_string()),
            requester_id: "u-rep".to_string(),
            requester_zone: None,
            requester_depot: None,
            priority: Priority::High,
            payload: serde_json::json!({}),
        };
        assemble_instance(&new, catalog.resolve("order"), ResolutionMode::Catalog, Utc::now())
            .expect("assemble")
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

    #[tokio::test]
    async fn next_approver_hook_fans_out_to_all_role_holders() {
        let directory = Arc::new(InMemoryDirectoryRepository::default());
        directory.insert(user("u-mgr-1", "sales_manager")).await;
        directory.insert(user("u-mgr-2", "sales_manager")).await;
        directory.insert(user("u-fin", "finance_manager")).await;
        let dispatcher = Arc::new(InMemoryNotificationDispatcher::default());

        let hook = NextApproverHook::new(directory, dispatcher.clone());
        let instance = assembled();
        hook.handle(&PostCommitEvent::Created { instance }).await.expect("hook");

        let sent = dispatcher.sent().await;
        assert_eq!(sent.len(), 2, "both sales managers are notified");
        assert!(sent.iter().all(|n| n.category == "approval_requested"));
        assert!(sent.iter().all(|n| n.title.contains("SO-0001")));
        assert_eq!(sent[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn next_approver_hook_is_quiet_on_terminal_events() {
        let directory = Arc::new(InMemoryDirectoryRepository::default());
        let dispatcher = Arc::new(InMemoryNotificationDispatcher::default());
        let hook = NextApproverHook::new(directory, dispatcher.clone());

        let mut pair = assembled();
        pair.instance.status = InstanceStatus::Approved;
        let step = pair.steps.last().expect("steps").clone();
        hook.handle(&PostCommitEvent::FinalApproved { instance: pair, step })
            .await
            .expect("hook");

        assert!(dispatcher.sent().await.is_empty());
    }

    #[tokio::test]
    async fn reference_sync_hook_stamps_orders_only() {
        let references = Arc::new(InMemoryReferenceSyncRepository::default());
        let hook = ReferenceSyncHook::new(references.clone());

        let mut pair = assembled();
        pair.instance.status = InstanceStatus::Approved;
        pair.instance.final_approved_by = Some("u-dir".to_string());
        pair.instance.final_approved_at = Some(Utc::now());
        let step = pair.steps.last().expect("steps").clone();

        hook.handle(&PostCommitEvent::FinalApproved { instance: pair.clone(), step: step.clone() })
            .await
            .expect("hook");
        assert_eq!(
            references.stamp_for("ord-1").await,
            Some(ReferenceStamp::Approved { approved_by: "u-dir".to_string() })
        );

        // Non-order references are left alone.
        pair.instance.reference_type = "expense_claim".to_string();
        pair.instance.reference_id = "exp-9".to_string();
        hook.handle(&PostCommitEvent::FinalApproved { instance: pair, step })
            .await
            .expect("hook");
        assert!(references.stamp_for("exp-9").await.is_none());
    }
}
