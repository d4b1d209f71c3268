use std::sync::Arc;

use flowgate_core::config::AppConfig;
use flowgate_core::domain::instance::ResolutionMode;
use flowgate_db::repositories::{
    SqlChainRepository, SqlDirectoryRepository, SqlInstanceRepository, SqlReferenceSyncRepository,
};
use flowgate_db::DbPool;
use flowgate_notify::{
    EmailSender, EmailTemplateRenderer, LoggingEmailSender, NotifyError, SqlNotificationDispatcher,
};

use crate::hooks::{NextApproverHook, ReferenceSyncHook, RequesterOutcomeHook};
use crate::resolver::{ResolverStrategy, WorkflowDefinitionResolver};
use crate::service::ApprovalEngine;

/// Wire the engine against the SQL-backed repositories. The resolution mode
/// picks which strategy new instances use; approver and requester emails are
/// attached only when the notifier section enables them.
pub fn build_engine(
    pool: DbPool,
    config: &AppConfig,
    mode: ResolutionMode,
) -> Result<ApprovalEngine, NotifyError> {
    let instances = Arc::new(SqlInstanceRepository::new(pool.clone()));
    let directory = Arc::new(SqlDirectoryRepository::new(pool.clone()));
    let references = Arc::new(SqlReferenceSyncRepository::new(pool.clone()));
    let dispatcher = Arc::new(SqlNotificationDispatcher::new(pool.clone()));

    let strategy = match mode {
        ResolutionMode::Catalog => ResolverStrategy::Catalog(config.step_catalog()),
        ResolutionMode::Hierarchy => {
            ResolverStrategy::Hierarchy(Arc::new(SqlChainRepository::new(pool)))
        }
    };
    let resolver = WorkflowDefinitionResolver::new(strategy);

    let mut next_approver = NextApproverHook::new(directory.clone(), dispatcher.clone());
    let mut requester_outcome = RequesterOutcomeHook::new(directory, dispatcher);
    if config.notifier.email_enabled {
        let sender: Arc<dyn EmailSender> =
            Arc::new(LoggingEmailSender::new(config.notifier.from_address.clone()));
        next_approver = next_approver.with_email(EmailTemplateRenderer::new()?, sender.clone());
        requester_outcome = requester_outcome.with_email(EmailTemplateRenderer::new()?, sender);
    }

    Ok(ApprovalEngine::new(resolver, instances)
        .with_hook(Arc::new(next_approver))
        .with_hook(Arc::new(requester_outcome))
        .with_hook(Arc::new(ReferenceSyncHook::new(references))))
}

#[cfg(test)]
mod tests {
    use flowgate_core::config::AppConfig;
    use flowgate_core::creation::NewApprovalInstance;
    use flowgate_core::decision::{DecisionOutcomeKind, DecisionRequest};
    use flowgate_core::domain::instance::{Priority, ResolutionMode};
    use flowgate_db::{connect_with_settings, migrations, DbPool};

    use super::build_engine;

    async fn setup() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn new_order() -> NewApprovalInstance {
        NewApprovalInstance {
            request_type: "order".to_string(),
            reference_type: "order".to_string(),
            reference_id: "ord-1".to_string(),
            reference_number: Some("SO-0001".to_string()),
            requester_id: "u-rep".to_string(),
            requester_zone: None,
            requester_depot: None,
            priority: Priority::Medium,
            payload: serde_json::json!({"total": 120.0}),
        }
    }

    #[tokio::test]
    async fn built_engine_runs_the_sql_stack_end_to_end() {
        let pool = setup().await;
        let config = AppConfig::default();
        let engine = build_engine(pool, &config, ResolutionMode::Catalog).expect("build");

        let created = engine.create(new_order()).await.expect("create");
        let applied = engine
            .decide(&created.instance.id, &DecisionRequest::approve("u-mgr"))
            .await
            .expect("decide");
        assert_eq!(applied.kind, DecisionOutcomeKind::Advanced { next_sequence: 3 });
    }

    #[tokio::test]
    async fn email_wiring_follows_the_notifier_flag() {
        let pool = setup().await;
        let mut config = AppConfig::default();
        config.notifier.email_enabled = true;

        build_engine(pool, &config, ResolutionMode::Hierarchy).expect("build with email");
    }
}
