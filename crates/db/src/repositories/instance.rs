use chrono::{DateTime, Utc};
use sqlx::Row;

use flowgate_core::decision::{apply_decision, DecisionRequest};
use flowgate_core::domain::instance::{
    ApprovalInstance, InstanceId, InstanceStatus, InstanceWithSteps, Priority, ResolutionMode,
};
use flowgate_core::domain::step::{Assignee, Step, StepId, StepStatus};

use super::{DecideError, DecisionApplied, InstanceRepository, RepositoryError};
use crate::DbPool;

pub struct SqlInstanceRepository {
    pool: DbPool,
}

impl SqlInstanceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_datetime(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{column}: {e}")))
}

fn parse_optional_datetime(
    column: &str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    raw.map(|s| parse_datetime(column, &s)).transpose()
}

fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalInstance, RepositoryError> {
    let decode = |e: sqlx::Error| RepositoryError::Decode(e.to_string());

    let payload_json: String = row.try_get("payload_json").map_err(decode)?;
    let payload = serde_json::from_str(&payload_json)
        .map_err(|e| RepositoryError::Decode(format!("payload_json: {e}")))?;
    let priority_str: String = row.try_get("priority").map_err(decode)?;
    let resolution_str: String = row.try_get("resolution").map_err(decode)?;
    let status_str: String = row.try_get("status").map_err(decode)?;
    let created_at_str: String = row.try_get("created_at").map_err(decode)?;
    let updated_at_str: String = row.try_get("updated_at").map_err(decode)?;

    Ok(ApprovalInstance {
        id: InstanceId(row.try_get("id").map_err(decode)?),
        request_type: row.try_get("request_type").map_err(decode)?,
        reference_type: row.try_get("reference_type").map_err(decode)?,
        reference_id: row.try_get("reference_id").map_err(decode)?,
        reference_number: row.try_get("reference_number").map_err(decode)?,
        requester_id: row.try_get("requester_id").map_err(decode)?,
        priority: Priority::parse(&priority_str),
        payload,
        resolution: ResolutionMode::parse(&resolution_str),
        status: InstanceStatus::parse(&status_str),
        current_step: row.try_get::<i64, _>("current_step").map_err(decode)? as u32,
        total_steps: row.try_get::<i64, _>("total_steps").map_err(decode)? as u32,
        final_approved_by: row.try_get("final_approved_by").map_err(decode)?,
        final_approved_at: parse_optional_datetime(
            "final_approved_at",
            row.try_get("final_approved_at").map_err(decode)?,
        )?,
        rejected_by: row.try_get("rejected_by").map_err(decode)?,
        rejected_at: parse_optional_datetime(
            "rejected_at",
            row.try_get("rejected_at").map_err(decode)?,
        )?,
        rejection_reason: row.try_get("rejection_reason").map_err(decode)?,
        active: row.try_get::<i64, _>("active").map_err(decode)? != 0,
        created_at: parse_datetime("created_at", &created_at_str)?,
        updated_at: parse_datetime("updated_at", &updated_at_str)?,
    })
}

fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<Step, RepositoryError> {
    let decode = |e: sqlx::Error| RepositoryError::Decode(e.to_string());

    let status_str: String = row.try_get("status").map_err(decode)?;
    let created_at_str: String = row.try_get("created_at").map_err(decode)?;

    Ok(Step {
        id: StepId(row.try_get("id").map_err(decode)?),
        instance_id: InstanceId(row.try_get("instance_id").map_err(decode)?),
        sequence: row.try_get::<i64, _>("sequence").map_err(decode)? as u32,
        name: row.try_get("name").map_err(decode)?,
        assignee: Assignee {
            role: row.try_get("assigned_role").map_err(decode)?,
            user: row.try_get("assigned_user").map_err(decode)?,
        },
        is_required: row.try_get::<i64, _>("is_required").map_err(decode)? != 0,
        status: StepStatus::parse(&status_str),
        comments: row.try_get("comments").map_err(decode)?,
        decided_by: row.try_get("decided_by").map_err(decode)?,
        decided_at: parse_optional_datetime(
            "decided_at",
            row.try_get("decided_at").map_err(decode)?,
        )?,
        created_at: parse_datetime("created_at", &created_at_str)?,
    })
}

const INSTANCE_COLUMNS: &str = "id, request_type, reference_type, reference_id, reference_number,
        requester_id, priority, payload_json, resolution, status, current_step, total_steps,
        final_approved_by, final_approved_at, rejected_by, rejected_at, rejection_reason,
        active, created_at, updated_at";

const STEP_COLUMNS: &str = "id, instance_id, sequence, name, assigned_role, assigned_user,
        is_required, status, comments, decided_by, decided_at, created_at";

async fn fetch_pair<'e, E>(
    executor: E,
    id: &InstanceId,
) -> Result<Option<InstanceWithSteps>, RepositoryError>
where
    E: sqlx::SqliteExecutor<'e> + Copy,
{
    let row = sqlx::query(&format!("SELECT {INSTANCE_COLUMNS} FROM approval_instance WHERE id = ?"))
        .bind(&id.0)
        .fetch_optional(executor)
        .await?;

    let Some(ref row) = row else { return Ok(None) };
    let instance = row_to_instance(row)?;

    let step_rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
        "SELECT {STEP_COLUMNS} FROM approval_step WHERE instance_id = ? ORDER BY sequence ASC"
    ))
    .bind(&id.0)
    .fetch_all(executor)
    .await?;

    let steps = step_rows.iter().map(row_to_step).collect::<Result<Vec<_>, _>>()?;
    Ok(Some(InstanceWithSteps { instance, steps }))
}

#[async_trait::async_trait]
impl InstanceRepository for SqlInstanceRepository {
    async fn create_with_steps(&self, created: &InstanceWithSteps) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let instance = &created.instance;

        let payload_json = serde_json::to_string(&instance.payload)
            .map_err(|e| RepositoryError::Decode(format!("payload_json: {e}")))?;

        sqlx::query(
            "INSERT INTO approval_instance (id, request_type, reference_type, reference_id,
                 reference_number, requester_id, priority, payload_json, resolution, status,
                 current_step, total_steps, final_approved_by, final_approved_at, rejected_by,
                 rejected_at, rejection_reason, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL, NULL, ?, ?, ?)",
        )
        .bind(&instance.id.0)
        .bind(&instance.request_type)
        .bind(&instance.reference_type)
        .bind(&instance.reference_id)
        .bind(&instance.reference_number)
        .bind(&instance.requester_id)
        .bind(instance.priority.as_str())
        .bind(&payload_json)
        .bind(instance.resolution.as_str())
        .bind(instance.status.as_str())
        .bind(instance.current_step as i64)
        .bind(instance.total_steps as i64)
        .bind(instance.active as i64)
        .bind(instance.created_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for step in &created.steps {
            sqlx::query(
                "INSERT INTO approval_step (id, instance_id, sequence, name, assigned_role,
                     assigned_user, is_required, status, comments, decided_by, decided_at,
                     created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&step.id.0)
            .bind(&step.instance_id.0)
            .bind(step.sequence as i64)
            .bind(&step.name)
            .bind(&step.assignee.role)
            .bind(&step.assignee.user)
            .bind(step.is_required as i64)
            .bind(step.status.as_str())
            .bind(&step.comments)
            .bind(&step.decided_by)
            .bind(step.decided_at.map(|dt| dt.to_rfc3339()))
            .bind(step.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch(&self, id: &InstanceId) -> Result<Option<InstanceWithSteps>, RepositoryError> {
        fetch_pair(&self.pool, id).await
    }

    async fn decide(
        &self,
        id: &InstanceId,
        request: &DecisionRequest,
    ) -> Result<DecisionApplied, DecideError> {
        let mut tx = self.pool.begin().await?;

        // First statement takes the write lock. A concurrent decide on the
        // same instance blocks here until the other transaction commits, so
        // the read below sees committed state, never a stale snapshot.
        sqlx::query("UPDATE approval_instance SET updated_at = updated_at WHERE id = ?")
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;

        let loaded = fetch_pair_tx(&mut tx, id).await?;
        let Some(loaded) = loaded else {
            return Err(DecideError::InstanceNotFound(id.clone()));
        };

        let outcome = apply_decision(&loaded.instance, &loaded.steps, request, Utc::now())?;

        // Status guard: a step leaves 'pending' exactly once, whichever
        // path led here.
        let step = &outcome.step;
        let affected = sqlx::query(
            "UPDATE approval_step
             SET status = ?, comments = ?, decided_by = ?, decided_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(step.status.as_str())
        .bind(&step.comments)
        .bind(&step.decided_by)
        .bind(step.decided_at.map(|dt| dt.to_rfc3339()))
        .bind(&step.id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            drop(tx);
            let current = fetch_pair(&self.pool, id)
                .await?
                .ok_or_else(|| DecideError::InstanceNotFound(id.clone()))?;
            let status = current
                .steps
                .iter()
                .find(|s| s.id == step.id)
                .map(|s| s.status)
                .unwrap_or(StepStatus::Pending);
            return Err(flowgate_core::decision::DecisionError::StepAlreadyProcessed {
                step: step.id.clone(),
                status,
            }
            .into());
        }

        let instance = &outcome.instance;
        sqlx::query(
            "UPDATE approval_instance
             SET status = ?, current_step = ?, final_approved_by = ?, final_approved_at = ?,
                 rejected_by = ?, rejected_at = ?, rejection_reason = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(instance.status.as_str())
        .bind(instance.current_step as i64)
        .bind(&instance.final_approved_by)
        .bind(instance.final_approved_at.map(|dt| dt.to_rfc3339()))
        .bind(&instance.rejected_by)
        .bind(instance.rejected_at.map(|dt| dt.to_rfc3339()))
        .bind(&instance.rejection_reason)
        .bind(instance.updated_at.to_rfc3339())
        .bind(&instance.id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let refreshed = fetch_pair(&self.pool, id)
            .await?
            .ok_or_else(|| DecideError::InstanceNotFound(id.clone()))?;

        Ok(DecisionApplied { kind: outcome.kind, step: outcome.step, instance: refreshed })
    }

    async fn list_pending_for_role(
        &self,
        role: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalInstance>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM approval_instance
             WHERE active = 1
               AND status IN ('pending', 'in_progress')
               AND EXISTS (
                   SELECT 1 FROM approval_step
                   WHERE approval_step.instance_id = approval_instance.id
                     AND approval_step.sequence = approval_instance.current_step
                     AND approval_step.status = 'pending'
                     AND approval_step.assigned_role = ?
               )
             ORDER BY created_at ASC
             LIMIT ?"
        ))
        .bind(role)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn list_pending_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalInstance>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM approval_instance
             WHERE active = 1
               AND status IN ('pending', 'in_progress')
               AND EXISTS (
                   SELECT 1 FROM approval_step
                   WHERE approval_step.instance_id = approval_instance.id
                     AND approval_step.sequence = approval_instance.current_step
                     AND approval_step.status = 'pending'
                     AND approval_step.assigned_user = ?
               )
             ORDER BY created_at ASC
             LIMIT ?"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn deactivate(&self, id: &InstanceId) -> Result<bool, RepositoryError> {
        let affected = sqlx::query(
            "UPDATE approval_instance SET active = 0, updated_at = ? WHERE id = ? AND active = 1",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }
}

async fn fetch_pair_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: &InstanceId,
) -> Result<Option<InstanceWithSteps>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {INSTANCE_COLUMNS} FROM approval_instance WHERE id = ?"))
        .bind(&id.0)
        .fetch_optional(&mut **tx)
        .await?;

    let Some(ref row) = row else { return Ok(None) };
    let instance = row_to_instance(row)?;

    let step_rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
        "SELECT {STEP_COLUMNS} FROM approval_step WHERE instance_id = ? ORDER BY sequence ASC"
    ))
    .bind(&id.0)
    .fetch_all(&mut **tx)
    .await?;

    let steps = step_rows.iter().map(row_to_step).collect::<Result<Vec<_>, _>>()?;
    Ok(Some(InstanceWithSteps { instance, steps }))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use flowgate_core::catalog::StepCatalog;
    use flowgate_core::creation::{assemble_instance, NewApprovalInstance};
    use flowgate_core::decision::{DecisionError, DecisionOutcomeKind, DecisionRequest};
    use flowgate_core::domain::instance::{
        InstanceId, InstanceStatus, InstanceWithSteps, Priority, ResolutionMode,
    };
    use flowgate_core::domain::step::StepStatus;

    use super::SqlInstanceRepository;
    use crate::repositories::{DecideError, InstanceRepository, RepositoryError};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn new_order(reference_id: &str) -> NewApprovalInstance {
        NewApprovalInstance {
            request_type: "order".to_string(),
            reference_type: "order".to_string(),
            reference_id: reference_id.to_string(),
            reference_number: Some(format!("SO-{reference_id}")),
            requester_id: "u-rep".to_string(),
            requester_zone: Some("zone-1".to_string()),
            requester_depot: Some("depot-7".to_string()),
            priority: Priority::Medium,
            payload: serde_json::json!({"lines": 2, "total": 840.5}),
        }
    }

    fn assemble(reference_id: &str) -> InstanceWithSteps {
        let catalog = StepCatalog::default();
        assemble_instance(
            &new_order(reference_id),
            catalog.resolve("order"),
            ResolutionMode::Catalog,
            Utc::now(),
        )
        .expect("assemble")
    }

    #[tokio::test]
    async fn create_then_fetch_round_trips_instance_and_steps() {
        let pool = setup().await;
        let repo = SqlInstanceRepository::new(pool);
        let created = assemble("ord-1");

        repo.create_with_steps(&created).await.expect("create");
        let fetched =
            repo.fetch(&created.instance.id).await.expect("fetch").expect("instance exists");

        assert_eq!(fetched.instance.id, created.instance.id);
        assert_eq!(fetched.instance.current_step, 2);
        assert_eq!(fetched.instance.payload, created.instance.payload);
        assert_eq!(fetched.steps.len(), 4);
        assert_eq!(fetched.steps[0].status, StepStatus::Completed);
        assert_eq!(fetched.steps[0].decided_by.as_deref(), Some("system"));
        assert_eq!(fetched.steps[1].assignee.role.as_deref(), Some("sales_manager"));
    }

    #[tokio::test]
    async fn decide_walks_the_chain_to_full_approval() {
        let pool = setup().await;
        let repo = SqlInstanceRepository::new(pool);
        let created = assemble("ord-2");
        repo.create_with_steps(&created).await.expect("create");
        let id = created.instance.id.clone();

        let applied =
            repo.decide(&id, &DecisionRequest::approve("u-mgr")).await.expect("approve step 2");
        assert_eq!(applied.kind, DecisionOutcomeKind::Advanced { next_sequence: 3 });
        assert_eq!(applied.instance.instance.status, InstanceStatus::InProgress);

        repo.decide(&id, &DecisionRequest::approve("u-fin")).await.expect("approve step 3");
        let applied =
            repo.decide(&id, &DecisionRequest::approve("u-dir")).await.expect("approve step 4");

        assert_eq!(applied.kind, DecisionOutcomeKind::FullyApproved);
        assert_eq!(applied.instance.instance.status, InstanceStatus::Approved);
        assert_eq!(applied.instance.instance.final_approved_by.as_deref(), Some("u-dir"));
        assert!(applied.instance.instance.terminal_fields_consistent());
    }

    #[tokio::test]
    async fn rejection_persists_reason_and_blocks_further_decisions() {
        let pool = setup().await;
        let repo = SqlInstanceRepository::new(pool);
        let created = assemble("ord-3");
        repo.create_with_steps(&created).await.expect("create");
        let id = created.instance.id.clone();

        let applied = repo
            .decide(&id, &DecisionRequest::reject("u-mgr", "margin too thin"))
            .await
            .expect("reject");
        assert_eq!(applied.kind, DecisionOutcomeKind::Rejected);
        assert_eq!(applied.instance.instance.rejection_reason.as_deref(), Some("margin too thin"));

        let error = repo
            .decide(&id, &DecisionRequest::approve("u-dir"))
            .await
            .expect_err("terminal instance");
        assert!(matches!(
            error,
            DecideError::Decision(DecisionError::AlreadyFinalized { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_decisions_on_one_step_have_a_single_winner() {
        let pool = setup().await;
        let repo = SqlInstanceRepository::new(pool);
        let created = assemble("ord-4");
        repo.create_with_steps(&created).await.expect("create");
        let id = created.instance.id.clone();
        let step_id = created.steps[1].id.clone();

        let request_a = DecisionRequest::approve("u-mgr-a").on_step(step_id.clone());
        let request_b = DecisionRequest::approve("u-mgr-b").on_step(step_id);
        let (first, second) =
            tokio::join!(repo.decide(&id, &request_a), repo.decide(&id, &request_b));

        let outcomes = [first.is_ok(), second.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "exactly one decision wins");

        let loser = if outcomes[0] { second } else { first };
        assert!(matches!(
            loser.expect_err("loser fails"),
            DecideError::Decision(DecisionError::StepAlreadyProcessed { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_decisions_race_cleanly_across_pool_connections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("race.db").display());
        let pool = connect_with_settings(&url, 5, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let repo = SqlInstanceRepository::new(pool);
        let created = assemble("ord-race");
        repo.create_with_steps(&created).await.expect("create");
        let id = created.instance.id.clone();
        let step_id = created.steps[1].id.clone();

        let request_a = DecisionRequest::approve("u-mgr-a").on_step(step_id.clone());
        let request_b = DecisionRequest::approve("u-mgr-b").on_step(step_id);
        let (first, second) =
            tokio::join!(repo.decide(&id, &request_a), repo.decide(&id, &request_b));

        let outcomes = [first.is_ok(), second.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "exactly one decision wins");

        let loser = if outcomes[0] { second } else { first };
        assert!(matches!(
            loser.expect_err("loser fails"),
            DecideError::Decision(DecisionError::StepAlreadyProcessed { .. })
        ));
    }

    #[tokio::test]
    async fn corrupt_timestamps_surface_as_decode_errors() {
        let pool = setup().await;
        let repo = SqlInstanceRepository::new(pool.clone());
        let created = assemble("ord-8");
        repo.create_with_steps(&created).await.expect("create");

        sqlx::query("UPDATE approval_instance SET created_at = 'yesterday-ish' WHERE id = ?")
            .bind(&created.instance.id.0)
            .execute(&pool)
            .await
            .expect("overwrite timestamp");

        let error = repo.fetch(&created.instance.id).await.expect_err("decode failure");
        assert!(matches!(
            error,
            RepositoryError::Decode(ref message) if message.contains("created_at")
        ));
    }

    #[tokio::test]
    async fn pending_lists_surface_only_the_current_step_audience() {
        let pool = setup().await;
        let repo = SqlInstanceRepository::new(pool);
        let created = assemble("ord-5");
        repo.create_with_steps(&created).await.expect("create");

        // Step 2 (sales_manager) is current; step 3 (finance_manager) is not
        // actionable yet.
        let for_sales = repo.list_pending_for_role("sales_manager", 10).await.expect("list");
        assert_eq!(for_sales.len(), 1);
        assert_eq!(for_sales[0].id, created.instance.id);

        let for_finance = repo.list_pending_for_role("finance_manager", 10).await.expect("list");
        assert!(for_finance.is_empty());

        repo.decide(&created.instance.id, &DecisionRequest::approve("u-mgr"))
            .await
            .expect("advance");

        let for_finance = repo.list_pending_for_role("finance_manager", 10).await.expect("list");
        assert_eq!(for_finance.len(), 1);
    }

    #[tokio::test]
    async fn deactivate_hides_instance_from_pending_lists() {
        let pool = setup().await;
        let repo = SqlInstanceRepository::new(pool);
        let created = assemble("ord-6");
        repo.create_with_steps(&created).await.expect("create");

        assert!(repo.deactivate(&created.instance.id).await.expect("deactivate"));
        assert!(!repo.deactivate(&created.instance.id).await.expect("already inactive"));

        let pending = repo.list_pending_for_role("sales_manager", 10).await.expect("list");
        assert!(pending.is_empty());

        // The record itself is retained.
        let fetched = repo.fetch(&created.instance.id).await.expect("fetch").expect("exists");
        assert!(!fetched.instance.active);
    }

    #[tokio::test]
    async fn unknown_instance_is_reported_as_not_found() {
        let pool = setup().await;
        let repo = SqlInstanceRepository::new(pool);

        let error = repo
            .decide(&InstanceId("missing".to_string()), &DecisionRequest::approve("u-x"))
            .await
            .expect_err("missing instance");
        assert!(matches!(error, DecideError::InstanceNotFound(_)));
    }
}
