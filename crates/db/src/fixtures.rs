use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

const SEED_USER_IDS: &[&str] = &[
    "user-rep-001",
    "user-mgr-001",
    "user-fin-001",
    "user-dir-001",
    "user-dep-001",
    "user-old-001",
];

const SEED_ASSIGNMENT_IDS: &[&str] = &[
    "assign-global-001",
    "assign-global-002",
    "assign-global-003",
    "assign-north-001",
    "assign-north-002",
];

const SEED_ORDER_IDS: &[&str] = &["order-seed-001", "order-seed-002"];

/// Deterministic seed dataset: an org directory, a global order chain plus a
/// zone-north depot override, and two pending sales orders.
pub struct SeedDataset;

impl SeedDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/seed_data.sql");

    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        Ok(SeedResult {
            users: SEED_USER_IDS.len(),
            assignments: SEED_ASSIGNMENT_IDS.len(),
            orders: SEED_ORDER_IDS.len(),
        })
    }

    /// Verify that the seed rows exist as named. Used by the doctor command.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let user_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM user_directory WHERE user_id IN {}",
            sql_array_from_ids(SEED_USER_IDS)
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("directory-users", user_count == SEED_USER_IDS.len() as i64));

        let assignment_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM approver_assignment WHERE id IN {}",
            sql_array_from_ids(SEED_ASSIGNMENT_IDS)
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("approver-assignments", assignment_count == SEED_ASSIGNMENT_IDS.len() as i64));

        let order_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM sales_order WHERE id IN {} AND approval_status = 'pending'",
            sql_array_from_ids(SEED_ORDER_IDS)
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("pending-orders", order_count == SEED_ORDER_IDS.len() as i64));

        let failed: Vec<&'static str> =
            checks.iter().filter(|(_, ok)| !ok).map(|(label, _)| *label).collect();
        Ok(VerificationResult { passed: failed.is_empty(), failed_checks: failed })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedResult {
    pub users: usize,
    pub assignments: usize,
    pub orders: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    pub passed: bool,
    pub failed_checks: Vec<&'static str>,
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted: Vec<String> = ids.iter().map(|id| format!("'{id}'")).collect();
    format!("({})", quoted.join(", "))
}

#[cfg(test)]
mod tests {
    use super::SeedDataset;
    use crate::repositories::{ChainRepository, SqlChainRepository};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn seed_loads_and_verifies() {
        let pool = setup().await;
        let result = SeedDataset::load(&pool).await.expect("seed");
        assert_eq!(result.users, 6);
        assert_eq!(result.assignments, 5);
        assert_eq!(result.orders, 2);

        let verification = SeedDataset::verify(&pool).await.expect("verify");
        assert!(verification.passed, "failed checks: {:?}", verification.failed_checks);
    }

    #[tokio::test]
    async fn seeded_chains_resolve_with_placement_override() {
        let pool = setup().await;
        SeedDataset::load(&pool).await.expect("seed");
        let repo = SqlChainRepository::new(pool);

        let north = repo
            .resolve_chain("order", Some("zone-north"), Some("depot-01"))
            .await
            .expect("resolve");
        assert_eq!(north.len(), 2);
        assert_eq!(north[0].name, "Depot Review");

        let elsewhere =
            repo.resolve_chain("order", Some("zone-south"), None).await.expect("resolve");
        assert_eq!(elsewhere.len(), 3);
        assert_eq!(elsewhere[0].name, "Sales Review");
    }
}
