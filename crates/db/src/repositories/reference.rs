use chrono::{DateTime, Utc};

use super::{ReferenceSyncRepository, RepositoryError};
use crate::DbPool;

/// Propagates final approval outcomes onto the originating sales order row.
/// The approval record is the source of truth; this is a denormalized stamp
/// for the order list views.
pub struct SqlReferenceSyncRepository {
    pool: DbPool,
}

impl SqlReferenceSyncRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ReferenceSyncRepository for SqlReferenceSyncRepository {
    async fn mark_approved(
        &self,
        reference_id: &str,
        approved_by: &str,
        approved_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let affected = sqlx::query(
            "UPDATE sales_order SET approval_status = 'approved', approved_by = ?, approved_at = ?
             WHERE id = ?",
        )
        .bind(approved_by)
        .bind(approved_at.to_rfc3339())
        .bind(reference_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn mark_rejected(&self, reference_id: &str) -> Result<bool, RepositoryError> {
        let affected = sqlx::query(
            "UPDATE sales_order SET approval_status = 'rejected', approved_by = NULL,
                 approved_at = NULL
             WHERE id = ?",
        )
        .bind(reference_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }
}
