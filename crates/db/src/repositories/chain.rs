use sqlx::Row;

use flowgate_core::catalog::StepTemplate;
use flowgate_core::domain::step::Assignee;

use super::{ChainRepository, RepositoryError};
use crate::DbPool;

pub struct SqlChainRepository {
    pool: DbPool,
}

impl SqlChainRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn tier(
        &self,
        request_type: &str,
        zone_id: Option<&str>,
        depot_id: Option<&str>,
    ) -> Result<Vec<StepTemplate>, RepositoryError> {
        let zone_clause = if zone_id.is_some() { "zone_id = ?" } else { "zone_id IS NULL" };
        let depot_clause = if depot_id.is_some() { "depot_id = ?" } else { "depot_id IS NULL" };

        let sql = format!(
            "SELECT sequence, step_name, assigned_role, assigned_user
             FROM approver_assignment
             WHERE active = 1 AND request_type = ? AND {zone_clause} AND {depot_clause}
             ORDER BY sequence ASC, id ASC"
        );

        let mut query = sqlx::query(&sql).bind(request_type);
        if let Some(zone_id) = zone_id {
            query = query.bind(zone_id);
        }
        if let Some(depot_id) = depot_id {
            query = query.bind(depot_id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let decode = |e: sqlx::Error| RepositoryError::Decode(e.to_string());
                Ok(StepTemplate {
                    sequence: row.try_get::<i64, _>("sequence").map_err(decode)? as u32,
                    name: row.try_get("step_name").map_err(decode)?,
                    assignee: Assignee {
                        role: row.try_get("assigned_role").map_err(decode)?,
                        user: row.try_get("assigned_user").map_err(decode)?,
                    },
                    is_required: true,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ChainRepository for SqlChainRepository {
    async fn resolve_chain(
        &self,
        request_type: &str,
        zone_id: Option<&str>,
        depot_id: Option<&str>,
    ) -> Result<Vec<StepTemplate>, RepositoryError> {
        // Most specific placement first, then widen. Each tier is only
        // consulted when its inputs are present; the global tier always is.
        if zone_id.is_some() && depot_id.is_some() {
            let chain = self.tier(request_type, zone_id, depot_id).await?;
            if !chain.is_empty() {
                return Ok(chain);
            }
        }
        if zone_id.is_some() {
            let chain = self.tier(request_type, zone_id, None).await?;
            if !chain.is_empty() {
                return Ok(chain);
            }
        }
        if depot_id.is_some() {
            let chain = self.tier(request_type, None, depot_id).await?;
            if !chain.is_empty() {
                return Ok(chain);
            }
        }
        self.tier(request_type, None, None).await
    }
}
