use sqlx::Row;

use super::{DirectoryRepository, DirectoryUser, RepositoryError};
use crate::DbPool;

pub struct SqlDirectoryRepository {
    pool: DbPool,
}

impl SqlDirectoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<DirectoryUser, RepositoryError> {
    let decode = |e: sqlx::Error| RepositoryError::Decode(e.to_string());
    Ok(DirectoryUser {
        user_id: row.try_get("user_id").map_err(decode)?,
        display_name: row.try_get("display_name").map_err(decode)?,
        role: row.try_get("role").map_err(decode)?,
        zone_id: row.try_get("zone_id").map_err(decode)?,
        depot_id: row.try_get("depot_id").map_err(decode)?,
        active: row.try_get::<i64, _>("active").map_err(decode)? != 0,
    })
}

#[async_trait::async_trait]
impl DirectoryRepository for SqlDirectoryRepository {
    async fn active_role_holders(&self, role: &str) -> Result<Vec<DirectoryUser>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT user_id, display_name, role, zone_id, depot_id, active
             FROM user_directory
             WHERE role = ? AND active = 1
             ORDER BY user_id ASC",
        )
        .bind(role)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_user).collect()
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<DirectoryUser>, RepositoryError> {
        let row = sqlx::query(
            "SELECT user_id, display_name, role, zone_id, depot_id, active
             FROM user_directory WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref row) => Ok(Some(row_to_user(row)?)),
            None => Ok(None),
        }
    }
}
