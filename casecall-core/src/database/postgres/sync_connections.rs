use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;

use super::db_err;
use crate::database::ports::SyncConnectionRepository;
use crate::domain::ConnectionId;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct PostgresSyncConnectionRepository {
    pool: PgPool,
}

impl PostgresSyncConnectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncConnectionRepository for PostgresSyncConnectionRepository {
    async fn mark_error(
        &self,
        connection_id: ConnectionId,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pms_connections
            SET status = 'error',
                last_error = $2::jsonb,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(connection_id.to_uuid())
        .bind(json!({ "message": message }))
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to mark sync connection as error"))?;
        Ok(())
    }
}
