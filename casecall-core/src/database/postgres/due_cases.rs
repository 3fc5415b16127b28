use async_trait::async_trait;
use chrono::Duration;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::db_err;
use crate::database::ports::{DueCase, DueCaseQuery, DueCaseRepository};
use crate::domain::{CaseId, TenantId};
use crate::error::{CaseCallError, Result};

/// Eligible cases ranked per tenant by due order.
///
/// `$1` tenant scope (nullable), `$2` include demo cases, `$3` per-tenant cap.
const RANKED_DUE_CASES: &str = r#"
    ranked AS (
        SELECT
            dc.id,
            dc.tenant_id,
            dc.next_action_at,
            dc.created_at,
            ROW_NUMBER() OVER (
                PARTITION BY dc.tenant_id
                ORDER BY dc.next_action_at ASC NULLS FIRST, dc.created_at ASC, dc.id ASC
            ) AS rn
        FROM debt_cases dc
        JOIN flow_policies fp ON fp.id = dc.flow_policy_id
        WHERE dc.status IN ('NEW', 'IN_PROGRESS')
          AND (dc.next_action_at IS NULL OR dc.next_action_at <= NOW())
          AND COALESCE((fp.channels->>'call')::boolean, false)
          AND ($1::uuid IS NULL OR dc.tenant_id = $1::uuid)
          AND ($2::boolean OR COALESCE(dc.meta->>'source', '') <> 'demo-ui')
    )
"#;

#[derive(Debug, Clone)]
pub struct PostgresDueCaseRepository {
    pool: PgPool,
}

impl PostgresDueCaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> Result<DueCase> {
        let id: Uuid = row
            .try_get("id")
            .map_err(|e| CaseCallError::Database(format!("Failed to read case id: {e}")))?;
        let tenant_id: Uuid = row
            .try_get("tenant_id")
            .map_err(|e| CaseCallError::Database(format!("Failed to read tenant_id: {e}")))?;
        Ok(DueCase {
            case_id: CaseId(id),
            tenant_id: TenantId(tenant_id),
        })
    }
}

fn as_limit(value: u32) -> i64 {
    i64::from(value)
}

#[async_trait]
impl DueCaseRepository for PostgresDueCaseRepository {
    async fn list_due(&self, query: &DueCaseQuery) -> Result<Vec<DueCase>> {
        let sql = format!(
            r#"
            WITH {RANKED_DUE_CASES}
            SELECT id, tenant_id
            FROM ranked
            WHERE rn <= $3
            ORDER BY next_action_at ASC NULLS FIRST, created_at ASC, id ASC
            LIMIT $4
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(query.tenant_id.map(|t| t.to_uuid()))
            .bind(query.include_demo)
            .bind(as_limit(query.effective_per_tenant_limit()))
            .bind(as_limit(query.limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("Failed to list due cases"))?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn claim_due(
        &self,
        query: &DueCaseQuery,
        cooldown: Duration,
    ) -> Result<Vec<DueCase>> {
        // Rows locked by a concurrent claim are skipped, never waited on. Rows
        // that another claim committed before we reached them fail the
        // re-checked due predicate under READ COMMITTED.
        let sql = format!(
            r#"
            WITH {RANKED_DUE_CASES},
            picked AS (
                SELECT
                    dc.id,
                    dc.next_action_at AS previous_next_action_at,
                    dc.created_at
                FROM debt_cases dc
                JOIN ranked r ON r.id = dc.id
                WHERE r.rn <= $3
                  AND dc.status IN ('NEW', 'IN_PROGRESS')
                  AND (dc.next_action_at IS NULL OR dc.next_action_at <= NOW())
                ORDER BY dc.next_action_at ASC NULLS FIRST, dc.created_at ASC, dc.id ASC
                LIMIT $4
                FOR UPDATE OF dc SKIP LOCKED
            ),
            claimed AS (
                UPDATE debt_cases dc
                SET next_action_at = NOW() + ($5::bigint * INTERVAL '1 millisecond'),
                    updated_at = NOW()
                FROM picked p
                WHERE dc.id = p.id
                RETURNING dc.id, dc.tenant_id, p.previous_next_action_at, p.created_at
            )
            SELECT id, tenant_id
            FROM claimed
            ORDER BY previous_next_action_at ASC NULLS FIRST, created_at ASC, id ASC
            "#
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("Failed to begin claim transaction"))?;

        let rows = sqlx::query(&sql)
            .bind(query.tenant_id.map(|t| t.to_uuid()))
            .bind(query.include_demo)
            .bind(as_limit(query.effective_per_tenant_limit()))
            .bind(as_limit(query.limit))
            .bind(cooldown.num_milliseconds())
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err("Failed to claim due cases"))?;

        let claimed = rows.iter().map(Self::map_row).collect::<Result<Vec<_>>>()?;

        tx.commit()
            .await
            .map_err(db_err("Failed to commit claim transaction"))?;

        Ok(claimed)
    }
}
