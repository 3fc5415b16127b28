use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use super::db_err;
use crate::database::ports::{
    CallAttempt, CallCaseRepository, CallFailure, InvalidContact,
};
use crate::domain::{
    CALL_CHANNEL_PROVIDER, CallCase, CaseId, CaseMeta, CaseStatus, ContactPolicy,
    DebtCase, DebtorId, FlowPolicyId, InteractionError, InteractionId,
    InteractionRecord, InteractionStatus, InteractionType, META_INVALID_CONTACT_REASON,
    META_LAST_CALL_ERROR_AT, META_LAST_CALL_ERROR_MESSAGE, OUTCOME_FAILED, TenantId,
};
use crate::error::{CaseCallError, Result};

const INTERACTION_COLUMNS: &str = r#"
    id,
    tenant_id,
    debt_case_id,
    debtor_id,
    type,
    status,
    channel_provider,
    provider_ref,
    outcome,
    summary,
    error,
    started_at,
    ended_at,
    created_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresCallCaseRepository {
    pool: PgPool,
}

fn read<'r, T>(row: &'r PgRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| CaseCallError::Database(format!("Failed to read {column}: {e}")))
}

impl PostgresCallCaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_call_case(row: &PgRow) -> Result<CallCase> {
        let status: String = read(row, "status")?;
        let meta: Option<serde_json::Value> = read(row, "meta")?;
        let policy_id: Option<Uuid> = read(row, "policy_id")?;
        let channels: Option<serde_json::Value> = read(row, "policy_channels")?;

        let case = DebtCase {
            id: CaseId(read(row, "id")?),
            tenant_id: TenantId(read(row, "tenant_id")?),
            debtor_id: DebtorId(read(row, "debtor_id")?),
            flow_policy_id: FlowPolicyId(read(row, "flow_policy_id")?),
            status: status.parse().unwrap_or(CaseStatus::Other(status)),
            next_action_at: read(row, "next_action_at")?,
            last_contacted_at: read(row, "last_contacted_at")?,
            created_at: read(row, "created_at")?,
            meta: meta.map(CaseMeta::from_json).unwrap_or_default(),
        };

        Ok(CallCase {
            case,
            debtor_phone: read(row, "debtor_phone")?,
            policy: policy_id.map(|id| {
                ContactPolicy::from_channels_json(
                    FlowPolicyId(id),
                    channels.unwrap_or(serde_json::Value::Null),
                )
            }),
        })
    }

    fn map_interaction(row: &PgRow) -> Result<InteractionRecord> {
        let status: String = read(row, "status")?;
        let error: Option<serde_json::Value> = read(row, "error")?;
        let error = error
            .map(serde_json::from_value::<InteractionError>)
            .transpose()?;

        Ok(InteractionRecord {
            id: InteractionId(read(row, "id")?),
            tenant_id: TenantId(read(row, "tenant_id")?),
            case_id: CaseId(read(row, "debt_case_id")?),
            debtor_id: DebtorId(read(row, "debtor_id")?),
            kind: InteractionType::Call,
            status: status.parse().unwrap_or(InteractionStatus::Other(status)),
            channel_provider: read(row, "channel_provider")?,
            provider_ref: read(row, "provider_ref")?,
            outcome: read(row, "outcome")?,
            summary: read(row, "summary")?,
            error,
            started_at: read(row, "started_at")?,
            ended_at: read(row, "ended_at")?,
            created_at: read(row, "created_at")?,
        })
    }

    async fn insert_interaction(
        tx: &mut Transaction<'_, Postgres>,
        record: NewInteraction<'_>,
    ) -> Result<InteractionRecord> {
        let sql = format!(
            r#"
            INSERT INTO interaction_logs (
                id, tenant_id, debt_case_id, debtor_id, type, status,
                channel_provider, outcome, summary, error, started_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            RETURNING {INTERACTION_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(InteractionId::new().to_uuid())
            .bind(record.tenant_id.to_uuid())
            .bind(record.case_id.to_uuid())
            .bind(record.debtor_id.to_uuid())
            .bind(InteractionType::Call.as_str())
            .bind(record.status.as_str())
            .bind(CALL_CHANNEL_PROVIDER)
            .bind(record.outcome)
            .bind(record.summary)
            .bind(record.error)
            .bind(record.started_at)
            .bind(record.created_at)
            .fetch_one(&mut **tx)
            .await
            .map_err(db_err("Failed to create interaction"))?;

        Self::map_interaction(&row)
    }
}

struct NewInteraction<'a> {
    tenant_id: TenantId,
    case_id: CaseId,
    debtor_id: DebtorId,
    status: InteractionStatus,
    outcome: Option<&'a str>,
    summary: Option<&'a str>,
    error: Option<serde_json::Value>,
    started_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

#[async_trait]
impl CallCaseRepository for PostgresCallCaseRepository {
    async fn load_call_case(
        &self,
        tenant_id: TenantId,
        case_id: CaseId,
    ) -> Result<Option<CallCase>> {
        let row = sqlx::query(
            r#"
            SELECT
                dc.id,
                dc.tenant_id,
                dc.debtor_id,
                dc.flow_policy_id,
                dc.status,
                dc.next_action_at,
                dc.last_contacted_at,
                dc.created_at,
                dc.meta,
                d.phone AS debtor_phone,
                fp.id AS policy_id,
                fp.channels AS policy_channels
            FROM debt_cases dc
            LEFT JOIN debtors d ON d.id = dc.debtor_id
            LEFT JOIN flow_policies fp ON fp.id = dc.flow_policy_id
            WHERE dc.id = $1 AND dc.tenant_id = $2
            "#,
        )
        .bind(case_id.to_uuid())
        .bind(tenant_id.to_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to load debt case"))?;

        row.as_ref().map(Self::map_call_case).transpose()
    }

    async fn mark_invalid_contact(
        &self,
        update: InvalidContact,
    ) -> Result<InteractionRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("Failed to begin invalid-contact transaction"))?;

        let patch = json!({ META_INVALID_CONTACT_REASON: update.reason });
        let result = sqlx::query(
            r#"
            UPDATE debt_cases
            SET status = $3,
                next_action_at = NULL,
                meta = COALESCE(meta, '{}'::jsonb) || $4::jsonb,
                updated_at = $5
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(update.case_id.to_uuid())
        .bind(update.tenant_id.to_uuid())
        .bind(CaseStatus::InvalidContact.as_str())
        .bind(patch)
        .bind(update.at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to mark case invalid contact"))?;

        if result.rows_affected() == 0 {
            return Err(CaseCallError::NotFound(format!(
                "Debt case {} not found",
                update.case_id
            )));
        }

        let record = Self::insert_interaction(
            &mut tx,
            NewInteraction {
                tenant_id: update.tenant_id,
                case_id: update.case_id,
                debtor_id: update.debtor_id,
                status: InteractionStatus::Failed,
                outcome: Some(OUTCOME_FAILED),
                summary: Some(&update.summary),
                error: Some(json!({ "message": update.error_message })),
                started_at: None,
                created_at: update.at,
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(db_err("Failed to commit invalid-contact transaction"))?;

        Ok(record)
    }

    async fn begin_call_attempt(
        &self,
        attempt: CallAttempt,
    ) -> Result<InteractionRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("Failed to begin call attempt transaction"))?;

        let record = Self::insert_interaction(
            &mut tx,
            NewInteraction {
                tenant_id: attempt.tenant_id,
                case_id: attempt.case_id,
                debtor_id: attempt.debtor_id,
                status: InteractionStatus::Queued,
                outcome: None,
                summary: None,
                error: None,
                started_at: Some(attempt.started_at),
                created_at: attempt.started_at,
            },
        )
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE debt_cases
            SET status = $3,
                last_contacted_at = $4,
                next_action_at = $5,
                updated_at = $4
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(attempt.case_id.to_uuid())
        .bind(attempt.tenant_id.to_uuid())
        .bind(CaseStatus::InProgress.as_str())
        .bind(attempt.started_at)
        .bind(attempt.next_action_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to move case to in progress"))?;

        if result.rows_affected() == 0 {
            return Err(CaseCallError::NotFound(format!(
                "Debt case {} not found",
                attempt.case_id
            )));
        }

        tx.commit()
            .await
            .map_err(db_err("Failed to commit call attempt transaction"))?;

        Ok(record)
    }

    async fn record_call_started(
        &self,
        interaction_id: InteractionId,
        provider_ref: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE interaction_logs
            SET provider_ref = $2,
                status = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(interaction_id.to_uuid())
        .bind(provider_ref)
        .bind(InteractionStatus::InProgress.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to record call start"))?;

        if result.rows_affected() == 0 {
            return Err(CaseCallError::NotFound(format!(
                "Interaction {interaction_id} not found"
            )));
        }
        Ok(())
    }

    async fn record_call_failed(&self, failure: CallFailure) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("Failed to begin call failure transaction"))?;

        sqlx::query(
            r#"
            UPDATE interaction_logs
            SET status = $2,
                outcome = $3,
                ended_at = $4,
                error = COALESCE(error, '{}'::jsonb) || $5::jsonb,
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(failure.interaction_id.to_uuid())
        .bind(InteractionStatus::Failed.as_str())
        .bind(OUTCOME_FAILED)
        .bind(failure.failed_at)
        .bind(json!({ "message": failure.message }))
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to record failed interaction"))?;

        // Terminal statuses set concurrently keep their status and schedule.
        let patch = json!({
            META_LAST_CALL_ERROR_AT: failure.failed_at.to_rfc3339(),
            META_LAST_CALL_ERROR_MESSAGE: failure.message,
        });
        sqlx::query(
            r#"
            UPDATE debt_cases
            SET status = CASE WHEN status IN ('NEW', 'IN_PROGRESS')
                              THEN 'IN_PROGRESS' ELSE status END,
                next_action_at = CASE WHEN status IN ('NEW', 'IN_PROGRESS')
                                      THEN $3 ELSE next_action_at END,
                meta = COALESCE(meta, '{}'::jsonb) || $4::jsonb,
                updated_at = $5
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(failure.case_id.to_uuid())
        .bind(failure.tenant_id.to_uuid())
        .bind(failure.next_action_at)
        .bind(patch)
        .bind(failure.failed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to record call failure on case"))?;

        tx.commit()
            .await
            .map_err(db_err("Failed to commit call failure transaction"))?;

        Ok(())
    }

    async fn get_interaction(
        &self,
        interaction_id: InteractionId,
    ) -> Result<Option<InteractionRecord>> {
        let sql = format!(
            "SELECT {INTERACTION_COLUMNS} FROM interaction_logs WHERE id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(interaction_id.to_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to load interaction"))?;

        row.as_ref().map(Self::map_interaction).transpose()
    }
}
