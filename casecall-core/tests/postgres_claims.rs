#![cfg(feature = "postgres-tests")]
//! Claim transaction and call-case writes against a real Postgres.

use std::collections::HashSet;

use anyhow::Result;
use casecall_core::database::PostgresDatabase;
use casecall_core::database::ports::{
    CallAttempt, CallCaseRepository, CallFailure, DueCaseQuery, DueCaseRepository,
    SyncConnectionRepository,
};
use casecall_core::domain::{
    CaseId, CaseStatus, ConnectionId, DebtorId, InteractionStatus, TenantId,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

struct Seeded {
    case_id: CaseId,
    debtor_id: DebtorId,
}

async fn seed_case(
    pool: &PgPool,
    tenant: TenantId,
    phone: Option<&str>,
    call_enabled: bool,
    created_at: DateTime<Utc>,
    meta: serde_json::Value,
) -> Result<Seeded> {
    let policy_id = Uuid::new_v4();
    let debtor_id = Uuid::new_v4();
    let case_id = Uuid::new_v4();

    sqlx::query("INSERT INTO flow_policies (id, tenant_id, channels) VALUES ($1, $2, $3)")
        .bind(policy_id)
        .bind(tenant.to_uuid())
        .bind(json!({ "call": call_enabled }))
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO debtors (id, tenant_id, phone) VALUES ($1, $2, $3)")
        .bind(debtor_id)
        .bind(tenant.to_uuid())
        .bind(phone)
        .execute(pool)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO debt_cases (id, tenant_id, debtor_id, flow_policy_id, status, meta, created_at)
        VALUES ($1, $2, $3, $4, 'NEW', $5, $6)
        "#,
    )
    .bind(case_id)
    .bind(tenant.to_uuid())
    .bind(debtor_id)
    .bind(policy_id)
    .bind(meta)
    .bind(created_at)
    .execute(pool)
    .await?;

    Ok(Seeded {
        case_id: CaseId(case_id),
        debtor_id: DebtorId(debtor_id),
    })
}

async fn next_action_at(pool: &PgPool, case_id: CaseId) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query("SELECT next_action_at FROM debt_cases WHERE id = $1")
        .bind(case_id.to_uuid())
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("next_action_at")?)
}

#[sqlx::test(migrator = "casecall_core::MIGRATOR")]
async fn list_due_caps_each_tenant_and_skips_ineligible_rows(pool: PgPool) -> Result<()> {
    let db = PostgresDatabase::from_pool(pool.clone(), 5);
    let busy = TenantId::new();
    let quiet = TenantId::new();
    let base = Utc::now() - Duration::hours(2);

    let mut busy_cases = Vec::new();
    for i in 0..4 {
        let seeded = seed_case(&pool, busy, Some("+1555"), true, base + Duration::seconds(i), json!({})).await?;
        busy_cases.push(seeded.case_id);
    }
    let quiet_case = seed_case(&pool, quiet, Some("+1555"), true, base, json!({})).await?;
    seed_case(&pool, quiet, Some("+1555"), false, base, json!({})).await?;
    seed_case(&pool, quiet, Some("+1555"), true, base, json!({ "source": "demo-ui" })).await?;

    let due = db
        .due_cases()
        .list_due(&DueCaseQuery {
            per_tenant_limit: 2,
            ..DueCaseQuery::default()
        })
        .await?;

    let ids: Vec<CaseId> = due.iter().map(|d| d.case_id).collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&busy_cases[0]));
    assert!(ids.contains(&busy_cases[1]));
    assert!(ids.contains(&quiet_case.case_id));

    let with_demo = db
        .due_cases()
        .list_due(&DueCaseQuery {
            tenant_id: Some(quiet),
            include_demo: true,
            ..DueCaseQuery::default()
        })
        .await?;
    assert_eq!(with_demo.len(), 2);
    Ok(())
}

#[sqlx::test(migrator = "casecall_core::MIGRATOR")]
async fn claim_pushes_cooldown_and_hides_claimed_cases(pool: PgPool) -> Result<()> {
    let db = PostgresDatabase::from_pool(pool.clone(), 5);
    let tenant = TenantId::new();
    let seeded = seed_case(&pool, tenant, Some("+1555"), true, Utc::now(), json!({})).await?;

    let before = Utc::now();
    let claimed = db
        .due_cases()
        .claim_due(&DueCaseQuery::default(), Duration::minutes(360))
        .await?;
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].case_id, seeded.case_id);

    let next = next_action_at(&pool, seeded.case_id).await?.expect("cooldown set");
    assert!(next >= before + Duration::minutes(359));
    assert!(next <= Utc::now() + Duration::minutes(361));

    let again = db
        .due_cases()
        .claim_due(&DueCaseQuery::default(), Duration::minutes(360))
        .await?;
    assert!(again.is_empty());
    Ok(())
}

#[sqlx::test(migrator = "casecall_core::MIGRATOR")]
async fn concurrent_claims_are_disjoint(pool: PgPool) -> Result<()> {
    let db = PostgresDatabase::from_pool(pool.clone(), 10);
    let tenant = TenantId::new();
    let base = Utc::now() - Duration::hours(1);
    for i in 0..20 {
        seed_case(&pool, tenant, Some("+1555"), true, base + Duration::seconds(i), json!({})).await?;
    }

    let query = DueCaseQuery {
        limit: 8,
        per_tenant_limit: 8,
        ..DueCaseQuery::default()
    };
    let claims = futures::future::join_all((0..4).map(|_| {
        let repo = db.due_cases().clone();
        let query = query.clone();
        async move { repo.claim_due(&query, Duration::minutes(30)).await }
    }))
    .await;

    let mut seen = HashSet::new();
    let mut total = 0;
    for claim in claims {
        for due in claim? {
            total += 1;
            assert!(seen.insert(due.case_id), "case {} claimed twice", due.case_id);
        }
    }
    assert_eq!(total, seen.len());
    assert!(total <= 20);
    Ok(())
}

#[sqlx::test(migrator = "casecall_core::MIGRATOR")]
async fn call_failure_keeps_terminal_status_set_meanwhile(pool: PgPool) -> Result<()> {
    let db = PostgresDatabase::from_pool(pool.clone(), 5);
    let tenant = TenantId::new();
    let seeded = seed_case(&pool, tenant, Some("+1555"), true, Utc::now(), json!({ "keep": "me" })).await?;
    let now = Utc::now();

    let interaction = db
        .call_cases()
        .begin_call_attempt(CallAttempt {
            tenant_id: tenant,
            case_id: seeded.case_id,
            debtor_id: seeded.debtor_id,
            started_at: now,
            next_action_at: now + Duration::minutes(360),
        })
        .await?;
    assert_eq!(interaction.status, InteractionStatus::Queued);

    sqlx::query("UPDATE debt_cases SET status = 'PAID', next_action_at = NULL WHERE id = $1")
        .bind(seeded.case_id.to_uuid())
        .execute(&pool)
        .await?;

    db.call_cases()
        .record_call_failed(CallFailure {
            tenant_id: tenant,
            case_id: seeded.case_id,
            interaction_id: interaction.id,
            message: "provider rejected".into(),
            failed_at: now,
            next_action_at: now + Duration::minutes(360),
        })
        .await?;

    let case = db
        .call_cases()
        .load_call_case(tenant, seeded.case_id)
        .await?
        .expect("case exists");
    assert_eq!(case.case.status, CaseStatus::Other("PAID".into()));
    assert_eq!(case.case.next_action_at, None);
    assert!(case.case.meta.get("keep").is_some());
    assert!(case.case.meta.get("last_call_error_message").is_some());

    let stored = db
        .call_cases()
        .get_interaction(interaction.id)
        .await?
        .expect("interaction exists");
    assert_eq!(stored.status, InteractionStatus::Failed);
    assert_eq!(stored.outcome.as_deref(), Some("FAILED"));
    assert!(stored.ended_at.is_some());
    Ok(())
}

#[sqlx::test(migrator = "casecall_core::MIGRATOR")]
async fn mark_error_updates_connection(pool: PgPool) -> Result<()> {
    let db = PostgresDatabase::from_pool(pool.clone(), 5);
    let connection = ConnectionId::new();
    sqlx::query("INSERT INTO pms_connections (id, tenant_id) VALUES ($1, $2)")
        .bind(connection.to_uuid())
        .bind(Uuid::new_v4())
        .execute(&pool)
        .await?;

    db.sync_connections()
        .mark_error(connection, "sync exploded")
        .await?;

    let row = sqlx::query("SELECT status, last_error FROM pms_connections WHERE id = $1")
        .bind(connection.to_uuid())
        .fetch_one(&pool)
        .await?;
    let status: String = row.try_get("status")?;
    let last_error: serde_json::Value = row.try_get("last_error")?;
    assert_eq!(status, "error");
    assert_eq!(last_error["message"], "sync exploded");
    Ok(())
}
