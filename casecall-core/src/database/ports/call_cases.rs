use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    CallCase, CaseId, DebtorId, InteractionId, InteractionRecord, TenantId,
};
use crate::error::Result;

/// Terminal outcome for a case whose debtor cannot be reached.
#[derive(Debug, Clone)]
pub struct InvalidContact {
    pub tenant_id: TenantId,
    pub case_id: CaseId,
    pub debtor_id: DebtorId,
    /// Stored under `invalid_contact_reason`.
    pub reason: String,
    pub summary: String,
    pub error_message: String,
    pub at: DateTime<Utc>,
}

/// Durable intent written before the external call is placed.
#[derive(Debug, Clone)]
pub struct CallAttempt {
    pub tenant_id: TenantId,
    pub case_id: CaseId,
    pub debtor_id: DebtorId,
    pub started_at: DateTime<Utc>,
    pub next_action_at: DateTime<Utc>,
}

/// Failure of the external call after the attempt was persisted.
#[derive(Debug, Clone)]
pub struct CallFailure {
    pub tenant_id: TenantId,
    pub case_id: CaseId,
    pub interaction_id: InteractionId,
    pub message: String,
    pub failed_at: DateTime<Utc>,
    pub next_action_at: DateTime<Utc>,
}

/// Storage operations performed by the call worker.
#[async_trait]
pub trait CallCaseRepository: Send + Sync {
    /// Load a case scoped to its tenant together with the debtor phone and
    /// contact policy.
    async fn load_call_case(
        &self,
        tenant_id: TenantId,
        case_id: CaseId,
    ) -> Result<Option<CallCase>>;

    /// Move the case to `INVALID_CONTACT`, clear `next_action_at`, record the
    /// reason in metadata, and create a `failed` interaction. Atomic.
    async fn mark_invalid_contact(
        &self,
        update: InvalidContact,
    ) -> Result<InteractionRecord>;

    /// Create a `queued` interaction and move the case to `IN_PROGRESS` with
    /// `last_contacted_at` and the new cooldown. Atomic; committed before the
    /// call is placed.
    async fn begin_call_attempt(
        &self,
        attempt: CallAttempt,
    ) -> Result<InteractionRecord>;

    /// Provider accepted the call: interaction becomes `in_progress`.
    async fn record_call_started(
        &self,
        interaction_id: InteractionId,
        provider_ref: &str,
    ) -> Result<()>;

    /// Provider call failed: interaction becomes `failed`, the case cooldown
    /// is pushed again and the failure is annotated in metadata. The case
    /// is moved back to `IN_PROGRESS` only while it is still active.
    async fn record_call_failed(&self, failure: CallFailure) -> Result<()>;

    async fn get_interaction(
        &self,
        interaction_id: InteractionId,
    ) -> Result<Option<InteractionRecord>>;
}
