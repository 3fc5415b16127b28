//! In-memory implementation of every repository port.
//!
//! Backs the integration tests and local dry runs. One mutex guards the whole
//! state, so a claim's select-and-advance is atomic here the same way the
//! Postgres claim is atomic per transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::database::ports::{
    CallAttempt, CallCaseRepository, CallFailure, DueCase, DueCaseQuery,
    DueCaseRepository, InvalidContact, SyncConnectionRepository,
};
use crate::domain::{
    CALL_CHANNEL_PROVIDER, CallCase, CaseId, CaseMeta, CaseStatus, Channel,
    ConnectionId, ContactPolicy, DebtCase, DebtorId, FlowPolicyId,
    InteractionError, InteractionId, InteractionRecord, InteractionStatus,
    InteractionType, META_INVALID_CONTACT_REASON, META_LAST_CALL_ERROR_AT,
    META_LAST_CALL_ERROR_MESSAGE, OUTCOME_FAILED, TenantId,
};
use crate::error::{CaseCallError, Result};
use crate::scheduling::selection::select_due;

/// Stored state of a property-management connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConnectionState {
    pub status: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    cases: HashMap<CaseId, DebtCase>,
    debtor_phones: HashMap<DebtorId, Option<String>>,
    policies: HashMap<FlowPolicyId, ContactPolicy>,
    interactions: Vec<InteractionRecord>,
    connections: HashMap<ConnectionId, SyncConnectionState>,
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryCaseStore {
    state: Arc<Mutex<MemoryState>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with a database error until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CaseCallError::Database("injected write failure".into()));
        }
        Ok(())
    }

    pub async fn insert_policy(&self, policy: ContactPolicy) {
        self.state.lock().await.policies.insert(policy.id, policy);
    }

    pub async fn insert_debtor(&self, debtor_id: DebtorId, phone: Option<&str>) {
        self.state
            .lock()
            .await
            .debtor_phones
            .insert(debtor_id, phone.map(str::to_string));
    }

    pub async fn insert_case(&self, case: DebtCase) {
        self.state.lock().await.cases.insert(case.id, case);
    }

    pub async fn insert_connection(&self, connection_id: ConnectionId) {
        self.state.lock().await.connections.insert(
            connection_id,
            SyncConnectionState {
                status: "active".into(),
                last_error: None,
            },
        );
    }

    /// Creates a due `NEW` case with its own debtor and call policy.
    pub async fn seed_case(
        &self,
        tenant_id: TenantId,
        phone: Option<&str>,
        call_enabled: bool,
        created_at: DateTime<Utc>,
    ) -> DebtCase {
        let policy = ContactPolicy {
            id: FlowPolicyId::new(),
            ..ContactPolicy::default()
        }
        .with_channel(Channel::Call, call_enabled);
        let debtor_id = DebtorId::new();
        let case = DebtCase {
            id: CaseId::new(),
            tenant_id,
            debtor_id,
            flow_policy_id: policy.id,
            status: CaseStatus::New,
            next_action_at: None,
            last_contacted_at: None,
            created_at,
            meta: CaseMeta::new(),
        };

        let mut state = self.state.lock().await;
        state.policies.insert(policy.id, policy);
        state
            .debtor_phones
            .insert(debtor_id, phone.map(str::to_string));
        state.cases.insert(case.id, case.clone());
        case
    }

    pub async fn update_case<F>(&self, case_id: CaseId, update: F)
    where
        F: FnOnce(&mut DebtCase),
    {
        if let Some(case) = self.state.lock().await.cases.get_mut(&case_id) {
            update(case);
        }
    }

    pub async fn remove_case(&self, case_id: CaseId) {
        self.state.lock().await.cases.remove(&case_id);
    }

    pub async fn case(&self, case_id: CaseId) -> Option<DebtCase> {
        self.state.lock().await.cases.get(&case_id).cloned()
    }

    /// Interactions of one case in creation order.
    pub async fn interactions_for(&self, case_id: CaseId) -> Vec<InteractionRecord> {
        self.state
            .lock()
            .await
            .interactions
            .iter()
            .filter(|record| record.case_id == case_id)
            .cloned()
            .collect()
    }

    pub async fn connection(&self, connection_id: ConnectionId) -> Option<SyncConnectionState> {
        self.state
            .lock()
            .await
            .connections
            .get(&connection_id)
            .cloned()
    }
}

impl MemoryState {
    fn select(&self, query: &DueCaseQuery, now: DateTime<Utc>) -> Vec<DueCase> {
        let candidates = self.cases.values().map(|case| {
            let call_enabled = self
                .policies
                .get(&case.flow_policy_id)
                .is_some_and(|policy| policy.allows(Channel::Call));
            (case, call_enabled)
        });
        select_due(candidates, query, now)
    }

    fn case_mut(&mut self, tenant_id: TenantId, case_id: CaseId) -> Result<&mut DebtCase> {
        self.cases
            .get_mut(&case_id)
            .filter(|case| case.tenant_id == tenant_id)
            .ok_or_else(|| CaseCallError::NotFound(format!("Debt case {case_id} not found")))
    }

    fn interaction_mut(&mut self, id: InteractionId) -> Result<&mut InteractionRecord> {
        self.interactions
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| CaseCallError::NotFound(format!("Interaction {id} not found")))
    }
}

fn new_call_interaction(
    tenant_id: TenantId,
    case_id: CaseId,
    debtor_id: DebtorId,
    status: InteractionStatus,
    created_at: DateTime<Utc>,
) -> InteractionRecord {
    InteractionRecord {
        id: InteractionId::new(),
        tenant_id,
        case_id,
        debtor_id,
        kind: InteractionType::Call,
        status,
        channel_provider: CALL_CHANNEL_PROVIDER.to_string(),
        provider_ref: None,
        outcome: None,
        summary: None,
        error: None,
        started_at: None,
        ended_at: None,
        created_at,
    }
}

#[async_trait]
impl DueCaseRepository for InMemoryCaseStore {
    async fn list_due(&self, query: &DueCaseQuery) -> Result<Vec<DueCase>> {
        Ok(self.state.lock().await.select(query, Utc::now()))
    }

    async fn claim_due(
        &self,
        query: &DueCaseQuery,
        cooldown: Duration,
    ) -> Result<Vec<DueCase>> {
        self.check_writable()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let claimed = state.select(query, now);
        for due in &claimed {
            if let Some(case) = state.cases.get_mut(&due.case_id) {
                case.next_action_at = Some(now + cooldown);
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl CallCaseRepository for InMemoryCaseStore {
    async fn load_call_case(
        &self,
        tenant_id: TenantId,
        case_id: CaseId,
    ) -> Result<Option<CallCase>> {
        let state = self.state.lock().await;
        let Some(case) = state
            .cases
            .get(&case_id)
            .filter(|case| case.tenant_id == tenant_id)
        else {
            return Ok(None);
        };

        Ok(Some(CallCase {
            debtor_phone: state.debtor_phones.get(&case.debtor_id).cloned().flatten(),
            policy: state.policies.get(&case.flow_policy_id).cloned(),
            case: case.clone(),
        }))
    }

    async fn mark_invalid_contact(
        &self,
        update: InvalidContact,
    ) -> Result<InteractionRecord> {
        self.check_writable()?;
        let mut state = self.state.lock().await;

        let case = state.case_mut(update.tenant_id, update.case_id)?;
        case.status = CaseStatus::InvalidContact;
        case.next_action_at = None;
        case.meta.insert(META_INVALID_CONTACT_REASON, update.reason);

        let mut record = new_call_interaction(
            update.tenant_id,
            update.case_id,
            update.debtor_id,
            InteractionStatus::Failed,
            update.at,
        );
        record.outcome = Some(OUTCOME_FAILED.to_string());
        record.summary = Some(update.summary);
        record.error = Some(InteractionError::new(update.error_message));
        state.interactions.push(record.clone());
        Ok(record)
    }

    async fn begin_call_attempt(
        &self,
        attempt: CallAttempt,
    ) -> Result<InteractionRecord> {
        self.check_writable()?;
        let mut state = self.state.lock().await;

        let case = state.case_mut(attempt.tenant_id, attempt.case_id)?;
        case.status = CaseStatus::InProgress;
        case.last_contacted_at = Some(attempt.started_at);
        case.next_action_at = Some(attempt.next_action_at);

        let mut record = new_call_interaction(
            attempt.tenant_id,
            attempt.case_id,
            attempt.debtor_id,
            InteractionStatus::Queued,
            attempt.started_at,
        );
        record.started_at = Some(attempt.started_at);
        state.interactions.push(record.clone());
        Ok(record)
    }

    async fn record_call_started(
        &self,
        interaction_id: InteractionId,
        provider_ref: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let record = state.interaction_mut(interaction_id)?;
        record.provider_ref = Some(provider_ref.to_string());
        record.status = InteractionStatus::InProgress;
        Ok(())
    }

    async fn record_call_failed(&self, failure: CallFailure) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;

        let record = state.interaction_mut(failure.interaction_id)?;
        record.status = InteractionStatus::Failed;
        record.outcome = Some(OUTCOME_FAILED.to_string());
        record.ended_at = Some(failure.failed_at);
        record.error = Some(InteractionError::new(failure.message.clone()));

        let case = state.case_mut(failure.tenant_id, failure.case_id)?;
        if case.status.is_active() {
            case.status = CaseStatus::InProgress;
            case.next_action_at = Some(failure.next_action_at);
        }
        case.meta
            .insert(META_LAST_CALL_ERROR_AT, failure.failed_at.to_rfc3339());
        case.meta.insert(META_LAST_CALL_ERROR_MESSAGE, failure.message);
        Ok(())
    }

    async fn get_interaction(
        &self,
        interaction_id: InteractionId,
    ) -> Result<Option<InteractionRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .interactions
            .iter()
            .find(|record| record.id == interaction_id)
            .cloned())
    }
}

#[async_trait]
impl SyncConnectionRepository for InMemoryCaseStore {
    async fn mark_error(
        &self,
        connection_id: ConnectionId,
        message: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let connection = state.connections.get_mut(&connection_id).ok_or_else(|| {
            CaseCallError::NotFound(format!("Sync connection {connection_id} not found"))
        })?;
        connection.status = "error".into();
        connection.last_error = Some(message.to_string());
        Ok(())
    }
}
