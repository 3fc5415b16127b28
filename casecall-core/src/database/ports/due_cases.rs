use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::domain::{CaseId, TenantId};
use crate::error::Result;

pub const DEFAULT_LIMIT: u32 = 500;
pub const DEFAULT_PER_TENANT_LIMIT: u32 = 10;

/// Parameters shared by the read-only due listing and the claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueCaseQuery {
    /// Restrict selection to one tenant.
    pub tenant_id: Option<TenantId>,
    /// Global cap on returned cases.
    pub limit: u32,
    /// Cap applied per tenant before the global cap.
    pub per_tenant_limit: u32,
    /// Keep cases whose `meta.source` marks them as demo data.
    pub include_demo: bool,
}

impl Default for DueCaseQuery {
    fn default() -> Self {
        Self {
            tenant_id: None,
            limit: DEFAULT_LIMIT,
            per_tenant_limit: DEFAULT_PER_TENANT_LIMIT,
            include_demo: false,
        }
    }
}

impl DueCaseQuery {
    /// With a tenant scope the per-tenant cap is meaningless, so the global
    /// limit applies to that tenant instead.
    pub fn effective_per_tenant_limit(&self) -> u32 {
        if self.tenant_id.is_some() {
            self.limit
        } else {
            self.per_tenant_limit
        }
    }
}

/// Identity of a case selected (or claimed) for a call action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DueCase {
    #[serde(rename = "id")]
    pub case_id: CaseId,
    pub tenant_id: TenantId,
}

#[async_trait]
pub trait DueCaseRepository: Send + Sync {
    /// Ranked, fairness-capped list of cases currently eligible for a call.
    /// Never mutates state.
    async fn list_due(&self, query: &DueCaseQuery) -> Result<Vec<DueCase>>;

    /// Same selection as [`list_due`](Self::list_due), but inside one
    /// transaction that skips rows locked by a concurrent claim and pushes
    /// `next_action_at` of every returned case to `now + cooldown`.
    ///
    /// Concurrent claims never return overlapping cases and never block on
    /// each other.
    async fn claim_due(
        &self,
        query: &DueCaseQuery,
        cooldown: Duration,
    ) -> Result<Vec<DueCase>>;
}
