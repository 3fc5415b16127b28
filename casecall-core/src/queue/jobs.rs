//! Queue names, job names and payloads.

use serde::{Deserialize, Serialize};

use crate::domain::{CaseId, ConnectionId, TenantId};

pub const CASE_ACTIONS_QUEUE: &str = "case-actions";
pub const PMS_SYNC_QUEUE: &str = "pms-sync";

/// Job names on the `case-actions` queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaseActionJob {
    CallCase,
    /// Reserved; no handler is registered for it yet.
    SyncCallSummary,
}

impl CaseActionJob {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseActionJob::CallCase => "CALL_CASE",
            CaseActionJob::SyncCallSummary => "SYNC_CALL_SUMMARY",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "CALL_CASE" => Some(CaseActionJob::CallCase),
            "SYNC_CALL_SUMMARY" => Some(CaseActionJob::SyncCallSummary),
            _ => None,
        }
    }

    /// `<jobType>-<caseId>`: re-submitting the same case while its job is
    /// pending collapses into one job.
    pub fn job_id(self, case_id: CaseId) -> String {
        format!("{}-{}", self.as_str(), case_id)
    }
}

/// Payload of a `CALL_CASE` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCasePayload {
    pub tenant_id: TenantId,
    pub case_id: CaseId,
}

/// Job name on the `pms-sync` queue.
pub const PMS_SYNC_JOB: &str = "sync";

/// Payload of a `sync` job. Produced outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmsSyncPayload {
    pub connection_id: ConnectionId,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub steps: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_case_payload_uses_camel_case() {
        let payload = CallCasePayload {
            tenant_id: TenantId::new(),
            case_id: CaseId::new(),
        };
        let value = serde_json::to_value(payload).unwrap();
        assert_eq!(value["tenantId"], json!(payload.tenant_id.to_string()));
        assert_eq!(value["caseId"], json!(payload.case_id.to_string()));
    }

    #[test]
    fn job_id_is_derived_from_type_and_case() {
        let case_id = CaseId::new();
        assert_eq!(
            CaseActionJob::CallCase.job_id(case_id),
            format!("CALL_CASE-{case_id}")
        );
        assert_eq!(CaseActionJob::from_name("CALL_CASE"), Some(CaseActionJob::CallCase));
        assert_eq!(CaseActionJob::from_name("OTHER"), None);
    }
}
