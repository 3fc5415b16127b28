use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CaseId, DebtorId, FlowPolicyId, TenantId};
use super::policy::ContactPolicy;

/// Metadata key recording why a case was moved to `INVALID_CONTACT`.
pub const META_INVALID_CONTACT_REASON: &str = "invalid_contact_reason";
/// Metadata key holding the RFC 3339 timestamp of the last failed call.
pub const META_LAST_CALL_ERROR_AT: &str = "last_call_error_at";
/// Metadata key holding the message of the last failed call.
pub const META_LAST_CALL_ERROR_MESSAGE: &str = "last_call_error_message";
/// Metadata key identifying where a case was created from.
pub const META_SOURCE: &str = "source";
/// `source` value marking synthetic cases created from the demo UI.
pub const DEMO_SOURCE: &str = "demo-ui";

/// Reason recorded when the debtor has no phone number on file.
pub const MISSING_PHONE_REASON: &str = "missing_phone";

/// Lifecycle status of a debt case.
///
/// Only the pre-terminal states and `INVALID_CONTACT` are driven by this
/// crate; any other status read from storage is carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CaseStatus {
    New,
    InProgress,
    InvalidContact,
    Other(String),
}

impl CaseStatus {
    /// Statuses eligible for scheduling.
    pub const ACTIVE: [CaseStatus; 2] = [CaseStatus::New, CaseStatus::InProgress];

    pub fn as_str(&self) -> &str {
        match self {
            CaseStatus::New => "NEW",
            CaseStatus::InProgress => "IN_PROGRESS",
            CaseStatus::InvalidContact => "INVALID_CONTACT",
            CaseStatus::Other(other) => other.as_str(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, CaseStatus::New | CaseStatus::InProgress)
    }
}

impl FromStr for CaseStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NEW" => CaseStatus::New,
            "IN_PROGRESS" => CaseStatus::InProgress,
            "INVALID_CONTACT" => CaseStatus::InvalidContact,
            other => CaseStatus::Other(other.to_string()),
        })
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar value stored in the case metadata map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl MetaValue {
    /// Converts a JSON value, returning `None` for arrays and objects.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(MetaValue::Null),
            serde_json::Value::Bool(b) => Some(MetaValue::Bool(b)),
            serde_json::Value::Number(n) => Some(MetaValue::Number(n)),
            serde_json::Value::String(s) => Some(MetaValue::String(s)),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::String(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::String(value)
    }
}

/// Open key/value extension point on a case.
///
/// Writers only ever merge a patch of keys into the stored map, so keys owned
/// by other parts of the system survive. Nested values are not represented.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseMeta(pub BTreeMap<String, MetaValue>);

impl CaseMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lenient decode from a JSONB column: non-object input yields an empty
    /// map, nested entries are dropped.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self(
                map.into_iter()
                    .filter_map(|(k, v)| MetaValue::from_json(v).map(|v| (k, v)))
                    .collect(),
            ),
            _ => Self::default(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or(serde_json::Value::Null)
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Applies every key from `patch`, overwriting existing values.
    pub fn merge(&mut self, patch: &CaseMeta) {
        for (key, value) in &patch.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn is_demo(&self) -> bool {
        self.get(META_SOURCE).and_then(MetaValue::as_str) == Some(DEMO_SOURCE)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Debt case row as seen by the scheduler and the call worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DebtCase {
    pub id: CaseId,
    pub tenant_id: TenantId,
    pub debtor_id: DebtorId,
    pub flow_policy_id: FlowPolicyId,
    pub status: CaseStatus,
    /// `None` means the case is due immediately.
    pub next_action_at: Option<DateTime<Utc>>,
    pub last_contacted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub meta: CaseMeta,
}

impl DebtCase {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_action_at.is_none_or(|at| at <= now)
    }
}

/// A case joined with the contact information the call worker needs.
#[derive(Debug, Clone)]
pub struct CallCase {
    pub case: DebtCase,
    pub debtor_phone: Option<String>,
    pub policy: Option<ContactPolicy>,
}

impl CallCase {
    /// Phone number usable as a call destination; blank values count as
    /// missing.
    pub fn reachable_phone(&self) -> Option<&str> {
        self.debtor_phone
            .as_deref()
            .map(str::trim)
            .filter(|phone| !phone.is_empty())
    }
}
