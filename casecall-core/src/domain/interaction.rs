use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CaseId, DebtorId, InteractionId, TenantId};

/// Provider recorded on call interactions.
pub const CALL_CHANNEL_PROVIDER: &str = "twilio";

/// Lifecycle of one contact attempt.
///
/// `Queued` is written before the external call is placed; the attempt then
/// moves to `InProgress` (provider accepted the call) or `Failed`. Later
/// statuses are written by the callback receiver and are carried through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InteractionStatus {
    Queued,
    InProgress,
    Failed,
    Other(String),
}

impl InteractionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            InteractionStatus::Queued => "queued",
            InteractionStatus::InProgress => "in_progress",
            InteractionStatus::Failed => "failed",
            InteractionStatus::Other(other) => other.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InteractionStatus::Queued | InteractionStatus::InProgress)
    }
}

impl FromStr for InteractionStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => InteractionStatus::Queued,
            "in_progress" => InteractionStatus::InProgress,
            "failed" => InteractionStatus::Failed,
            other => InteractionStatus::Other(other.to_string()),
        })
    }
}

impl fmt::Display for InteractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionType {
    Call,
}

impl InteractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::Call => "CALL",
        }
    }
}

/// Free-form error detail stored on an interaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionError {
    pub message: String,
}

impl InteractionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Durable record of one contact attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionRecord {
    pub id: InteractionId,
    pub tenant_id: TenantId,
    pub case_id: CaseId,
    pub debtor_id: DebtorId,
    pub kind: InteractionType,
    pub status: InteractionStatus,
    pub channel_provider: String,
    pub provider_ref: Option<String>,
    pub outcome: Option<String>,
    pub summary: Option<String>,
    pub error: Option<InteractionError>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Outcome value written alongside a `failed` status.
pub const OUTCOME_FAILED: &str = "FAILED";
