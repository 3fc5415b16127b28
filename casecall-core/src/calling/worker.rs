use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use super::context::ContextSigner;
use crate::database::ports::{CallAttempt, CallCaseRepository, CallFailure, InvalidContact};
use crate::domain::{CaseId, InteractionId, InteractionRecord, MISSING_PHONE_REASON};
use crate::error::{CaseCallError, Result};
use crate::providers::{CallProvider, CallRequest};
use crate::queue::CallCasePayload;

pub const MISSING_PHONE_SUMMARY: &str = "Call not attempted: debtor phone is missing.";
pub const MISSING_PHONE_MESSAGE: &str = "Debtor phone is missing";

/// How a `CALL_CASE` job ended. Every variant completes the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum CallCaseOutcome {
    /// No phone on file; the case is now `INVALID_CONTACT`.
    #[serde(rename_all = "camelCase")]
    InvalidContact {
        case_id: CaseId,
        interaction_id: InteractionId,
    },
    /// The provider accepted the call.
    #[serde(rename_all = "camelCase")]
    Placed {
        case_id: CaseId,
        interaction_id: InteractionId,
        provider_ref: String,
    },
    /// The provider call failed; the case cools down and is retried by the
    /// next due cycle, not by job redelivery.
    #[serde(rename_all = "camelCase")]
    CallFailed {
        case_id: CaseId,
        interaction_id: InteractionId,
        message: String,
    },
}

/// Runs the call state machine for one case.
///
/// The `queued` interaction and the case cooldown are committed before the
/// provider is contacted, so a crash or redelivery after that point cannot
/// lose the attempt record nor make the case immediately selectable again.
pub struct CallCaseWorker {
    cases: Arc<dyn CallCaseRepository>,
    provider: Arc<dyn CallProvider>,
    signer: Arc<ContextSigner>,
    voice_url: String,
    cooldown: Duration,
}

impl std::fmt::Debug for CallCaseWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCaseWorker")
            .field("signer", &self.signer)
            .field("voice_url", &self.voice_url)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

impl CallCaseWorker {
    pub fn new(
        cases: Arc<dyn CallCaseRepository>,
        provider: Arc<dyn CallProvider>,
        signer: Arc<ContextSigner>,
        voice_url: impl Into<String>,
        cooldown: Duration,
    ) -> Self {
        Self {
            cases,
            provider,
            signer,
            voice_url: voice_url.into(),
            cooldown,
        }
    }

    /// Fails only when the case cannot be loaded or the pre-call write
    /// fails; those errors go to the queue's retry policy.
    #[instrument(skip(self), fields(tenant_id = %payload.tenant_id, case_id = %payload.case_id))]
    pub async fn process(&self, payload: CallCasePayload) -> Result<CallCaseOutcome> {
        let CallCasePayload { tenant_id, case_id } = payload;

        let call_case = self
            .cases
            .load_call_case(tenant_id, case_id)
            .await?
            .ok_or_else(|| CaseCallError::NotFound(format!("Debt case {case_id} not found")))?;

        let Some(phone) = call_case.reachable_phone().map(str::to_string) else {
            let record = self
                .cases
                .mark_invalid_contact(InvalidContact {
                    tenant_id,
                    case_id,
                    debtor_id: call_case.case.debtor_id,
                    reason: MISSING_PHONE_REASON.to_string(),
                    summary: MISSING_PHONE_SUMMARY.to_string(),
                    error_message: MISSING_PHONE_MESSAGE.to_string(),
                    at: Utc::now(),
                })
                .await?;
            info!(interaction_id = %record.id, "Debtor phone missing; case marked invalid contact");
            return Ok(CallCaseOutcome::InvalidContact {
                case_id,
                interaction_id: record.id,
            });
        };

        let now = Utc::now();
        let interaction = self
            .cases
            .begin_call_attempt(CallAttempt {
                tenant_id,
                case_id,
                debtor_id: call_case.case.debtor_id,
                started_at: now,
                next_action_at: now + self.cooldown,
            })
            .await?;

        match self.place_call(&phone, &interaction, now).await {
            Ok(provider_ref) => {
                // The call exists now; a redelivered job would dial again.
                if let Err(err) = self
                    .cases
                    .record_call_started(interaction.id, &provider_ref)
                    .await
                {
                    warn!(
                        interaction_id = %interaction.id,
                        provider_ref = %provider_ref,
                        error = %err,
                        "Call placed but interaction could not be updated"
                    );
                }
                info!(interaction_id = %interaction.id, provider_ref = %provider_ref, "Call placed");
                Ok(CallCaseOutcome::Placed {
                    case_id,
                    interaction_id: interaction.id,
                    provider_ref,
                })
            }
            Err(err) => {
                let message = err.to_string();
                error!(
                    tenant_id = %tenant_id,
                    case_id = %case_id,
                    interaction_id = %interaction.id,
                    error = %message,
                    "Call failed after interaction creation"
                );

                // The provider may have partially accepted the call, so the
                // job must complete even if the bookkeeping write fails.
                let failed_at = Utc::now();
                if let Err(write_err) = self
                    .cases
                    .record_call_failed(CallFailure {
                        tenant_id,
                        case_id,
                        interaction_id: interaction.id,
                        message: message.clone(),
                        failed_at,
                        next_action_at: failed_at + self.cooldown,
                    })
                    .await
                {
                    error!(
                        case_id = %case_id,
                        interaction_id = %interaction.id,
                        error = %write_err,
                        "Call failure could not be recorded"
                    );
                }

                Ok(CallCaseOutcome::CallFailed {
                    case_id,
                    interaction_id: interaction.id,
                    message,
                })
            }
        }
    }

    async fn place_call(
        &self,
        phone: &str,
        interaction: &InteractionRecord,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let callback = self.signer.signed_url(
            &self.voice_url,
            interaction.id,
            interaction.tenant_id,
            interaction.case_id,
            now,
        )?;

        self.provider
            .place_call(&CallRequest {
                to: phone.to_string(),
                callback_url: callback.to_string(),
            })
            .await
    }
}
