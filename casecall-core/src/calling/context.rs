//! Signed call context handed to the voice callback.
//!
//! The callback URL carries `il` (interaction id), `exp` (unix seconds),
//! `v` (scheme version) and `sig`, an HMAC-SHA-256 over
//! `interactionId|tenantId|caseId|exp|version`, base64url without padding.
//! The receiver re-derives the signature from the case it resolves through
//! the interaction id; nothing else is shared.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use url::Url;
use zeroize::Zeroizing;

use crate::domain::{CaseId, InteractionId, TenantId};

type HmacSha256 = Hmac<Sha256>;

pub const PARAM_INTERACTION: &str = "il";
pub const PARAM_EXPIRES: &str = "exp";
pub const PARAM_VERSION: &str = "v";
pub const PARAM_SIGNATURE: &str = "sig";

pub const DEFAULT_SIGNATURE_VERSION: &str = "1";
pub const DEFAULT_CONTEXT_TTL_SECONDS: i64 = 600;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("context signing secret must not be empty")]
    EmptySecret,
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("invalid callback url: {0}")]
    InvalidUrl(String),
    #[error("missing context parameter `{0}`")]
    MissingParam(&'static str),
    #[error("invalid context parameter `{0}`")]
    InvalidParam(&'static str),
    #[error("unsupported signature version {0}")]
    UnsupportedVersion(String),
    #[error("call context expired")]
    Expired,
    #[error("call context signature mismatch")]
    Mismatch,
}

/// Context parameters as read back from a callback URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedContextParams {
    pub interaction_id: String,
    pub expires_at: i64,
    pub version: String,
    pub signature: String,
}

impl SignedContextParams {
    pub fn from_url(url: &Url) -> Result<Self, SignatureError> {
        let find = |name: &'static str| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
                .ok_or(SignatureError::MissingParam(name))
        };

        Ok(Self {
            interaction_id: find(PARAM_INTERACTION)?,
            expires_at: find(PARAM_EXPIRES)?
                .parse()
                .map_err(|_| SignatureError::InvalidParam(PARAM_EXPIRES))?,
            version: find(PARAM_VERSION)?,
            signature: find(PARAM_SIGNATURE)?,
        })
    }
}

pub struct ContextSigner {
    secret: Zeroizing<Vec<u8>>,
    ttl: Duration,
    version: String,
}

impl fmt::Debug for ContextSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSigner")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .field("version", &self.version)
            .finish()
    }
}

impl ContextSigner {
    pub fn new(
        secret: impl AsRef<[u8]>,
        ttl: Duration,
        version: impl Into<String>,
    ) -> Result<Self, SignatureError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(SignatureError::EmptySecret);
        }
        Ok(Self {
            secret: Zeroizing::new(secret.to_vec()),
            ttl,
            version: version.into(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn signature(
        &self,
        interaction_id: &str,
        tenant_id: TenantId,
        case_id: CaseId,
        expires_at: i64,
        version: &str,
    ) -> Result<String, SignatureError> {
        let payload = format!("{interaction_id}|{tenant_id}|{case_id}|{expires_at}|{version}");
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    pub fn sign(
        &self,
        interaction_id: InteractionId,
        tenant_id: TenantId,
        case_id: CaseId,
        now: DateTime<Utc>,
    ) -> Result<SignedContextParams, SignatureError> {
        let interaction_id = interaction_id.to_string();
        let expires_at = now.timestamp() + self.ttl.num_seconds();
        let signature =
            self.signature(&interaction_id, tenant_id, case_id, expires_at, &self.version)?;
        Ok(SignedContextParams {
            interaction_id,
            expires_at,
            version: self.version.clone(),
            signature,
        })
    }

    /// `base_url` with the context parameters set, replacing any existing
    /// values for the same names.
    pub fn signed_url(
        &self,
        base_url: &str,
        interaction_id: InteractionId,
        tenant_id: TenantId,
        case_id: CaseId,
        now: DateTime<Utc>,
    ) -> Result<Url, SignatureError> {
        let mut url =
            Url::parse(base_url).map_err(|e| SignatureError::InvalidUrl(e.to_string()))?;
        let params = self.sign(interaction_id, tenant_id, case_id, now)?;

        let expires_at = params.expires_at.to_string();
        let reserved = [PARAM_INTERACTION, PARAM_EXPIRES, PARAM_VERSION, PARAM_SIGNATURE];
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !reserved.iter().any(|name| key == name))
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair(PARAM_INTERACTION, &params.interaction_id)
            .append_pair(PARAM_EXPIRES, &expires_at)
            .append_pair(PARAM_VERSION, &params.version)
            .append_pair(PARAM_SIGNATURE, &params.signature);
        Ok(url)
    }

    /// Checks version, expiry and signature of callback parameters against
    /// the tenant and case the interaction belongs to.
    pub fn verify(
        &self,
        params: &SignedContextParams,
        tenant_id: TenantId,
        case_id: CaseId,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        if params.version != self.version {
            return Err(SignatureError::UnsupportedVersion(params.version.clone()));
        }
        if now.timestamp() > params.expires_at {
            return Err(SignatureError::Expired);
        }

        let expected = self.signature(
            &params.interaction_id,
            tenant_id,
            case_id,
            params.expires_at,
            &params.version,
        )?;
        if !constant_time_eq(expected.as_bytes(), params.signature.as_bytes()) {
            return Err(SignatureError::Mismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn signer(secret: &str) -> ContextSigner {
        ContextSigner::new(secret, Duration::seconds(600), "1").unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn signed_url_round_trips_through_verify() {
        let signer = signer("s3cret");
        let (interaction, tenant, case) = (InteractionId::new(), TenantId::new(), CaseId::new());

        let url = signer
            .signed_url("https://voice.example.com/twiml?lang=es", interaction, tenant, case, now())
            .unwrap();
        let params = SignedContextParams::from_url(&url).unwrap();

        assert_eq!(params.interaction_id, interaction.to_string());
        assert_eq!(params.expires_at, now().timestamp() + 600);
        assert_eq!(params.signature.len(), 43);
        assert!(url.query_pairs().any(|(k, v)| k == "lang" && v == "es"));
        signer.verify(&params, tenant, case, now() + Duration::seconds(599)).unwrap();
    }

    #[test]
    fn rejects_expired_context() {
        let signer = signer("s3cret");
        let (tenant, case) = (TenantId::new(), CaseId::new());
        let params = signer.sign(InteractionId::new(), tenant, case, now()).unwrap();

        assert_eq!(
            signer.verify(&params, tenant, case, now() + Duration::seconds(601)),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn rejects_wrong_secret_and_tampered_payload() {
        let (tenant, case) = (TenantId::new(), CaseId::new());
        let params = signer("s3cret").sign(InteractionId::new(), tenant, case, now()).unwrap();

        assert_eq!(
            signer("other").verify(&params, tenant, case, now()),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            signer("s3cret").verify(&params, TenantId::new(), case, now()),
            Err(SignatureError::Mismatch)
        );

        let mut extended = params.clone();
        extended.expires_at += 3600;
        assert_eq!(
            signer("s3cret").verify(&extended, tenant, case, now()),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_unknown_version_and_empty_secret() {
        let (tenant, case) = (TenantId::new(), CaseId::new());
        let mut params = signer("k").sign(InteractionId::new(), tenant, case, now()).unwrap();
        params.version = "2".into();
        assert!(matches!(
            signer("k").verify(&params, tenant, case, now()),
            Err(SignatureError::UnsupportedVersion(_))
        ));
        assert!(matches!(
            ContextSigner::new("", Duration::seconds(1), "1"),
            Err(SignatureError::EmptySecret)
        ));
    }

    #[test]
    fn missing_parameter_is_reported() {
        let url = Url::parse("https://voice.example.com/twiml?il=x&exp=1&v=1").unwrap();
        assert_eq!(
            SignedContextParams::from_url(&url),
            Err(SignatureError::MissingParam("sig"))
        );
    }
}
