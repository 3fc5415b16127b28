use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use zeroize::Zeroizing;

use super::{CallProvider, CallRequest};
use crate::error::{CaseCallError, Result};

pub const DEFAULT_API_BASE: &str = "https://api.twilio.com";

pub struct TwilioCredentials {
    pub account_sid: String,
    pub auth_token: Zeroizing<String>,
    pub from_number: String,
}

impl fmt::Debug for TwilioCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwilioCredentials")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"<redacted>")
            .field("from_number", &self.from_number)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct CreateCallResponse {
    sid: Option<String>,
}

/// Places calls through the Twilio REST API.
#[derive(Debug)]
pub struct TwilioCallProvider {
    client: Client,
    api_base: String,
    credentials: TwilioCredentials,
}

impl TwilioCallProvider {
    pub fn new(credentials: TwilioCredentials, api_base: Option<&str>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CaseCallError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            credentials,
        })
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.api_base, self.credentials.account_sid
        )
    }
}

#[async_trait]
impl CallProvider for TwilioCallProvider {
    async fn place_call(&self, request: &CallRequest) -> Result<String> {
        let form = [
            ("To", request.to.as_str()),
            ("From", self.credentials.from_number.as_str()),
            ("Url", request.callback_url.as_str()),
        ];

        let response = self
            .client
            .post(self.calls_url())
            .basic_auth(
                &self.credentials.account_sid,
                Some(self.credentials.auth_token.as_str()),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| CaseCallError::Transport(format!("Twilio request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CaseCallError::CallProvider {
                status: status.as_u16(),
                body,
            });
        }

        let created: CreateCallResponse = response.json().await.map_err(|e| {
            CaseCallError::Transport(format!("Invalid Twilio response: {e}"))
        })?;
        let sid = created.sid.ok_or_else(|| {
            CaseCallError::Transport("Twilio response did not include a call sid".into())
        })?;

        debug!(call_sid = %sid, "Twilio call created");
        Ok(sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{basic_auth, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CALLS_PATH: &str = "/2010-04-01/Accounts/AC123/Calls.json";

    fn provider(server: &MockServer) -> TwilioCallProvider {
        TwilioCallProvider::new(
            TwilioCredentials {
                account_sid: "AC123".into(),
                auth_token: Zeroizing::new("token".into()),
                from_number: "+15550000".into(),
            },
            Some(&format!("{}/", server.uri())),
        )
        .unwrap()
    }

    fn request() -> CallRequest {
        CallRequest {
            to: "+15550100".into(),
            callback_url: "https://voice.example.com/twiml?il=1".into(),
        }
    }

    #[tokio::test]
    async fn created_call_returns_sid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CALLS_PATH))
            .and(basic_auth("AC123", "token"))
            .and(body_string_contains("To=%2B15550100"))
            .and(body_string_contains("From=%2B15550000"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"sid": "CA42"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let sid = provider(&server).place_call(&request()).await.unwrap();
        assert_eq!(sid, "CA42");
    }

    #[tokio::test]
    async fn non_success_status_keeps_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CALLS_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid To number"))
            .mount(&server)
            .await;

        let err = provider(&server).place_call(&request()).await.unwrap_err();
        match err {
            CaseCallError::CallProvider { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "invalid To number");
            }
            other => panic!("expected a provider error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_without_sid_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let err = provider(&server).place_call(&request()).await.unwrap_err();
        assert!(matches!(err, CaseCallError::Transport(_)));
    }
}
