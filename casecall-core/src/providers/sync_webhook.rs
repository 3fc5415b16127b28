use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::{CaseCallError, Result};
use crate::queue::PmsSyncPayload;
use crate::workers::SyncRunner;

/// Delegates a PMS synchronisation to an external service by POSTing the job
/// payload as JSON. A JSON response body becomes the job result.
#[derive(Debug, Clone)]
pub struct WebhookSyncRunner {
    client: Client,
    url: String,
}

impl WebhookSyncRunner {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CaseCallError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SyncRunner for WebhookSyncRunner {
    async fn run(&self, payload: &PmsSyncPayload) -> Result<Option<serde_json::Value>> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| CaseCallError::Transport(format!("Sync webhook request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CaseCallError::Transport(format!("Sync webhook response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(CaseCallError::Transport(format!(
                "Sync webhook returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        debug!(connection_id = %payload.connection_id, status = status.as_u16(), "Sync webhook accepted");
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str(&body).ok())
    }
}
