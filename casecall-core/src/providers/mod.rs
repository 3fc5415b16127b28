//! Outbound adapters: call placement and the sync webhook.

pub mod sync_webhook;
pub mod twilio;

pub use sync_webhook::WebhookSyncRunner;
pub use twilio::{TwilioCallProvider, TwilioCredentials};

use async_trait::async_trait;

use crate::error::Result;

/// One outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    /// Destination number.
    pub to: String,
    /// Signed voice callback the provider fetches once the call connects.
    pub callback_url: String,
}

/// Places calls. Only "place a call, get a reference back" is used.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallProvider: Send + Sync {
    /// Returns the provider's call reference.
    async fn place_call(&self, request: &CallRequest) -> Result<String>;
}
