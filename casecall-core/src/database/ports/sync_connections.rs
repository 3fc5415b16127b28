use async_trait::async_trait;

use crate::domain::ConnectionId;
use crate::error::Result;

#[async_trait]
pub trait SyncConnectionRepository: Send + Sync {
    /// Flag a property-management connection as unusable after its sync job
    /// failed for good.
    async fn mark_error(
        &self,
        connection_id: ConnectionId,
        message: &str,
    ) -> Result<()>;
}
