use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaseCallError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Call provider rejected request: {status} {body}")]
    CallProvider { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signature error: {0}")]
    Signature(#[from] crate::calling::context::SignatureError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CaseCallError {
    /// Jobs failing with these errors should be surfaced to the queue's retry
    /// policy rather than absorbed by business logic.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CaseCallError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CaseCallError>;
