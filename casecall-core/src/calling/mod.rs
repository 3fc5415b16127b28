//! Call lifecycle: the signed callback context and the `CALL_CASE` worker.

pub mod context;
pub mod worker;

pub use context::{ContextSigner, SignatureError, SignedContextParams};
pub use worker::{CallCaseOutcome, CallCaseWorker};
