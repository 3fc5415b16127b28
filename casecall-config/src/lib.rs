//! Configuration for the casecall binaries.
//!
//! Everything is read from the process environment (optionally seeded from a
//! `.env` file). Values that the scheduler and the workers share live on
//! [`CaseCallConfig`]; the credentials only the worker needs are validated
//! separately by [`CaseCallConfig::worker_secrets`] so that `schedule` can run
//! without them.

pub mod error;
pub mod models;
pub mod sources;
pub mod util;

pub use error::ConfigError;
pub use models::*;
pub use sources::EnvConfig;
