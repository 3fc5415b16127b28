//! # CaseCall Core
//!
//! Claim-and-dispatch pipeline for outbound collection calls.
//!
//! ## Overview
//!
//! - **Scheduling**: select due debt cases with per-tenant fairness, claim
//!   them atomically under a cooldown, and enqueue one deduplicated call job
//!   per case
//! - **Calling**: the `CALL_CASE` worker that validates contact data, opens an
//!   interaction record, signs a callback context and places the call
//! - **Workers**: a pool of queue consumers with lock renewal, retries and a
//!   bounded graceful shutdown
//!
//! ## Architecture
//!
//! - [`domain`]: cases, contact policies, interactions and typed ids
//! - [`database`]: repository ports with Postgres and in-memory adapters
//! - [`queue`]: the job queue port with Redis and in-memory adapters
//! - [`scheduling`]: due-case selection, the claim run and dispatch
//! - [`calling`]: signed call context and the call worker
//! - [`providers`]: Twilio call placement and the sync webhook runner
//! - [`workers`]: job handlers, listeners and the [`workers::WorkerPool`]

pub mod calling;
pub mod database;
pub mod domain;
pub mod error;
pub mod providers;
pub mod queue;
pub mod scheduling;
pub mod workers;

pub use error::{CaseCallError, Result};

/// Schema migrations bundled with the crate.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
