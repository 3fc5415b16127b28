//! Persistence ports and their adapters.

pub mod memory;
pub mod ports;
pub mod postgres;

pub use memory::InMemoryCaseStore;
pub use postgres::PostgresDatabase;
