//! Postgres adapters for the repository ports.

mod call_cases;
mod due_cases;
mod sync_connections;

pub use call_cases::PostgresCallCaseRepository;
pub use due_cases::PostgresDueCaseRepository;
pub use sync_connections::PostgresSyncConnectionRepository;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

use crate::error::{CaseCallError, Result};
use crate::workers::Closeable;

/// Shared connection pool plus the repositories built on it.
#[derive(Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
    max_connections: u32,
    due_cases: PostgresDueCaseRepository,
    call_cases: PostgresCallCaseRepository,
    sync_connections: PostgresSyncConnectionRepository,
}

impl fmt::Debug for PostgresDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresDatabase")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("max_connections", &self.max_connections)
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

impl PostgresDatabase {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| {
                CaseCallError::Database(format!("Database connection failed: {e}"))
            })?;

        info!(max_connections, "Database pool initialized");
        Ok(Self::from_pool(pool, max_connections))
    }

    pub fn from_pool(pool: PgPool, max_connections: u32) -> Self {
        Self {
            due_cases: PostgresDueCaseRepository::new(pool.clone()),
            call_cases: PostgresCallCaseRepository::new(pool.clone()),
            sync_connections: PostgresSyncConnectionRepository::new(pool.clone()),
            pool,
            max_connections,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn due_cases(&self) -> &PostgresDueCaseRepository {
        &self.due_cases
    }

    pub fn call_cases(&self) -> &PostgresCallCaseRepository {
        &self.call_cases
    }

    pub fn sync_connections(&self) -> &PostgresSyncConnectionRepository {
        &self.sync_connections
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> Result<()> {
        crate::MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| CaseCallError::Database(format!("Migration failed: {e}")))?;
        info!("Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl Closeable for PostgresDatabase {
    fn resource_name(&self) -> &str {
        "postgres"
    }

    /// Waits for checked-out connections to be returned, then closes the pool.
    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        info!("Database pool closed");
        Ok(())
    }
}

pub(crate) fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> CaseCallError {
    move |e| CaseCallError::Database(format!("{context}: {e}"))
}
