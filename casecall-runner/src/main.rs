//! # casecall
//!
//! Command line entry point for the outbound call pipeline.
//!
//! - `casecall schedule` claims due cases and enqueues one call job per case
//! - `casecall work` runs the queue consumers until SIGINT or SIGTERM
//! - `casecall db migrate` applies the bundled schema migrations

mod schedule;
mod signals;
mod work;

use std::sync::Arc;

use anyhow::Context;
use casecall_config::CaseCallConfig;
use casecall_core::database::PostgresDatabase;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "casecall")]
#[command(about = "Claims due debt cases, dispatches call jobs and runs the call workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler once and exit
    Schedule(ScheduleArgs),
    /// Start the worker pool and block until a shutdown signal
    Work,
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

/// Overrides for the `SCHEDULER_*` environment settings.
#[derive(ClapArgs, Debug, Clone, Default)]
pub(crate) struct ScheduleArgs {
    /// List what would be claimed without claiming or enqueueing anything
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Restrict the run to one tenant
    #[arg(long)]
    tenant: Option<uuid::Uuid>,

    /// Maximum number of cases claimed in this run
    #[arg(long)]
    limit: Option<u32>,

    /// Maximum number of cases claimed per tenant
    #[arg(long)]
    per_tenant_limit: Option<u32>,

    /// Minutes before a claimed case becomes due again
    #[arg(long)]
    cooldown_minutes: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = CaseCallConfig::from_env().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,casecall=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Schedule(args) => schedule::run(&config, &args).await,
        Command::Work => work::run(&config).await,
        Command::Db(DbCommand::Migrate) => run_db_migrate(&config).await,
    }
}

pub(crate) async fn connect_database(config: &CaseCallConfig) -> anyhow::Result<Arc<PostgresDatabase>> {
    let db = PostgresDatabase::connect(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    Ok(Arc::new(db))
}

async fn run_db_migrate(config: &CaseCallConfig) -> anyhow::Result<()> {
    let db = connect_database(config).await?;
    db.migrate().await.context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}
