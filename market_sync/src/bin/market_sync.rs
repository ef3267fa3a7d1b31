use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use market_data_ingestor::providers::{
    DataProvider, memory::MemoryProvider, tushare::TushareProvider,
};
use market_sync::{
    config::SyncConfig,
    ledger::{RunLedger, SqliteLedger},
    orchestrator::{RunOptions, SyncOrchestrator},
    storage::StorageGateway,
};

#[derive(Parser)]
#[command(version, about = "Market data sync CLI")]
struct Cli {
    /// Run configuration (TOML); defaults apply when omitted.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Refresh reference tables, sync series, compute derived tables.
    Run {
        /// Only process these tables (repeatable).
        #[arg(long, value_name = "TABLE")]
        only: Vec<String>,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show where the next fetch of one instrument would start.
    Plan {
        #[arg(long)]
        table: String,
        #[arg(long)]
        code: String,
    },
    /// Recompute derived tables for one instrument.
    Derive {
        #[arg(long)]
        code: String,
    },
    /// Drop a table so the next run rebuilds it from the epoch.
    Reset { table: String },
    /// Print the last run and its failures.
    Status,
    /// Print the effective catalog.
    Catalog,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load(cli.config.as_deref())?;
    let catalog = config.catalog()?;

    match cli.cmd {
        Cmd::Run { only, json } => {
            let provider: Arc<dyn DataProvider> = Arc::new(
                TushareProvider::from_env(
                    &config.provider.token_env,
                    config.provider.requests_per_minute,
                )
                .context("create provider")?,
            );
            let orchestrator = SyncOrchestrator::open(config, catalog, provider)?;
            let report = orchestrator.run(&RunOptions { only }).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
        }
        Cmd::Plan { table, code } => {
            let orchestrator = offline(config, catalog)?;
            let plan = orchestrator.plan(&table, &code).await?;
            println!("{}", serde_json::to_string(&plan)?);
        }
        Cmd::Derive { code } => {
            let orchestrator = offline(config, catalog)?;
            let mut failed = false;
            for (table, result) in orchestrator.derive_code(&code).await {
                match result {
                    Ok(rows) => println!("{table}: {rows} new rows"),
                    Err(e) => {
                        failed = true;
                        eprintln!("{table}: {e}");
                    }
                }
            }
            if failed {
                bail!("derivation failed for {code}");
            }
        }
        Cmd::Reset { table } => {
            let orchestrator = offline(config, catalog)?;
            orchestrator.reset(&table).await?;
            println!("dropped {table}");
        }
        Cmd::Status => {
            let storage = StorageGateway::connect(&config.database_url, 1)?;
            let mut conn = storage.conn()?;
            market_sync::db::migrate::run_pending(&mut conn)?;
            let ledger = SqliteLedger::new();
            match ledger.last_run(&mut conn)? {
                None => println!("no runs recorded"),
                Some(run) => {
                    println!(
                        "run {} {} started {} finished {}",
                        run.id,
                        run.status,
                        run.started_at,
                        run.finished_at.as_deref().unwrap_or("-")
                    );
                    match run.last_calendar_date {
                        Some(date) => println!("LAST UPDATE: {date}"),
                        None => println!("LAST UPDATE: none"),
                    }
                    println!(
                        "instruments synced: {}, rows written: {}, failures: {}",
                        run.instruments_synced, run.rows_written, run.failures
                    );
                    for failure in ledger.failures(&mut conn, run.id)? {
                        println!(
                            "  [{}] {} {} {}: {}",
                            failure.phase,
                            failure.kind,
                            failure.table_name,
                            failure.code.as_deref().unwrap_or("*"),
                            failure.message
                        );
                    }
                }
            }
        }
        Cmd::Catalog => {
            print!("{}", toml::to_string_pretty(&catalog)?);
        }
    }

    Ok(())
}

/// Orchestrator for commands that never reach the provider.
fn offline(
    config: SyncConfig,
    catalog: market_sync::catalog::Catalog,
) -> Result<SyncOrchestrator> {
    Ok(SyncOrchestrator::open(
        config,
        catalog,
        Arc::new(MemoryProvider::new()),
    )?)
}
