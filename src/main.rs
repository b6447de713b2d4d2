use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use shopsync::config::AppConfig;
use shopsync::logging::init_tracing;
use shopsync::remote::client::StorefrontClient;
use shopsync::remote::Feed;
use shopsync::store::sqlite::SqliteStore;
use shopsync::sync::sequence::SequenceGenerator;
use shopsync::sync::state::SyncStateStore;
use shopsync::sync::{SyncEngine, SyncOptions};
use shopsync::util::env as env_util;

#[derive(Parser, Debug)]
#[command(name = "shopsync", version, about = "Storefront sync admin CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Pull remote products and reconcile the local inventory
    SyncProducts {
        /// Force a full sync even if a delta would be possible
        #[arg(long, default_value_t = false)]
        full: bool,
        /// Cap the number of items fetched (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        limit: usize,
        /// Page size per remote request
        #[arg(long, default_value_t = 50)]
        page_size: u32,
    },
    /// Pull remote orders and project them into invoices and sales
    SyncOrders {
        #[arg(long, default_value_t = false)]
        full: bool,
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long, default_value_t = 50)]
        page_size: u32,
    },
    /// Print per-feed sync state
    Status,
    /// Produce the next number for a sequence (e.g. "invoice")
    NextNumber { sequence: String },
    /// One-time backfill: link legacy unlinked sales to invoices
    MigrateSales,
}

async fn open_store() -> Result<Arc<SqliteStore>> {
    let url = AppConfig::database_url_from_env();
    Ok(Arc::new(SqliteStore::connect(&url).await?))
}

async fn build_engine() -> Result<SyncEngine> {
    // Credentials are checked here, before any network traffic.
    let cfg = AppConfig::from_env()?;
    let store = Arc::new(SqliteStore::connect(&cfg.database_url).await?);
    let api = Arc::new(StorefrontClient::new(&cfg)?);
    Ok(SyncEngine::new(store, api))
}

fn print_report<T: serde::Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing("shopsync=info")?;

    let cli = Cli::parse();
    match cli.command {
        Commands::SyncProducts {
            full,
            limit,
            page_size,
        } => {
            let engine = build_engine().await?;
            let report = engine
                .sync_products(&SyncOptions {
                    force_full: full,
                    limit,
                    page_size,
                })
                .await;
            print_report(&report)?;
            if !report.success {
                std::process::exit(1);
            }
        }
        Commands::SyncOrders {
            full,
            limit,
            page_size,
        } => {
            let engine = build_engine().await?;
            let report = engine
                .sync_orders(&SyncOptions {
                    force_full: full,
                    limit,
                    page_size,
                })
                .await;
            print_report(&report)?;
            if !report.success {
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let store = open_store().await?;
            let states = SyncStateStore::new(store);
            for feed in [Feed::Orders, Feed::Products] {
                let state = states.read(feed).await;
                println!("{}:", feed.as_str());
                print_report(&state)?;
            }
        }
        Commands::NextNumber { sequence } => {
            let store = open_store().await?;
            let number = SequenceGenerator::new(store).next(&sequence).await;
            println!("{number}");
        }
        Commands::MigrateSales => {
            // The backfill never touches the remote API, so it does not
            // require storefront credentials.
            let store = open_store().await?;
            let mut batch = shopsync::sync::batch::BatchWriter::new(store.clone());
            let summary =
                shopsync::sync::invoices::migrate_unlinked_sales(store.clone(), &mut batch).await?;
            batch.flush().await?;
            print_report(&summary)?;
        }
    }

    info!("done");
    Ok(())
}
