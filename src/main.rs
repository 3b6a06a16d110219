//! Trade replicator, slave side.
//!
//! Receives master trade signals and position snapshots, applies each
//! master's replication policy and mirrors the trades on the local terminal,
//! keeping a master ticket -> local ticket mapping that survives restarts.

mod broker;
mod db;
mod engine;
mod metrics;
mod models;
mod protocol;
mod replay;
mod replicator;
mod settings;
mod transport;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::broker::{Broker, PaperBroker};
use crate::db::TerminalStore;
use crate::engine::{parse_ticket_tag, RecoveryScanner, TicketMapper};
use crate::replay::{parse_script, replay};
use crate::replicator::Replicator;
use crate::settings::{parse_fill_reporting, EngineSettings};
use crate::transport::MemoryTransport;

/// Slave-side trade replicator CLI.
#[derive(Parser)]
#[command(name = "replicator")]
#[command(about = "Mirror master account trades onto a local terminal", long_about = None)]
struct Cli {
    /// Paper terminal database path
    #[arg(short, long, default_value = "sqlite:./replicator.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Fill reporting of the paper terminal (events, polling)
    #[arg(long, env = "REPLICATOR_FILL_REPORTING")]
    fill_reporting: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a session script against the paper terminal
    Run {
        /// Slave account id
        #[arg(short, long, env = "REPLICATOR_ACCOUNT_ID")]
        account: Option<String>,

        /// JSON-lines session script
        #[arg(short, long)]
        script: PathBuf,

        /// Keep ticking after the script until Ctrl+C
        #[arg(long)]
        follow: bool,
    },

    /// List paper terminal positions and pending orders
    Book,

    /// Rebuild the ticket mapping from the stored terminal and print it
    Recover,

    /// Show effective engine settings
    Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut settings = EngineSettings::from_env()?;
    if let Some(mode) = &cli.fill_reporting {
        settings.fill_reporting = parse_fill_reporting(mode)?;
    }

    match cli.command {
        Commands::Run {
            account,
            script,
            follow,
        } => {
            if let Some(account) = account {
                settings.account_id = account;
            }
            settings.validate()?;

            let text = std::fs::read_to_string(&script)
                .with_context(|| format!("Failed to read script {}", script.display()))?;
            let steps = parse_script(&text)?;

            let store = TerminalStore::new(&cli.database).await?;
            let book = store.load_book().await?.unwrap_or_default();
            let broker = PaperBroker::from_book(book, settings.fill_reporting);
            let (transport, bus) = MemoryTransport::new();

            info!(
                account = %settings.account_id,
                script = %script.display(),
                steps = steps.len(),
                "Starting replay session"
            );

            let mut replicator = Replicator::new(settings.clone(), broker, transport);
            let recovery = replicator.start().await?;

            println!("\n=== Trade Replicator ===");
            println!("Account:          {}", settings.account_id);
            println!("Recovered:        {}", recovery);
            println!("Script steps:     {}", steps.len());

            let summary = replay(&mut replicator, &bus, &steps).await?;
            println!(
                "Replayed:         {} frames, {} quotes, {} ticks",
                summary.frames, summary.quotes, summary.ticks
            );

            if follow {
                println!("\nPress Ctrl+C to stop.\n");
                if let Err(e) = replicator.run().await {
                    tracing::error!(error = %e, "Replicator error");
                }
            }

            // Show final stats
            println!("\n{}", replicator.stats());

            store
                .save_book(&replicator.engine().broker().book())
                .await?;
            info!("Terminal book saved");
        }

        Commands::Book => {
            let store = TerminalStore::new(&cli.database).await?;
            let Some(book) = store.load_book().await? else {
                println!("No terminal book found. Use 'replicator run' to start a session.");
                return Ok(());
            };

            println!("\n=== Account ===");
            println!("Balance:          {}", book.account.balance);
            println!("Equity:           {}", book.account.equity);
            println!("Trade Allowed:    {}", if book.account.trade_allowed { "Yes" } else { "No" });

            println!("\n--- Open Positions ({}) ---", book.positions.len());
            println!(
                "{:<10} {:<10} {:<6} {:>8} {:>12} {:<22} {:>10}",
                "TICKET", "SYMBOL", "TYPE", "VOLUME", "PRICE", "COMMENT", "MASTER"
            );
            println!("{}", "-".repeat(84));
            for p in &book.positions {
                println!(
                    "{:<10} {:<10} {:<6} {:>8} {:>12} {:<22} {:>10}",
                    p.ticket,
                    p.symbol,
                    p.order_type,
                    p.volume,
                    p.open_price,
                    truncate(&p.comment, 21),
                    master_of(&p.comment)
                );
            }

            println!("\n--- Pending Orders ({}) ---", book.orders.len());
            println!(
                "{:<10} {:<10} {:<10} {:>8} {:>12} {:<22} {:>10}",
                "TICKET", "SYMBOL", "TYPE", "VOLUME", "PRICE", "COMMENT", "MASTER"
            );
            println!("{}", "-".repeat(88));
            for o in &book.orders {
                println!(
                    "{:<10} {:<10} {:<10} {:>8} {:>12} {:<22} {:>10}",
                    o.ticket,
                    o.symbol,
                    o.order_type,
                    o.volume,
                    o.price,
                    truncate(&o.comment, 21),
                    master_of(&o.comment)
                );
            }
        }

        Commands::Recover => {
            let store = TerminalStore::new(&cli.database).await?;
            let book = store.load_book().await?.unwrap_or_default();
            let broker = PaperBroker::from_book(book, settings.fill_reporting);

            let mut mapper = TicketMapper::new();
            let report = RecoveryScanner.run(&broker, &mut mapper).await?;

            println!("\n=== Recovery ({}) ===", broker.name());
            println!("{}", report);

            println!("\n{:<14} {:<14} {:<10}", "MASTER", "LOCAL", "STATE");
            println!("{}", "-".repeat(40));
            for (remote, local) in mapper.active_entries() {
                println!("{:<14} {:<14} {:<10}", remote, local, "confirmed");
            }
            for (remote, local) in mapper.pending_entries() {
                println!("{:<14} {:<14} {:<10}", remote, local, "pending");
            }
        }

        Commands::Settings => {
            println!("\n=== Engine Settings ===\n");
            println!("Account:              {}", settings.account_id);
            println!("Tick Interval:        {}ms", settings.tick_interval_ms);
            println!("Heartbeat Interval:   {}s", settings.heartbeat_interval_secs);
            println!("Retry Delay:          {}ms", settings.retry_delay_ms);
            println!("Max Messages/Tick:    {}", settings.max_messages_per_tick);
            println!("Fill Reporting:       {:?}", settings.fill_reporting);
            println!("Platform:             {}", settings.platform);
            println!("Version:              {}", settings.version);
            println!("Database:             {}", cli.database);
        }
    }

    Ok(())
}

fn master_of(comment: &str) -> String {
    parse_ticket_tag(comment)
        .map(|tag| tag.remote_ticket.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
