//! Mirror Trader
//!
//! Mirrors a second party's orders into your own account: the feed is merged
//! from poll and push channels, each trade waits for accept/reject, and
//! accepted trades are sized, replicated once, and booked against a locally
//! cached balance.

mod api;
mod db;
mod error;
mod models;
mod orchestrator;
mod trading;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{BrokerClient, ExecutionVenue, OrderType, PaperVenue, WsPushChannel};
use crate::db::Database;
use crate::orchestrator::{DecisionOutcome, SyncEvent, SyncOrchestrator};
use crate::trading::{Decision, ExposureAdvisor, SyncConfig};

/// Mirror-trading sync engine CLI.
#[derive(Parser)]
#[command(name = "mirrortrade")]
#[command(about = "Mirror another trader's orders into your own account", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "MIRROR_DATABASE_URL", default_value = "sqlite:./mirrortrade.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start syncing the feed and take decisions on stdin
    Run {
        /// Broker bridge base URL
        #[arg(long, env = "MIRROR_BASE_URL", default_value = "http://localhost:4000/api")]
        base_url: String,

        /// Push channel URL (WebSocket); poll only when absent
        #[arg(long, env = "MIRROR_PUSH_URL")]
        push_url: Option<String>,

        /// Bearer token for the broker bridge
        #[arg(long, env = "MIRROR_API_KEY")]
        api_key: Option<String>,

        #[command(flatten)]
        settings: SettingsArgs,

        /// Dry run (fill orders locally, never call the execution endpoint)
        #[arg(long)]
        dry_run: bool,

        /// Consult the exposure advisor before each accept
        #[arg(long)]
        risk_advisor: bool,
    },

    /// Show the stored snapshot
    Status,

    /// Show the effective configuration
    Config {
        #[command(flatten)]
        settings: SettingsArgs,
    },
}

#[derive(clap::Args)]
struct SettingsArgs {
    /// Maximum notional per replicated trade
    #[arg(long, env = "MIRROR_TRADE_SIZE_LIMIT", default_value = "1000")]
    trade_size_limit: Decimal,

    /// Feed polling interval in milliseconds
    #[arg(long, env = "MIRROR_POLL_INTERVAL_MS", default_value = "10000")]
    poll_interval_ms: u64,

    /// Deadline for one execution request in milliseconds
    #[arg(long, env = "MIRROR_SUBMIT_TIMEOUT_MS", default_value = "15000")]
    submit_timeout_ms: u64,

    /// Order type sent to the execution endpoint
    #[arg(long, env = "MIRROR_ORDER_TYPE", value_enum, default_value = "market")]
    order_type: OrderType,

    /// Balance used when nothing is stored and the balance endpoint is unreachable
    #[arg(long, env = "MIRROR_STARTING_BALANCE", default_value = "50000")]
    starting_balance: Decimal,
}

impl SettingsArgs {
    fn into_config(self) -> Result<SyncConfig> {
        let config = SyncConfig {
            trade_size_limit: self.trade_size_limit,
            poll_interval_ms: self.poll_interval_ms,
            submit_timeout_ms: self.submit_timeout_ms,
            order_type: self.order_type,
            starting_balance: self.starting_balance,
            ..SyncConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
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

    match cli.command {
        Commands::Run {
            base_url,
            push_url,
            api_key,
            settings,
            dry_run,
            risk_advisor,
        } => {
            let config = settings.into_config()?;
            let db = Database::new(&cli.database).await?;
            let client = Arc::new(BrokerClient::new(base_url.clone(), api_key)?);

            let venue: Arc<dyn ExecutionVenue> = if dry_run {
                Arc::new(PaperVenue)
            } else {
                client.clone()
            };

            let mut orchestrator = SyncOrchestrator::new(config.clone(), client.clone(), venue)
                .with_balance_source(client)
                .with_store(db);
            if let Some(url) = &push_url {
                orchestrator = orchestrator.with_push(Arc::new(WsPushChannel::new(url.clone())));
            }
            if risk_advisor {
                orchestrator = orchestrator.with_advisor(Arc::new(ExposureAdvisor::default()));
            }

            let orchestrator = Arc::new(orchestrator);
            orchestrator.initialize().await?;

            println!("\n=== Mirror Trader ===");
            println!("Feed:             {}", base_url);
            println!("Push:             {}", push_url.as_deref().unwrap_or("disabled"));
            println!("Trade size limit: {}", config.trade_size_limit);
            println!("Polling interval: {}ms", config.poll_interval_ms);
            println!("Mode:             {}", if dry_run { "DRY RUN (no real trades)" } else { "LIVE TRADING" });
            println!("Balance:          {:.2}", orchestrator.snapshot().available_balance);
            println!("\nCommands: accept <id>, reject <id>, list, history, balance, refresh, limit <amount>, quit\n");

            tokio::spawn(print_events(orchestrator.subscribe()));
            let runner = tokio::spawn(orchestrator.clone().run());

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if !handle_command(&orchestrator, line.trim()).await {
                                break;
                            }
                        }
                        Ok(None) => {
                            // stdin closed; keep syncing until Ctrl+C
                            tokio::signal::ctrl_c().await.ok();
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to read command");
                            break;
                        }
                    },
                }
            }

            orchestrator.shutdown();
            match runner.await {
                Ok(Err(e)) => error!(error = %format!("{:#}", e), "Sync loop error"),
                Err(e) => error!(error = %e, "Sync loop panicked"),
                Ok(Ok(())) => {}
            }
            if let Err(e) = orchestrator.persist().await {
                error!(error = %format!("{:#}", e), "Failed to save final snapshot");
            }

            let snapshot = orchestrator.snapshot();
            println!("\nFinal balance:    {:.2}", snapshot.available_balance);
            println!("Replicated:       {}", snapshot.replicated.len());
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;
            let Some(snapshot) = db.load_snapshot().await? else {
                println!("No stored session found. Run 'mirrortrade run' to start syncing.");
                return Ok(());
            };
            let saved_at = db.last_saved_at().await?;

            println!("\n=== Stored Session ===");
            println!(
                "Saved:            {}",
                saved_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "Unknown".to_string())
            );
            println!("Balance:          {:.2}", snapshot.available_balance);
            println!("Replicated:       {}", snapshot.replicated_trades.len());

            if !snapshot.replicated_trades.is_empty() {
                println!("\n{:<36} {:<10} {:<6} {:>8} {:>12}", "ID", "SOURCE", "ACTION", "QTY", "PRICE");
                println!("{}", "-".repeat(76));
                for trade in &snapshot.replicated_trades {
                    println!(
                        "{:<36} {:<10} {:<6} {:>8} {:>12.2}",
                        trade.id,
                        truncate(&trade.source_trade_id, 10),
                        trade.action,
                        trade.quantity,
                        trade.price
                    );
                }
            }
        }

        Commands::Config { settings } => {
            let config = settings.into_config()?;

            println!("\n=== Sync Configuration ===\n");
            println!("Trading:");
            println!("  Trade Size Limit:     {}", config.trade_size_limit);
            println!("  Order Type:           {}", config.order_type);
            println!("  Starting Balance:     {}", config.starting_balance);
            println!("  Submit Timeout:       {}ms", config.submit_timeout_ms);

            println!("\nFeed:");
            println!("  Poll Interval:        {}ms", config.poll_interval_ms);
            println!("  Reconnect Initial:    {}ms", config.reconnect.initial_delay_ms);
            println!("  Reconnect Max:        {}ms", config.reconnect.max_delay_ms);
            println!("  Reconnect Multiplier: {}", config.reconnect.multiplier);
        }
    }

    Ok(())
}

/// Handle one stdin command. Returns false to stop.
async fn handle_command(orchestrator: &SyncOrchestrator, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let argument = parts.next();

    match (command, argument) {
        ("", _) => {}
        ("quit" | "exit", _) => return false,

        ("accept", Some(id)) => match orchestrator.decide(id, Decision::Accept).await {
            Ok(DecisionOutcome::Completed(trade)) => println!(
                "Replicated {} as {}: {} {} {} @ {}",
                id, trade.id, trade.action, trade.quantity, trade.ticker, trade.price
            ),
            Ok(DecisionOutcome::Rejected { reason }) => println!("Rejected {}: {}", id, reason),
            Ok(DecisionOutcome::Failed { reason }) => println!("Failed {}: {}", id, reason),
            Err(e) => println!("Cannot accept {}: {}", id, e),
        },

        ("reject", Some(id)) => match orchestrator.decide(id, Decision::Reject).await {
            Ok(_) => println!("Rejected {}", id),
            Err(e) => println!("Cannot reject {}: {}", id, e),
        },

        ("list", _) => {
            let snapshot = orchestrator.snapshot();
            println!(
                "\n{:<12} {:<16} {:<6} {:>8} {:>12} {:<20}",
                "ID", "TICKER", "ACTION", "QTY", "PRICE", "STATUS"
            );
            println!("{}", "-".repeat(78));
            for trade in &snapshot.trades {
                println!(
                    "{:<12} {:<16} {:<6} {:>8} {:>12.2} {:<20}",
                    truncate(&trade.id, 12),
                    truncate(&trade.ticker, 16),
                    trade.action,
                    trade.quantity,
                    trade.price,
                    trade.status
                );
            }
            let open = snapshot.trades.iter().filter(|t| !t.status.is_terminal()).count();
            println!(
                "{} open, {} settled. Feed: {}",
                open,
                snapshot.trades.len() - open,
                if snapshot.connected { "connected" } else { "unavailable" }
            );
        }

        ("history", _) => {
            let snapshot = orchestrator.snapshot();
            if snapshot.replicated.is_empty() {
                println!("No replicated trades yet.");
            }
            for trade in &snapshot.replicated {
                println!(
                    "[{}] {} {} {} {} @ {} (from {})",
                    trade.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    trade.id,
                    trade.action,
                    trade.quantity,
                    trade.ticker,
                    trade.price,
                    trade.source_trade_id
                );
            }
        }

        ("balance", _) => {
            let snapshot = orchestrator.snapshot();
            let refreshed = snapshot
                .last_refreshed_at
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string());
            println!("Available: {:.2} (last refresh: {})", snapshot.available_balance, refreshed);
        }

        ("refresh", _) => match orchestrator.refresh_balance().await {
            Ok(balance) => println!("Available: {:.2}", balance),
            Err(e) => println!("Refresh failed: {:#}", e),
        },

        ("limit", Some(amount)) => {
            let result = Decimal::from_str(amount)
                .context("Not a number")
                .and_then(|limit| Ok(orchestrator.update_trade_size_limit(limit)?));
            match result {
                Ok(()) => println!("Trade size limit set to {}", amount),
                Err(e) => println!("Cannot set limit: {:#}", e),
            }
        }

        (other, _) => {
            warn!(command = %other, "Unknown command");
            println!("Commands: accept <id>, reject <id>, list, history, balance, refresh, limit <amount>, quit");
        }
    }

    true
}

/// Print observer notifications until the channel closes.
async fn print_events(mut events: tokio::sync::broadcast::Receiver<SyncEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(SyncEvent::NewTradeAvailable { trade_id }) => println!("> New trade available: {}", trade_id),
            Ok(SyncEvent::TradeSettled {
                trade_id,
                status,
                reason,
            }) => match reason {
                Some(reason) => println!("> {} is {}: {}", trade_id, status, reason),
                None => println!("> {} is {}", trade_id, status),
            },
            Ok(SyncEvent::BalanceChanged { available }) => println!("> Balance: {:.2}", available),
            Ok(SyncEvent::Connectivity { connected }) => {
                println!("> Feed {}", if connected { "connected" } else { "unavailable" })
            }
            Ok(SyncEvent::TradesUpdated { .. }) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
