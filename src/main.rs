use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use tradedesk::api::{HttpBackend, OrderQuery, ScriptedBackend, TradingBackend};
use tradedesk::execution::{CancelReport, OrderFilter};
use tradedesk::models::{OrderDraft, OrderId, OrderStatus, Side};
use tradedesk::session::{DeskEvent, Intent, Session};
use tradedesk::settings::{CoreSettings, DeskConfig};

const TICKER_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "tradedesk", about = "Trading desk client", version)]
struct Cli {
    /// Config file (defaults to ./tradedesk.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persisted settings blob, overrides `settings_path`
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Use the in-memory demo backend instead of HTTP
    #[arg(long)]
    demo: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll market data and log every change until Ctrl+C
    Watch {
        /// Symbols to poll (defaults to the configured watchlist)
        symbols: Vec<String>,

        /// Symbol the order book and trades follow
        #[arg(short, long)]
        focus: Option<String>,

        /// Seconds between refreshes (defaults to trading.refreshInterval)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Write the balance chart's draw commands here on exit
        #[arg(long)]
        chart_out: Option<PathBuf>,
    },
    /// Draft, price, confirm and submit one order
    Place {
        #[arg(long)]
        symbol: Option<String>,

        #[arg(long, value_parser = parse_wire::<Side>)]
        side: Side,

        #[arg(short, long)]
        quantity: Option<Decimal>,

        /// Limit price; omit for a MARKET order
        #[arg(short, long)]
        price: Option<Decimal>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Cancel one or more orders
    Cancel {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Refresh the order list and print one page
    Orders {
        #[arg(long)]
        symbol: Option<String>,

        #[arg(long, value_parser = parse_wire::<OrderStatus>)]
        status: Vec<OrderStatus>,

        /// Case-insensitive match on id or symbol
        #[arg(long)]
        search: Option<String>,

        #[arg(short, long, default_value = "1")]
        page: usize,
    },
    /// Check the backend and print the wallet balance
    TestConnection,
}

/// Parse a value the way the backend spells it, e.g. `buy` or `partially_filled`
fn parse_wire<T: DeserializeOwned>(raw: &str) -> std::result::Result<T, String> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_uppercase()))
        .map_err(|_| format!("unrecognised value '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let loaded = DeskConfig::load(cli.config.as_deref());
    let log_filter = loaded
        .as_ref()
        .map(|c| c.log_filter.clone())
        .unwrap_or_else(|_| DeskConfig::default().log_filter);
    setup_logging(&log_filter);

    let config = loaded.unwrap_or_else(|e| {
        tracing::warn!("Failed to load config ({:#}), using defaults", e);
        DeskConfig::default()
    });

    let store = match &cli.settings {
        Some(path) => tradedesk::settings::SettingsStore::new(path),
        None => config.settings_store(),
    };
    let settings = store.load().unwrap_or_else(|e| {
        tracing::warn!(path = %store.path().display(), "Ignoring unreadable settings ({:#})", e);
        CoreSettings::default()
    });

    if cli.demo {
        tracing::info!("Using the demo backend");
        run(ScriptedBackend::demo(), cli.command, &config, &settings).await
    } else {
        let backend = HttpBackend::new(
            &config.api_base,
            config.request_timeout(),
            config.requests_per_second,
        )
        .context("Failed to create HTTP backend")?;
        tracing::info!(api_base = %backend.base_url(), env = %settings.env, "Using HTTP backend");
        run(backend, cli.command, &config, &settings).await
    }
}

fn setup_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run<B: TradingBackend>(
    backend: B,
    command: Commands,
    config: &DeskConfig,
    settings: &CoreSettings,
) -> Result<()> {
    match command {
        Commands::TestConnection => {
            let balance = backend
                .fetch_wallet_balance()
                .await
                .context("Connection test failed")?;
            println!("Connected. Wallet balance: {}", balance);
            Ok(())
        }
        Commands::Watch {
            symbols,
            focus,
            interval,
            chart_out,
        } => {
            let symbols = if symbols.is_empty() {
                config.watchlist.clone()
            } else {
                symbols.iter().map(|s| s.to_uppercase()).collect()
            };
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or(settings.refresh_interval);
            let focus = focus
                .map(|s| s.to_uppercase())
                .or_else(|| settings.default_symbol.clone());

            let (tx, events, task) = open_session(backend, config, settings);
            watch(&tx, events, symbols, focus, interval).await?;
            stop_session(tx, task, chart_out).await.map(|_| ())
        }
        Commands::Place {
            symbol,
            side,
            quantity,
            price,
            yes,
        } => {
            let (tx, events, task) = open_session(backend, config, settings);
            let outcome = place(&tx, events, settings, symbol, side, quantity, price, yes).await;
            stop_session(tx, task, None).await?;
            outcome
        }
        Commands::Cancel { ids } => {
            let (tx, _events, task) = open_session(backend, config, settings);
            let outcome = cancel(&tx, ids).await;
            stop_session(tx, task, None).await?;
            outcome
        }
        Commands::Orders {
            symbol,
            status,
            search,
            page,
        } => {
            let (tx, _events, task) = open_session(backend, config, settings);
            let outcome = refresh_and_filter(&tx, symbol, status, search, page).await;
            let session = stop_session(tx, task, None).await?;
            outcome?;
            print_page(&session);
            Ok(())
        }
    }
}

/// Start a session on its own task and hand back its channels
fn open_session<B: TradingBackend>(
    backend: B,
    config: &DeskConfig,
    settings: &CoreSettings,
) -> (
    mpsc::Sender<Intent>,
    broadcast::Receiver<DeskEvent>,
    JoinHandle<Session<B>>,
) {
    let mut session = Session::new(backend, config.feed_settings(), settings.page_size);
    let events = session.subscribe();
    let (tx, rx) = mpsc::channel(64);

    let task = tokio::spawn(async move {
        session.run(rx).await;
        session
    });
    (tx, events, task)
}

async fn stop_session<B: TradingBackend>(
    tx: mpsc::Sender<Intent>,
    task: JoinHandle<Session<B>>,
    chart_out: Option<PathBuf>,
) -> Result<Session<B>> {
    let _ = tx.send(Intent::Shutdown).await;
    let session = task.await.context("Session task failed")?;

    if let Some(path) = chart_out {
        let commands = session.feed().balance_view(600.0, 200.0);
        let json = serde_json::to_string_pretty(&commands)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), points = session.feed().balance_history().len(), "Balance chart written");
    }

    Ok(session)
}

async fn request<T>(
    tx: &mpsc::Sender<Intent>,
    build: impl FnOnce(oneshot::Sender<T>) -> Intent,
) -> Result<T> {
    let (reply, answer) = oneshot::channel();
    tx.send(build(reply))
        .await
        .context("Session is no longer running")?;
    answer.await.context("Session dropped the request")
}

// ============================================================================
// Commands
// ============================================================================

async fn watch(
    tx: &mpsc::Sender<Intent>,
    mut events: broadcast::Receiver<DeskEvent>,
    symbols: Vec<String>,
    focus: Option<String>,
    interval: Duration,
) -> Result<()> {
    tracing::info!("Watching {} (every {:?}), Ctrl+C to stop", symbols.join(", "), interval);

    if let Some(symbol) = focus.or_else(|| symbols.first().cloned()) {
        tx.send(Intent::SetFocus(symbol)).await?;
    }
    tx.send(Intent::StartFeed { symbols, interval }).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down...");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

fn log_event(event: &DeskEvent) {
    match event {
        DeskEvent::TickersUpdated => tracing::debug!("Tickers updated"),
        DeskEvent::OrderBookUpdated { spread: Some(spread) } => {
            tracing::info!(%spread, "Order book updated")
        }
        DeskEvent::OrderBookUpdated { spread: None } => {
            tracing::info!("Order book updated (one-sided)")
        }
        DeskEvent::TradesUpdated => tracing::debug!("Trades updated"),
        DeskEvent::OpenOrdersUpdated => tracing::debug!("Open orders updated"),
        DeskEvent::BalanceUpdated(balance) => tracing::info!(%balance, "Wallet balance"),
        DeskEvent::FeedError { series, error } => {
            tracing::warn!(series = %series, "Refresh failed: {}", error)
        }
        DeskEvent::FetchSkipped { series } => {
            tracing::debug!(series = %series, "Refresh skipped, previous still running")
        }
        DeskEvent::FeedStopped => tracing::info!("Feed stopped"),
        DeskEvent::OrderUpdated(order) => tracing::info!(
            order_id = %order.id(),
            symbol = %order.symbol(),
            status = %order.status(),
            filled = %order.filled_quantity(),
            "Order updated"
        ),
        DeskEvent::SubmissionFailed { order_id, error } => {
            tracing::warn!(order_id = %order_id, "Submission failed: {}", error)
        }
        DeskEvent::OrdersReplaced { total, pruned } => {
            tracing::info!(total, pruned = pruned.len(), "Order list replaced")
        }
        DeskEvent::CancelReported(report) => tracing::info!(
            cancelled = report.cancelled.len(),
            failed = report.failed.len(),
            "Cancel finished"
        ),
        DeskEvent::ViewChanged(page) => tracing::debug!(
            page = page.current_page,
            pages = page.total_pages(),
            "View changed"
        ),
        DeskEvent::SelectionChanged(state) => tracing::debug!(?state, "Selection changed"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn place(
    tx: &mpsc::Sender<Intent>,
    mut events: broadcast::Receiver<DeskEvent>,
    settings: &CoreSettings,
    symbol: Option<String>,
    side: Side,
    quantity: Option<Decimal>,
    price: Option<Decimal>,
    yes: bool,
) -> Result<()> {
    let symbol = symbol
        .map(|s| s.to_uppercase())
        .or_else(|| settings.default_symbol.clone())
        .context("No symbol given and no trading.defaultSymbol configured")?;
    let quantity = quantity
        .or(settings.default_quantity)
        .context("No quantity given and no trading.defaultQuantity configured")?;

    let draft = match price {
        Some(price) => OrderDraft::limit(&symbol, side, quantity, price),
        None => {
            // MARKET orders are priced off the latest ticker
            tx.send(Intent::StartFeed {
                symbols: vec![symbol.clone()],
                interval: settings.refresh_interval,
            })
            .await?;
            wait_for_tickers(&mut events).await;
            tx.send(Intent::StopFeed).await?;
            OrderDraft::market(&symbol, side, quantity)
        }
    };

    let estimate = request(tx, |reply| Intent::Place {
        draft: draft.clone(),
        reply,
    })
    .await??;

    println!(
        "{:?} {:?} {} {} @ {}",
        draft.order_type,
        draft.side,
        draft.quantity,
        draft.symbol,
        estimate
            .effective_price
            .map_or_else(|| "market".to_string(), |p| p.to_string())
    );
    match estimate.estimated_cost {
        Some(cost) => println!("Estimated cost: {}", cost),
        None => println!("Estimated cost: unknown (no recent price)"),
    }

    if !yes && settings.confirm_orders && !prompt_confirm().await? {
        tx.send(Intent::Discard(estimate.order_id)).await?;
        println!("Order discarded");
        return Ok(());
    }

    let outcome = request(tx, |reply| Intent::Confirm {
        id: estimate.order_id.clone(),
        reply,
    })
    .await??;

    match outcome.error {
        None => {
            println!(
                "Order {} {} (filled {})",
                outcome.order.id(),
                outcome.order.status(),
                outcome.order.filled_quantity()
            );
            Ok(())
        }
        Some(e) => anyhow::bail!("Order {} failed: {}", outcome.order.id(), e),
    }
}

async fn wait_for_tickers(events: &mut broadcast::Receiver<DeskEvent>) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(DeskEvent::TickersUpdated) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(DeskEvent::FeedError { series, error }) => {
                    tracing::warn!(series = %series, "Price lookup failed: {}", error);
                }
                _ => {}
            }
        }
    };

    if tokio::time::timeout(TICKER_WAIT, wait).await.is_err() {
        tracing::warn!("No ticker received, estimate will be unavailable");
    }
}

async fn prompt_confirm() -> Result<bool> {
    tokio::task::spawn_blocking(|| -> Result<bool> {
        use std::io::Write;

        print!("Submit this order? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    })
    .await?
}

async fn cancel(tx: &mpsc::Sender<Intent>, ids: Vec<String>) -> Result<()> {
    // Cancels are checked against the canonical list, so load it first
    request(tx, |reply| Intent::Refresh {
        query: OrderQuery::default(),
        reply,
    })
    .await??;

    let ids: Vec<OrderId> = ids.iter().map(|s| OrderId::from(s.as_str())).collect();
    let report: CancelReport = request(tx, |reply| Intent::Cancel { ids, reply }).await?;

    for order in &report.cancelled {
        println!("{}  {}", order.id(), order.status());
    }
    for (id, reason) in &report.failed {
        println!("{}  FAILED: {}", id, reason);
    }

    report.into_result().map(|_| ()).map_err(Into::into)
}

async fn refresh_and_filter(
    tx: &mpsc::Sender<Intent>,
    symbol: Option<String>,
    statuses: Vec<OrderStatus>,
    search: Option<String>,
    page: usize,
) -> Result<()> {
    request(tx, |reply| Intent::Refresh {
        query: OrderQuery::default(),
        reply,
    })
    .await??;

    tx.send(Intent::ApplyFilter(OrderFilter {
        search,
        symbol: symbol.map(|s| s.to_uppercase()),
        statuses,
        ..OrderFilter::default()
    }))
    .await?;
    tx.send(Intent::GoToPage(page)).await?;
    Ok(())
}

fn print_page<B: TradingBackend>(session: &Session<B>) {
    let list = session.orders();
    let pager = list.pagination();

    println!(
        "{:<14} {:<10} {:<5} {:<7} {:>12} {:>12} {:>12}  {:<18} CREATED",
        "ID", "SYMBOL", "SIDE", "TYPE", "QTY", "FILLED", "PRICE", "STATUS"
    );
    for order in list.page() {
        println!(
            "{:<14} {:<10} {:<5} {:<7} {:>12} {:>12} {:>12}  {:<18} {}",
            order.id().as_str(),
            order.symbol(),
            format!("{:?}", order.side()).to_uppercase(),
            format!("{:?}", order.order_type()).to_uppercase(),
            order.quantity(),
            order.filled_quantity(),
            order
                .limit_price()
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
            order.status().as_str(),
            order.created_at().format("%Y-%m-%d %H:%M:%S"),
        );
    }

    let stats = list.stats();
    println!(
        "Page {}/{} ({} shown of {}) | filled {} pending {} cancelled {} failed {}",
        pager.current_page,
        pager.total_pages(),
        pager.total_items,
        stats.total,
        stats.filled,
        stats.pending,
        stats.cancelled,
        stats.failed,
    );
}
