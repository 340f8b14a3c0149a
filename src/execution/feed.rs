use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::task::{AbortHandle, Id, JoinSet};

use super::history::BalanceHistory;
use super::scheduler::{CancelToken, Scheduler};
use crate::api::{ApiResult, TradingBackend};
use crate::chart::{self, DrawCommand};
use crate::error::NetworkError;
use crate::models::{MarketTick, Order, OrderBookSnapshot, TradePrint};

/// Independently refreshed data series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Series {
    Tickers,
    OrderBook,
    Trades,
    OpenOrders,
    Balance,
}

impl Series {
    pub const ALL: [Series; 5] = [
        Series::Tickers,
        Series::OrderBook,
        Series::Trades,
        Series::OpenOrders,
        Series::Balance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Series::Tickers => "tickers",
            Series::OrderBook => "order_book",
            Series::Trades => "trades",
            Series::OpenOrders => "open_orders",
            Series::Balance => "balance",
        }
    }

    /// Needs a focus symbol to be fetched
    fn per_symbol(self) -> bool {
        matches!(self, Series::OrderBook | Series::Trades)
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a completed fetch
#[derive(Debug, Clone)]
pub enum SeriesData {
    Tickers(Vec<MarketTick>),
    OrderBook(OrderBookSnapshot),
    Trades(Vec<TradePrint>),
    OpenOrders(Vec<Order>),
    Balance(Decimal),
}

/// Per-series bookkeeping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesHealth {
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<NetworkError>,
    pub consecutive_failures: u32,
    pub skipped_ticks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSettings {
    pub order_book_depth: usize,
    pub trades_limit: usize,
    pub balance_history: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            order_book_depth: 10,
            trades_limit: 20,
            balance_history: 120,
        }
    }
}

/// What happened on one turn of the feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A scheduled cycle began
    Tick {
        dispatched: Vec<Series>,
        skipped: Vec<Series>,
    },
    /// A fetch completed and its snapshot replaced the previous one
    Updated(Series),
    /// A fetch failed; the previous snapshot is still in place
    Failed { series: Series, error: NetworkError },
    /// The scheduler was cancelled through its token
    Stopped,
}

type FetchOutcome = (Series, ApiResult<SeriesData>);

/// Polls the market-data series on a fixed cadence
///
/// At most one fetch per series is in flight. A tick that finds a series
/// still busy skips it for that cycle instead of queueing.
pub struct FeedManager<B: TradingBackend> {
    backend: B,
    settings: FeedSettings,
    symbols: Vec<String>,
    focus_symbol: Option<String>,
    scheduler: Option<Scheduler>,
    fetches: JoinSet<FetchOutcome>,
    in_flight: HashMap<Series, AbortHandle>,
    health: HashMap<Series, SeriesHealth>,

    tickers: Vec<MarketTick>,
    order_book: Option<OrderBookSnapshot>,
    trades: Vec<TradePrint>,
    open_orders: Vec<Order>,
    balance: BalanceHistory,
}

impl<B: TradingBackend> FeedManager<B> {
    pub fn new(backend: B, settings: FeedSettings) -> Self {
        let balance = BalanceHistory::new(settings.balance_history);

        Self {
            backend,
            settings,
            symbols: Vec::new(),
            focus_symbol: None,
            scheduler: None,
            fetches: JoinSet::new(),
            in_flight: HashMap::new(),
            health: HashMap::new(),
            tickers: Vec::new(),
            order_book: None,
            trades: Vec::new(),
            open_orders: Vec::new(),
            balance,
        }
    }

    /// Begin the refresh cycle; the first tick fires immediately
    ///
    /// Calling it while running restarts the cycle with the new parameters.
    /// The first symbol becomes the focus for the order book and trades.
    pub fn start(&mut self, symbols: Vec<String>, interval: Duration) {
        if self.is_running() {
            self.stop();
        }

        if self.focus_symbol.is_none() {
            self.focus_symbol = symbols.first().cloned();
        }
        self.symbols = symbols;
        self.scheduler = Some(Scheduler::new(interval));

        tracing::info!(
            symbols = ?self.symbols,
            interval_ms = interval.as_millis() as u64,
            "Market data feed started"
        );
    }

    /// Halt the cycle and drop any fetch still in flight
    ///
    /// Idempotent, and safe before `start`. Returns whether a cycle was running.
    pub fn stop(&mut self) -> bool {
        let was_running = match self.scheduler.take() {
            Some(scheduler) => {
                scheduler.cancel();
                true
            }
            None => false,
        };

        // Dropping the set aborts whatever is still running
        self.fetches = JoinSet::new();
        self.in_flight.clear();

        if was_running {
            tracing::info!("Market data feed stopped");
        }
        was_running
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Token that stops the current cycle from outside the loop
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.scheduler.as_ref().map(Scheduler::token)
    }

    /// Switch the symbol the order book and trades follow
    ///
    /// The old snapshots stay visible until the new symbol's first fetch lands.
    pub fn set_focus(&mut self, symbol: impl Into<String>) {
        self.focus_symbol = Some(symbol.into());
    }

    /// Wait for the next tick or fetch completion and apply it
    ///
    /// Pends forever when stopped with nothing in flight, so it can sit in a
    /// `select!` next to other event sources.
    pub async fn next_event(&mut self) -> FeedEvent {
        loop {
            tokio::select! {
                Some(joined) = self.fetches.join_next_with_id(), if !self.fetches.is_empty() => {
                    match joined {
                        Ok((id, (series, result))) => return self.complete(id, series, result),
                        Err(e) => {
                            if !e.is_cancelled() {
                                tracing::error!("Feed fetch task panicked: {}", e);
                            }
                            self.forget(e.id());
                        }
                    }
                }
                tick = Self::next_tick(&mut self.scheduler) => {
                    return match tick {
                        Some(_) => self.begin_cycle(),
                        None => {
                            self.stop();
                            FeedEvent::Stopped
                        }
                    };
                }
            }
        }
    }

    async fn next_tick(scheduler: &mut Option<Scheduler>) -> Option<tokio::time::Instant> {
        match scheduler {
            Some(scheduler) => scheduler.tick().await,
            None => std::future::pending().await,
        }
    }

    /// Dispatch every idle series; busy ones are skipped for this cycle
    pub fn begin_cycle(&mut self) -> FeedEvent {
        let mut dispatched = Vec::new();
        let mut skipped = Vec::new();

        for series in Series::ALL {
            if series.per_symbol() && self.focus_symbol.is_none() {
                continue;
            }

            if self.is_in_flight(series) {
                self.health.entry(series).or_default().skipped_ticks += 1;
                tracing::debug!(series = %series, "Previous fetch still in flight, skipping");
                skipped.push(series);
                continue;
            }

            self.dispatch(series);
            dispatched.push(series);
        }

        FeedEvent::Tick {
            dispatched,
            skipped,
        }
    }

    fn dispatch(&mut self, series: Series) {
        let backend = self.backend.clone();
        let symbols = self.symbols.clone();
        let focus = self.focus_symbol.clone().unwrap_or_default();
        let depth = self.settings.order_book_depth;
        let limit = self.settings.trades_limit;

        let handle = self.fetches.spawn(async move {
            let result = match series {
                Series::Tickers => backend.fetch_tickers(&symbols).await.map(SeriesData::Tickers),
                Series::OrderBook => backend
                    .fetch_order_book(&focus, depth)
                    .await
                    .map(SeriesData::OrderBook),
                Series::Trades => backend
                    .fetch_recent_trades(&focus, limit)
                    .await
                    .map(SeriesData::Trades),
                Series::OpenOrders => backend.fetch_open_orders().await.map(SeriesData::OpenOrders),
                Series::Balance => backend.fetch_wallet_balance().await.map(SeriesData::Balance),
            };
            (series, result)
        });

        self.in_flight.insert(series, handle);
    }

    /// Drop the in-flight entry only if it still belongs to task `id`
    fn forget(&mut self, id: Id) {
        self.in_flight.retain(|_, handle| handle.id() != id);
    }

    /// Apply a finished fetch. Failures leave the previous snapshot alone.
    fn complete(&mut self, id: Id, series: Series, result: ApiResult<SeriesData>) -> FeedEvent {
        self.forget(id);
        let health = self.health.entry(series).or_default();

        let data = match result {
            Ok(data) => data,
            Err(error) => {
                health.consecutive_failures += 1;
                health.last_error = Some(error.clone());
                tracing::warn!(
                    series = %series,
                    failures = health.consecutive_failures,
                    "Fetch failed, keeping last snapshot: {}",
                    error
                );
                return FeedEvent::Failed { series, error };
            }
        };

        let now = Utc::now();
        health.consecutive_failures = 0;
        health.last_error = None;
        health.last_success = Some(now);

        match data {
            SeriesData::Tickers(tickers) => self.tickers = tickers,
            SeriesData::OrderBook(book) => {
                if !book.is_full() {
                    tracing::debug!(
                        symbol = %book.symbol(),
                        "Order book snapshot has an empty side, spread unavailable"
                    );
                }
                self.order_book = Some(book);
            }
            SeriesData::Trades(trades) => self.trades = trades,
            SeriesData::OpenOrders(orders) => self.open_orders = orders,
            SeriesData::Balance(balance) => self.balance.push(now, balance),
        }

        tracing::debug!(series = %series, "Snapshot updated");
        FeedEvent::Updated(series)
    }

    /// Dispatched and not yet collected. A fetch that has finished but whose
    /// result is still queued counts as busy.
    pub fn is_in_flight(&self, series: Series) -> bool {
        self.in_flight.contains_key(&series)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn focus_symbol(&self) -> Option<&str> {
        self.focus_symbol.as_deref()
    }

    pub fn health(&self, series: Series) -> SeriesHealth {
        self.health.get(&series).cloned().unwrap_or_default()
    }

    pub fn tickers(&self) -> &[MarketTick] {
        &self.tickers
    }

    /// Latest known price for a symbol, from the ticker table
    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.tickers
            .iter()
            .find(|t| t.symbol == symbol)
            .map(|t| t.last_price)
    }

    pub fn order_book(&self) -> Option<&OrderBookSnapshot> {
        self.order_book.as_ref()
    }

    /// Spread of the current snapshot; absent unless both sides have levels
    pub fn spread(&self) -> Option<Decimal> {
        self.order_book.as_ref().and_then(OrderBookSnapshot::spread)
    }

    pub fn trades(&self) -> &[TradePrint] {
        &self.trades
    }

    pub fn open_orders(&self) -> &[Order] {
        &self.open_orders
    }

    pub fn balance(&self) -> Option<Decimal> {
        self.balance.latest().map(|p| p.value)
    }

    pub fn balance_history(&self) -> &BalanceHistory {
        &self.balance
    }

    /// Draw the balance history onto a `width` x `height` surface
    pub fn balance_view(&self, width: f64, height: f64) -> Vec<DrawCommand> {
        chart::render(&self.balance.series(), width, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::scripted::{Endpoint, ScriptedBackend};
    use crate::models::BookLevel;
    use rust_decimal_macros::dec;

    const PERIOD: Duration = Duration::from_secs(5);

    fn book(bid: Decimal, ask: Decimal) -> OrderBookSnapshot {
        OrderBookSnapshot::new(
            "BTCUSDT",
            vec![BookLevel { price: bid, amount: dec!(1) }],
            vec![BookLevel { price: ask, amount: dec!(1) }],
            Utc::now(),
        )
    }

    fn symbols() -> Vec<String> {
        vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
    }

    /// Pump events until `ticks` cycles have begun, then let that cycle's
    /// immediate fetches land
    async fn run_ticks(feed: &mut FeedManager<ScriptedBackend>, ticks: usize) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        let mut seen = 0;

        while seen < ticks {
            let event = feed.next_event().await;
            if matches!(event, FeedEvent::Tick { .. }) {
                seen += 1;
            }
            events.push(event);
        }

        while let Ok(event) =
            tokio::time::timeout(Duration::from_millis(1), feed.next_event()).await
        {
            events.push(event);
        }

        events
    }

    #[test]
    fn test_stop_before_start() {
        let mut feed = FeedManager::new(ScriptedBackend::new(), FeedSettings::default());

        assert!(!feed.stop());
        assert!(!feed.stop());
        assert!(!feed.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_fills_every_series() {
        let backend = ScriptedBackend::demo();
        let mut feed = FeedManager::new(backend, FeedSettings::default());
        feed.start(symbols(), PERIOD);

        let events = run_ticks(&mut feed, 1).await;

        assert_eq!(
            events[0],
            FeedEvent::Tick {
                dispatched: Series::ALL.to_vec(),
                skipped: Vec::new()
            }
        );
        assert_eq!(feed.tickers().len(), 2);
        assert!(feed.spread().is_some());
        assert!(!feed.trades().is_empty());
        assert_eq!(feed.balance(), Some(dec!(15234.56)));
        assert_eq!(feed.last_price("BTCUSDT").map(|p| p > Decimal::ZERO), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_series_is_skipped_not_queued() {
        let backend = ScriptedBackend::demo();
        backend.set_latency(Endpoint::OrderBook, Duration::from_secs(12));

        let mut feed = FeedManager::new(backend.clone(), FeedSettings::default());
        feed.start(symbols(), PERIOD);

        // Ticks at 0s, 5s, 10s, 15s; the book fetch from 0s lands at 12s
        let events = run_ticks(&mut feed, 4).await;

        let skipped: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                FeedEvent::Tick { skipped, .. } => Some(skipped.clone()),
                _ => None,
            })
            .collect();

        assert_eq!(
            skipped,
            vec![
                vec![],
                vec![Series::OrderBook],
                vec![Series::OrderBook],
                vec![]
            ]
        );
        assert_eq!(backend.calls(Endpoint::OrderBook), 2);
        assert_eq!(backend.calls(Endpoint::Tickers), 4);
        assert_eq!(feed.health(Series::OrderBook).skipped_ticks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncollected_result_blocks_second_fetch() {
        let backend = ScriptedBackend::demo();
        backend.set_latency(Endpoint::OrderBook, Duration::from_secs(10));

        // No scheduler, so cycles only begin when the test asks
        let mut feed = FeedManager::new(backend.clone(), FeedSettings::default());
        feed.set_focus("BTCUSDT");
        feed.begin_cycle();

        // The book fetch lands but nobody has collected it yet
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(feed.is_in_flight(Series::OrderBook));

        match feed.begin_cycle() {
            FeedEvent::Tick { dispatched, skipped } => {
                assert!(dispatched.is_empty());
                assert!(skipped.contains(&Series::OrderBook));
            }
            other => panic!("expected a tick, got {:?}", other),
        }

        let mut events = Vec::new();
        while let Ok(event) =
            tokio::time::timeout(Duration::from_millis(1), feed.next_event()).await
        {
            events.push(event);
        }
        assert!(events.contains(&FeedEvent::Updated(Series::OrderBook)));
        assert!(!feed.is_in_flight(Series::OrderBook));

        // One new fetch; the cycle right after it finds the series busy
        feed.begin_cycle();
        match feed.begin_cycle() {
            FeedEvent::Tick { skipped, .. } => assert!(skipped.contains(&Series::OrderBook)),
            other => panic!("expected a tick, got {:?}", other),
        }
        tokio::task::yield_now().await;

        assert!(feed.is_in_flight(Series::OrderBook));
        assert_eq!(backend.calls(Endpoint::OrderBook), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_keep_last_snapshot() {
        let backend = ScriptedBackend::demo();
        let first = book(dec!(100), dec!(101));
        backend.set_order_book(first.clone());

        let mut feed = FeedManager::new(backend.clone(), FeedSettings::default());
        feed.start(symbols(), PERIOD);
        run_ticks(&mut feed, 1).await;
        assert_eq!(feed.order_book(), Some(&first));

        backend.set_order_book(book(dec!(200), dec!(205)));
        for _ in 0..3 {
            backend.fail_next(Endpoint::OrderBook, NetworkError::Timeout);
        }

        let events = run_ticks(&mut feed, 3).await;
        let failures = events
            .iter()
            .filter(|e| matches!(e, FeedEvent::Failed { series: Series::OrderBook, .. }))
            .count();

        assert_eq!(failures, 3);
        assert_eq!(feed.order_book(), Some(&first));
        assert_eq!(feed.spread(), Some(dec!(1)));
        assert_eq!(feed.health(Series::OrderBook).consecutive_failures, 3);

        // The cycle keeps going and the next good fetch replaces the snapshot
        run_ticks(&mut feed, 1).await;
        assert_eq!(feed.spread(), Some(dec!(5)));
        assert_eq!(feed.health(Series::OrderBook).consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_sided_book_has_no_spread() {
        let backend = ScriptedBackend::demo();
        backend.set_order_book(OrderBookSnapshot::new(
            "BTCUSDT",
            vec![BookLevel { price: dec!(100), amount: dec!(1) }],
            Vec::new(),
            Utc::now(),
        ));

        let mut feed = FeedManager::new(backend, FeedSettings::default());
        feed.start(symbols(), PERIOD);
        run_ticks(&mut feed, 1).await;

        assert!(feed.order_book().is_some());
        assert_eq!(feed.spread(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_ends_ticks() {
        let backend = ScriptedBackend::demo();
        let mut feed = FeedManager::new(backend.clone(), FeedSettings::default());
        feed.start(symbols(), PERIOD);
        run_ticks(&mut feed, 1).await;

        assert!(feed.stop());
        assert!(!feed.stop());

        let waited = tokio::time::timeout(Duration::from_secs(30), feed.next_event()).await;
        assert!(waited.is_err());
        assert_eq!(backend.calls(Endpoint::Tickers), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_reports_stopped() {
        let mut feed = FeedManager::new(ScriptedBackend::demo(), FeedSettings::default());
        feed.start(symbols(), PERIOD);
        run_ticks(&mut feed, 1).await;

        feed.cancel_token().unwrap().cancel();
        assert_eq!(feed.next_event().await, FeedEvent::Stopped);
        assert!(!feed.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_balance_view_draws_history() {
        let mut feed = FeedManager::new(ScriptedBackend::demo(), FeedSettings::default());
        feed.start(symbols(), PERIOD);
        run_ticks(&mut feed, 3).await;

        assert_eq!(feed.balance_history().len(), 3);
        let commands = feed.balance_view(400.0, 200.0);
        assert!(commands
            .iter()
            .any(|c| matches!(c, DrawCommand::Polyline { points, .. } if points.len() == 3)));
    }
}
