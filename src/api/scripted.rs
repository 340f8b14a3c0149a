use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{ApiResult, CancelAck, OrderQuery, OrderRequest, SubmitAck, TradingBackend};
use crate::error::NetworkError;
use crate::models::{
    BookLevel, Fill, MarketTick, Order, OrderBookSnapshot, OrderDraft, OrderId, OrderStatus,
    OrderType, Side, TradePrint,
};

/// Endpoints a script can delay, fail or count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Balance,
    Tickers,
    OrderBook,
    Trades,
    OpenOrders,
    Orders,
    Submit,
    Cancel,
}

#[derive(Default)]
struct Script {
    balance: Decimal,
    tickers: Vec<MarketTick>,
    books: HashMap<String, OrderBookSnapshot>,
    trades: Vec<TradePrint>,
    orders: Vec<Order>,
    submit_status: Option<OrderStatus>,
    cancel_status: Option<OrderStatus>,
    next_order_id: u64,
    drift: bool,
    drift_step: u64,

    latency: HashMap<Endpoint, Duration>,
    queued_failures: HashMap<Endpoint, VecDeque<NetworkError>>,
    cancel_failures: HashMap<OrderId, NetworkError>,
    calls: HashMap<Endpoint, usize>,
    submissions: Vec<OrderRequest>,
}

impl Script {
    fn take_failure(&mut self, endpoint: Endpoint) -> Option<NetworkError> {
        self.queued_failures
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front)
    }

    fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.tickers
            .iter()
            .find(|t| t.symbol == symbol)
            .map(|t| t.last_price)
    }

    /// Deterministic wobble so the demo dashboard has something to draw
    fn drift_factor(&mut self) -> Decimal {
        self.drift_step += 1;
        let offset = Decimal::from((self.drift_step % 7) as i64 - 3);
        Decimal::ONE + offset * dec!(0.0004)
    }

    fn drift_tickers(&mut self) {
        if !self.drift {
            return;
        }

        let factor = self.drift_factor();
        for tick in &mut self.tickers {
            tick.last_price = (tick.last_price * factor).round_dp(4);
            tick.sampled_at = Utc::now();
        }
    }

    fn drift_balance(&mut self) {
        if self.drift {
            let factor = self.drift_factor();
            self.balance = (self.balance * factor).round_dp(2);
        }
    }
}

/// Deterministic in-memory backend
///
/// Outcomes are scripted per endpoint: queued failures are consumed one per
/// call, otherwise the call succeeds from the in-memory state. Optional
/// latency keeps a request in flight across scheduler ticks.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeded backend for `--demo` runs and manual testing
    pub fn demo() -> Self {
        let backend = Self::new();
        let now = Utc::now();

        let seed = [
            ("BTCUSDT", dec!(45230.50), dec!(2.35), dec!(18234.6)),
            ("ETHUSDT", dec!(2450.75), dec!(-1.12), dec!(96120.4)),
            ("BNBUSDT", dec!(305.20), dec!(0.84), dec!(41077.0)),
            ("ADAUSDT", dec!(0.45), dec!(-0.67), dec!(8120044.0)),
            ("XRPUSDT", dec!(0.62), dec!(1.05), dec!(5500321.0)),
            ("SOLUSDT", dec!(95.80), dec!(3.41), dec!(733210.8)),
        ];

        let tickers = seed
            .iter()
            .map(|(symbol, price, change, volume)| MarketTick {
                symbol: symbol.to_string(),
                last_price: *price,
                change_percent: *change,
                volume: *volume,
                sampled_at: now,
            })
            .collect();

        let trades = (0..10u32)
            .map(|i| TradePrint {
                price: dec!(45230.50) + Decimal::from(i % 3) - Decimal::ONE,
                quantity: dec!(0.005) * Decimal::from(i + 1),
                side: if i % 2 == 0 { Side::Buy } else { Side::Sell },
                time: now - ChronoDuration::seconds(i64::from(i) * 3),
            })
            .collect();

        {
            let mut script = backend.lock();
            script.balance = dec!(15234.56);
            script.tickers = tickers;
            script.trades = trades;
            script.drift = true;
        }

        let history = [
            ("BTCUSDT", Side::Buy, Some(dec!(44000)), dec!(0.01), OrderStatus::Open),
            ("ETHUSDT", Side::Sell, Some(dec!(2500)), dec!(0.5), OrderStatus::Partial),
            ("BNBUSDT", Side::Buy, None, dec!(2), OrderStatus::Filled),
            ("SOLUSDT", Side::Buy, Some(dec!(90)), dec!(10), OrderStatus::Cancelled),
            ("XRPUSDT", Side::Sell, Some(dec!(0.70)), dec!(1500), OrderStatus::Open),
        ];

        for (i, (symbol, side, price, quantity, status)) in history.into_iter().enumerate() {
            let draft = match price {
                Some(p) => OrderDraft::limit(symbol, side, quantity, p),
                None => OrderDraft::market(symbol, side, quantity),
            };
            let filled = match status {
                OrderStatus::Filled => quantity,
                OrderStatus::Partial => quantity / dec!(2),
                _ => Decimal::ZERO,
            };
            let created = now - ChronoDuration::minutes(30 * (i as i64 + 1));

            if let Ok(order) = Order::restore(
                OrderId::new(format!("{}", 900 + i)),
                &draft,
                status,
                filled,
                created,
                created,
                Vec::new(),
            ) {
                backend.insert_order(order);
            }
        }

        backend
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.lock().balance = balance;
    }

    pub fn set_tickers(&self, tickers: Vec<MarketTick>) {
        self.lock().tickers = tickers;
    }

    pub fn set_order_book(&self, book: OrderBookSnapshot) {
        self.lock().books.insert(book.symbol().to_string(), book);
    }

    pub fn set_trades(&self, trades: Vec<TradePrint>) {
        self.lock().trades = trades;
    }

    /// Add or replace an order in the backend's own book-keeping
    pub fn insert_order(&self, order: Order) {
        let mut script = self.lock();
        script.orders.retain(|o| o.id() != order.id());
        script.orders.push(order);
    }

    pub fn remove_order(&self, order_id: &OrderId) {
        self.lock().orders.retain(|o| o.id() != order_id);
    }

    /// Status the next submissions are acknowledged with (default OPEN)
    pub fn set_submit_status(&self, status: OrderStatus) {
        self.lock().submit_status = Some(status);
    }

    /// Status cancels are acknowledged with (default CANCELLED). FILLED
    /// stands in for an order that filled before the cancel reached it.
    pub fn set_cancel_status(&self, status: OrderStatus) {
        self.lock().cancel_status = Some(status);
    }

    pub fn set_latency(&self, endpoint: Endpoint, latency: Duration) {
        self.lock().latency.insert(endpoint, latency);
    }

    /// Queue a failure for the next call to `endpoint`
    pub fn fail_next(&self, endpoint: Endpoint, error: NetworkError) {
        self.lock()
            .queued_failures
            .entry(endpoint)
            .or_default()
            .push_back(error);
    }

    /// Every cancel of `order_id` fails with `error`
    pub fn fail_cancel_of(&self, order_id: OrderId, error: NetworkError) {
        self.lock().cancel_failures.insert(order_id, error);
    }

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.lock().calls.get(&endpoint).copied().unwrap_or(0)
    }

    pub fn submissions(&self) -> Vec<OrderRequest> {
        self.lock().submissions.clone()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.lock().orders.clone()
    }

    /// Count the call and wait out any scripted latency
    async fn enter(&self, endpoint: Endpoint) {
        let latency = {
            let mut script = self.lock();
            *script.calls.entry(endpoint).or_insert(0) += 1;
            script.latency.get(&endpoint).copied()
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Resolve a call: a queued failure wins, otherwise `f` answers from state
    fn respond<T>(&self, endpoint: Endpoint, f: impl FnOnce(&mut Script) -> ApiResult<T>) -> ApiResult<T> {
        let mut script = self.lock();
        match script.take_failure(endpoint) {
            Some(error) => Err(error),
            None => f(&mut script),
        }
    }
}

/// Ten-level ladder at ±0.05% steps around `price`
fn synthetic_book(symbol: &str, price: Decimal, depth: usize) -> OrderBookSnapshot {
    let step = dec!(0.0005);
    let levels = depth.min(10);

    let bids = (0..levels)
        .map(|i| BookLevel {
            price: (price * (Decimal::ONE - step * Decimal::from(i + 1))).round_dp(2),
            amount: dec!(0.25) * Decimal::from(i + 1),
        })
        .collect();
    let asks = (0..levels)
        .map(|i| BookLevel {
            price: (price * (Decimal::ONE + step * Decimal::from(i + 1))).round_dp(2),
            amount: dec!(0.2) * Decimal::from(i + 1),
        })
        .collect();

    OrderBookSnapshot::new(symbol, bids, asks, Utc::now())
}

fn rejected(message: impl Into<String>) -> NetworkError {
    NetworkError::Rejected {
        status: 400,
        message: message.into(),
    }
}

impl TradingBackend for ScriptedBackend {
    async fn fetch_wallet_balance(&self) -> ApiResult<Decimal> {
        self.enter(Endpoint::Balance).await;
        self.respond(Endpoint::Balance, |s| {
            let balance = s.balance;
            s.drift_balance();
            Ok(balance)
        })
    }

    async fn fetch_tickers(&self, symbols: &[String]) -> ApiResult<Vec<MarketTick>> {
        self.enter(Endpoint::Tickers).await;
        self.respond(Endpoint::Tickers, |s| {
            let tickers: Vec<MarketTick> = s
                .tickers
                .iter()
                .filter(|t| symbols.is_empty() || symbols.contains(&t.symbol))
                .cloned()
                .collect();
            s.drift_tickers();
            Ok(tickers)
        })
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> ApiResult<OrderBookSnapshot> {
        self.enter(Endpoint::OrderBook).await;
        self.respond(Endpoint::OrderBook, |s| {
            if let Some(book) = s.books.get(symbol) {
                return Ok(book.clone());
            }

            Ok(match s.last_price(symbol) {
                Some(price) => synthetic_book(symbol, price, depth),
                None => OrderBookSnapshot::new(symbol, Vec::new(), Vec::new(), Utc::now()),
            })
        })
    }

    async fn fetch_recent_trades(&self, _symbol: &str, limit: usize) -> ApiResult<Vec<TradePrint>> {
        self.enter(Endpoint::Trades).await;
        self.respond(Endpoint::Trades, |s| {
            Ok(s.trades.iter().take(limit).cloned().collect())
        })
    }

    async fn fetch_open_orders(&self) -> ApiResult<Vec<Order>> {
        self.enter(Endpoint::OpenOrders).await;
        self.respond(Endpoint::OpenOrders, |s| {
            Ok(s.orders
                .iter()
                .filter(|o| o.is_cancellable())
                .cloned()
                .collect())
        })
    }

    async fn fetch_orders(&self, query: &OrderQuery) -> ApiResult<Vec<Order>> {
        self.enter(Endpoint::Orders).await;
        self.respond(Endpoint::Orders, |s| {
            let mut matching: Vec<Order> = s
                .orders
                .iter()
                .filter(|o| query.symbol.as_deref().map_or(true, |sym| o.symbol() == sym))
                .filter(|o| query.status.map_or(true, |st| o.status() == st))
                .cloned()
                .collect();

            if let Some(limit) = query.limit {
                matching.truncate(limit as usize);
            }
            Ok(matching)
        })
    }

    async fn submit_order(&self, request: &OrderRequest) -> ApiResult<SubmitAck> {
        self.enter(Endpoint::Submit).await;
        self.respond(Endpoint::Submit, |s| {
            s.submissions.push(request.clone());

            let draft = OrderDraft {
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: request.order_type,
                quantity: request.quantity,
                limit_price: request.price,
            };
            draft.validate().map_err(|e| rejected(e.to_string()))?;

            let status = s.submit_status.unwrap_or(OrderStatus::Open);
            let filled = match status {
                OrderStatus::Filled => request.quantity,
                _ => Decimal::ZERO,
            };

            let now = Utc::now();
            let mut fills = Vec::new();
            if !filled.is_zero() {
                let price = match request.order_type {
                    OrderType::Limit => request.price,
                    OrderType::Market => s.last_price(&request.symbol),
                }
                .unwrap_or(Decimal::ZERO);

                fills.push(Fill {
                    fill_id: format!("fill-{}", s.next_order_id),
                    price,
                    quantity: filled,
                    commission: (price * filled * dec!(0.0004)).round_dp(8),
                    time: now,
                });
            }

            s.next_order_id += 1;
            let order_id = OrderId::new(format!("{}", 10_000 + s.next_order_id));
            let order = Order::restore(order_id.clone(), &draft, status, filled, now, now, fills)
                .map_err(|e| rejected(e.to_string()))?;
            s.orders.push(order);

            Ok(SubmitAck {
                order_id,
                status,
                filled_quantity: filled,
            })
        })
    }

    async fn cancel_order(&self, order_id: &OrderId) -> ApiResult<CancelAck> {
        self.enter(Endpoint::Cancel).await;
        self.respond(Endpoint::Cancel, |s| {
            if let Some(error) = s.cancel_failures.get(order_id) {
                return Err(error.clone());
            }

            let status = s.cancel_status.unwrap_or(OrderStatus::Cancelled);
            let order = s
                .orders
                .iter_mut()
                .find(|o| o.id() == order_id)
                .ok_or_else(|| rejected(format!("Unknown order {}", order_id)))?;

            order
                .transition(status, Utc::now())
                .map_err(|e| rejected(e.to_string()))?;

            Ok(CancelAck {
                order_id: order_id.clone(),
                status,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_failure_consumed_once() {
        let backend = ScriptedBackend::new();
        backend.set_balance(dec!(100));
        backend.fail_next(Endpoint::Balance, NetworkError::Timeout);

        assert_eq!(
            backend.fetch_wallet_balance().await,
            Err(NetworkError::Timeout)
        );
        assert_eq!(backend.fetch_wallet_balance().await, Ok(dec!(100)));
        assert_eq!(backend.calls(Endpoint::Balance), 2);
    }

    #[tokio::test]
    async fn test_submit_then_cancel() {
        let backend = ScriptedBackend::new();
        let request = OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(0.01),
            price: Some(dec!(44000)),
        };

        let ack = backend.submit_order(&request).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(backend.fetch_open_orders().await.unwrap().len(), 1);

        let cancel = backend.cancel_order(&ack.order_id).await.unwrap();
        assert_eq!(cancel.status, OrderStatus::Cancelled);
        assert!(backend.fetch_open_orders().await.unwrap().is_empty());

        // A cancelled order cannot be cancelled again
        assert!(backend.cancel_order(&ack.order_id).await.is_err());
    }

    #[tokio::test]
    async fn test_filled_submission_records_fill() {
        let backend = ScriptedBackend::demo();
        backend.set_submit_status(OrderStatus::Filled);

        let request = OrderRequest {
            symbol: "ETHUSDT".to_string(),
            side: Side::Sell,
            order_type: OrderType::Market,
            quantity: dec!(1),
            price: None,
        };
        let ack = backend.submit_order(&request).await.unwrap();
        assert_eq!(ack.filled_quantity, dec!(1));

        let orders = backend.orders();
        let stored = orders.iter().find(|o| o.id() == &ack.order_id).unwrap();
        assert_eq!(stored.fills().len(), 1);
        assert_eq!(stored.avg_fill_price(), Some(dec!(2450.75)));
    }

    #[tokio::test]
    async fn test_demo_book_is_full() {
        let backend = ScriptedBackend::demo();
        let book = backend.fetch_order_book("BTCUSDT", 10).await.unwrap();

        assert_eq!(book.bids().len(), 10);
        assert_eq!(book.asks().len(), 10);
        assert!(book.spread().unwrap() > Decimal::ZERO);

        let unknown = backend.fetch_order_book("FOOBAR", 10).await.unwrap();
        assert!(unknown.spread().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_response() {
        let backend = ScriptedBackend::new();
        backend.set_latency(Endpoint::Trades, Duration::from_secs(3));

        let started = tokio::time::Instant::now();
        backend.fetch_recent_trades("BTCUSDT", 10).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
