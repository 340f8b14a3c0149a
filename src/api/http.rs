use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{ApiResult, CancelAck, OrderQuery, OrderRequest, SubmitAck, TradingBackend};
use crate::error::{NetworkError, ValidationError};
use crate::models::{
    BookLevel, Fill, MarketTick, Order, OrderBookSnapshot, OrderDraft, OrderId, OrderStatus,
    OrderType, Side, TradePrint,
};

// Type alias for the rate limiter to simplify signatures
type BackendRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// HTTP client for the dashboard backend
///
/// Cloneable so fetches can run on spawned tasks. All clones share the
/// connection pool and the rate limiter. Requests are never retried here:
/// a failed fetch waits for the next cycle and a failed submission is final.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    rate_limiter: Arc<BackendRateLimiter>,
}

impl HttpBackend {
    /// Create a new backend client
    ///
    /// # Arguments
    /// * `base_url` - API root, e.g. `http://localhost:5000/api`
    /// * `timeout` - per-request timeout
    /// * `requests_per_second` - pacing quota shared by every clone
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        requests_per_second: u32,
    ) -> ApiResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limiter,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> ApiResult<T> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(url = %url, "GET");

        let response = self.client.get(&url).query(query).send().await?;
        read_envelope(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> ApiResult<T> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(url = %url, "POST");

        let response = self.client.post(&url).json(body).send().await?;
        read_envelope(response).await
    }
}

/// Unwrap the `{ status, message, ... }` envelope every endpoint answers with
async fn read_envelope<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
    let status = response.status();
    let text = response.text().await?;

    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) if !status.is_success() => {
            return Err(NetworkError::Rejected {
                status: status.as_u16(),
                message: text,
            })
        }
        Err(e) => return Err(NetworkError::Decode(e.to_string())),
    };

    let envelope_error = value.get("status").and_then(Value::as_str) == Some("error");
    if !status.is_success() || envelope_error {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();
        return Err(NetworkError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_value(value).map_err(|e| NetworkError::Decode(e.to_string()))
}

// ============================================================================
// Wire types
// ============================================================================

/// Exchange timestamps arrive as epoch millis or RFC 3339 strings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTime {
    Millis(i64),
    Text(String),
}

impl RawTime {
    fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTime::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
            RawTime::Text(s) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .ok(),
        }
    }
}

fn resolve_time(raw: Option<&RawTime>) -> Option<DateTime<Utc>> {
    raw.and_then(RawTime::to_utc)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    total_wallet_balance: Option<Decimal>,
    account: Option<RawAccount>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    #[serde(alias = "totalWalletBalance")]
    total_balance: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct TickersResponse {
    tickers: Vec<RawTicker>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker {
    symbol: String,
    last_price: Decimal,
    #[serde(alias = "changePercent")]
    price_change_percent: Decimal,
    volume: Decimal,
    close_time: Option<RawTime>,
}

impl From<RawTicker> for MarketTick {
    fn from(raw: RawTicker) -> Self {
        MarketTick {
            sampled_at: resolve_time(raw.close_time.as_ref()).unwrap_or_else(Utc::now),
            symbol: raw.symbol,
            last_price: raw.last_price,
            change_percent: raw.price_change_percent,
            volume: raw.volume,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    depth: RawDepth,
}

#[derive(Debug, Deserialize)]
struct RawDepth {
    #[serde(default)]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(default)]
    asks: Vec<(Decimal, Decimal)>,
    #[serde(rename = "E")]
    event_time: Option<RawTime>,
}

fn to_levels(raw: Vec<(Decimal, Decimal)>) -> Vec<BookLevel> {
    raw.into_iter()
        .map(|(price, amount)| BookLevel { price, amount })
        .collect()
}

#[derive(Debug, Deserialize)]
struct TradesResponse {
    trades: Vec<RawTrade>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTrade {
    price: Decimal,
    #[serde(alias = "quantity")]
    qty: Decimal,
    time: Option<RawTime>,
    #[serde(default)]
    is_buyer_maker: bool,
    side: Option<Side>,
}

impl From<RawTrade> for TradePrint {
    fn from(raw: RawTrade) -> Self {
        // The taker sold into a resting buy order
        let side = raw.side.unwrap_or(if raw.is_buyer_maker {
            Side::Sell
        } else {
            Side::Buy
        });

        TradePrint {
            price: raw.price,
            quantity: raw.qty,
            side,
            time: resolve_time(raw.time.as_ref()).unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrdersResponse {
    #[serde(default)]
    orders: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    #[serde(alias = "id")]
    order_id: OrderId,
    symbol: String,
    side: Side,
    #[serde(rename = "type", alias = "orderType")]
    order_type: OrderType,
    #[serde(alias = "origQty")]
    quantity: Decimal,
    #[serde(default, alias = "limitPrice")]
    price: Option<Decimal>,
    status: OrderStatus,
    #[serde(default, alias = "executedQty")]
    filled_quantity: Decimal,
    #[serde(alias = "time")]
    created_at: Option<RawTime>,
    #[serde(alias = "updateTime")]
    updated_at: Option<RawTime>,
    #[serde(default)]
    fills: Vec<Fill>,
}

impl TryFrom<RawOrder> for Order {
    type Error = ValidationError;

    fn try_from(raw: RawOrder) -> Result<Self, Self::Error> {
        let draft = match raw.order_type {
            OrderType::Limit => {
                let price = raw.price.ok_or(ValidationError::MissingLimitPrice)?;
                OrderDraft::limit(raw.symbol, raw.side, raw.quantity, price)
            }
            // The exchange reports "0" as the price of market orders
            OrderType::Market => OrderDraft::market(raw.symbol, raw.side, raw.quantity),
        };

        let created_at = resolve_time(raw.created_at.as_ref()).unwrap_or_else(Utc::now);
        let updated_at = resolve_time(raw.updated_at.as_ref()).unwrap_or(created_at);

        Order::restore(
            raw.order_id,
            &draft,
            raw.status,
            raw.filled_quantity,
            created_at,
            updated_at,
            raw.fills,
        )
    }
}

/// Decode order records one at a time so a single odd record
/// (e.g. a stop order type we do not model) does not sink the whole list
fn decode_orders(records: Vec<Value>) -> Vec<Order> {
    records
        .into_iter()
        .filter_map(|record| {
            let raw: RawOrder = match serde_json::from_value(record) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!("Skipping undecodable order record: {}", e);
                    return None;
                }
            };

            let order_id = raw.order_id.clone();
            match Order::try_from(raw) {
                Ok(order) => Some(order),
                Err(e) => {
                    tracing::warn!(order_id = %order_id, "Skipping invalid order record: {}", e);
                    None
                }
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAck {
    order_id: OrderId,
    status: OrderStatus,
    #[serde(default, alias = "executedQty")]
    filled_quantity: Decimal,
}

/// Acks come back either flat or nested under `key`
fn nested_or_flat(mut value: Value, key: &str) -> Value {
    match value.get_mut(key).map(Value::take) {
        Some(inner) if inner.is_object() => inner,
        _ => value,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody<'a> {
    order_id: &'a OrderId,
}

// ============================================================================
// Repository implementation
// ============================================================================

impl TradingBackend for HttpBackend {
    async fn fetch_wallet_balance(&self) -> ApiResult<Decimal> {
        let response: BalanceResponse = self.get("/test-connection", &[]).await?;

        response
            .total_wallet_balance
            .or_else(|| response.account.and_then(|a| a.total_balance))
            .ok_or_else(|| NetworkError::Decode("response carries no wallet balance".into()))
    }

    async fn fetch_tickers(&self, symbols: &[String]) -> ApiResult<Vec<MarketTick>> {
        let response: TickersResponse = self.get("/market/tickers", &[]).await?;

        Ok(response
            .tickers
            .into_iter()
            .filter(|t| symbols.is_empty() || symbols.contains(&t.symbol))
            .map(MarketTick::from)
            .collect())
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> ApiResult<OrderBookSnapshot> {
        let query = [("symbol", symbol.to_string()), ("limit", depth.to_string())];
        let response: DepthResponse = self.get("/market/depth", &query).await?;

        let sampled_at = resolve_time(response.depth.event_time.as_ref()).unwrap_or_else(Utc::now);
        Ok(OrderBookSnapshot::new(
            symbol,
            to_levels(response.depth.bids),
            to_levels(response.depth.asks),
            sampled_at,
        ))
    }

    async fn fetch_recent_trades(&self, symbol: &str, limit: usize) -> ApiResult<Vec<TradePrint>> {
        let query = [("symbol", symbol.to_string()), ("limit", limit.to_string())];
        let response: TradesResponse = self.get("/market/trades", &query).await?;

        Ok(response.trades.into_iter().map(TradePrint::from).collect())
    }

    async fn fetch_open_orders(&self) -> ApiResult<Vec<Order>> {
        self.fetch_orders(&OrderQuery::open()).await
    }

    async fn fetch_orders(&self, query: &OrderQuery) -> ApiResult<Vec<Order>> {
        let mut params = Vec::new();
        if let Some(symbol) = &query.symbol {
            params.push(("symbol", symbol.clone()));
        }
        if let Some(status) = query.status {
            params.push(("status", status.as_str().to_lowercase()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }

        let response: OrdersResponse = self.get("/orders", &params).await?;
        Ok(decode_orders(response.orders))
    }

    async fn submit_order(&self, request: &OrderRequest) -> ApiResult<SubmitAck> {
        let value: Value = self.post("/place-order", request).await?;
        let ack: RawAck = serde_json::from_value(nested_or_flat(value, "order"))
            .map_err(|e| NetworkError::Decode(e.to_string()))?;

        tracing::info!(
            order_id = %ack.order_id,
            status = %ack.status,
            "Order accepted by backend"
        );

        Ok(SubmitAck {
            order_id: ack.order_id,
            status: ack.status,
            filled_quantity: ack.filled_quantity,
        })
    }

    async fn cancel_order(&self, order_id: &OrderId) -> ApiResult<CancelAck> {
        let value: Value = self
            .post("/cancel-order", &CancelBody { order_id })
            .await?;
        let ack: RawAck = serde_json::from_value(nested_or_flat(value, "response"))
            .map_err(|e| NetworkError::Decode(e.to_string()))?;

        Ok(CancelAck {
            order_id: ack.order_id,
            status: ack.status,
        })
    }
}
