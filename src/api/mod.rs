// Backend repository interface and its implementations
pub mod http;
pub mod scripted;

pub use http::HttpBackend;
pub use scripted::ScriptedBackend;

use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;

use crate::error::NetworkError;
use crate::models::{
    MarketTick, Order, OrderBookSnapshot, OrderId, OrderStatus, OrderType, Side, TradePrint,
};

pub type ApiResult<T> = std::result::Result<T, NetworkError>;

/// Body of `POST /place-order`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
}

impl From<&Order> for OrderRequest {
    fn from(order: &Order) -> Self {
        Self {
            symbol: order.symbol().to_string(),
            side: order.side(),
            order_type: order.order_type(),
            quantity: order.quantity(),
            price: order.limit_price(),
        }
    }
}

/// Backend acknowledgement of a submission
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitAck {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
}

/// Backend acknowledgement of a cancellation
#[derive(Debug, Clone, PartialEq)]
pub struct CancelAck {
    pub order_id: OrderId,
    pub status: OrderStatus,
}

/// Filters for a full order-list refresh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderQuery {
    pub symbol: Option<String>,
    pub status: Option<OrderStatus>,
    pub limit: Option<u32>,
}

impl OrderQuery {
    pub fn open() -> Self {
        Self {
            status: Some(OrderStatus::Open),
            ..Self::default()
        }
    }
}

/// Everything the core needs from the exchange-like backend.
///
/// Clones share the same underlying connection so fetches can be spawned
/// onto background tasks.
pub trait TradingBackend: Clone + Send + Sync + 'static {
    /// Wallet balance reported by `GET /test-connection`
    fn fetch_wallet_balance(&self) -> impl Future<Output = ApiResult<Decimal>> + Send;

    fn fetch_tickers(
        &self,
        symbols: &[String],
    ) -> impl Future<Output = ApiResult<Vec<MarketTick>>> + Send;

    fn fetch_order_book(
        &self,
        symbol: &str,
        depth: usize,
    ) -> impl Future<Output = ApiResult<OrderBookSnapshot>> + Send;

    fn fetch_recent_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> impl Future<Output = ApiResult<Vec<TradePrint>>> + Send;

    /// Live orders only; feeds the open-orders series
    fn fetch_open_orders(&self) -> impl Future<Output = ApiResult<Vec<Order>>> + Send;

    /// Full list refresh
    fn fetch_orders(&self, query: &OrderQuery)
        -> impl Future<Output = ApiResult<Vec<Order>>> + Send;

    fn submit_order(
        &self,
        request: &OrderRequest,
    ) -> impl Future<Output = ApiResult<SubmitAck>> + Send;

    fn cancel_order(&self, order_id: &OrderId)
        -> impl Future<Output = ApiResult<CancelAck>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderDraft;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_request_body() {
        let draft = OrderDraft::limit("BTCUSDT", Side::Buy, dec!(0.01), dec!(44000));
        let order = Order::from_draft(&draft).unwrap();
        let body = serde_json::to_value(OrderRequest::from(&order)).unwrap();

        assert_eq!(body["symbol"], "BTCUSDT");
        assert_eq!(body["side"], "BUY");
        assert_eq!(body["order_type"], "LIMIT");
        assert_eq!(body["quantity"], "0.01");
        assert_eq!(body["price"], "44000");
    }

    #[test]
    fn test_market_request_omits_price() {
        let draft = OrderDraft::market("ETHUSDT", Side::Sell, dec!(1));
        let order = Order::from_draft(&draft).unwrap();
        let body = serde_json::to_value(OrderRequest::from(&order)).unwrap();

        assert!(body.get("price").is_none());
    }
}
