use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{DeskError, ValidationError};

const LOCAL_PREFIX: &str = "local-";

/// Order identity: server-assigned, or a `local-` token until the backend acks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh pending-local token
    pub fn local() -> Self {
        Self(format!("{}{}", LOCAL_PREFIX, Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// The exchange hands out numeric ids; our own tokens are strings.
impl<'de> Deserialize<'de> for OrderId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Number(u64),
            Text(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Number(n) => OrderId(n.to_string()),
            RawId::Text(s) => OrderId(s),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Draft,
    PendingConfirmation,
    Submitted,
    #[serde(alias = "NEW")]
    Open,
    #[serde(alias = "PARTIALLY_FILLED")]
    Partial,
    Filled,
    #[serde(alias = "CANCELED", alias = "EXPIRED")]
    Cancelled,
    #[serde(alias = "REJECTED")]
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// Only live orders at the exchange can be cancelled
    pub fn is_cancellable(self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::Partial)
    }

    /// Forward-only state machine; re-applying the current status is allowed
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Draft, PendingConfirmation)
                | (PendingConfirmation, Submitted)
                | (Submitted, Open | Partial | Filled | Failed)
                | (Open, Partial | Filled | Cancelled)
                | (Partial, Filled | Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Draft => "DRAFT",
            OrderStatus::PendingConfirmation => "PENDING_CONFIRMATION",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::Open => "OPEN",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single execution against an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub fill_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    pub time: DateTime<Utc>,
}

/// What the operator typed into the order form
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDraft {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
}

impl OrderDraft {
    pub fn market(symbol: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
        }
    }

    pub fn limit(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(limit_price),
        }
    }

    /// Local checks only; nothing here talks to the backend
    pub fn validate(&self) -> Result<(), ValidationError> {
        // Base and quote of 3 to 10 capital letters each, e.g. BTCUSDT
        let symbol_ok = (6..=20).contains(&self.symbol.len())
            && self.symbol.chars().all(|c| c.is_ascii_uppercase());
        if !symbol_ok {
            return Err(ValidationError::InvalidSymbol(self.symbol.clone()));
        }

        if self.quantity <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveQuantity(self.quantity));
        }

        match (self.order_type, self.limit_price) {
            (OrderType::Limit, None) => Err(ValidationError::MissingLimitPrice),
            (OrderType::Limit, Some(price)) if price <= Decimal::ZERO => {
                Err(ValidationError::NonPositiveLimitPrice(price))
            }
            (OrderType::Market, Some(_)) => Err(ValidationError::UnexpectedLimitPrice),
            _ => Ok(()),
        }
    }
}

/// An order as known to this session.
///
/// Fields are read through accessors so that `filled_quantity <= quantity`
/// and `limit_price.is_some() == (order_type == Limit)` cannot be broken
/// from outside.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    id: OrderId,
    symbol: String,
    order_type: OrderType,
    side: Side,
    quantity: Decimal,
    limit_price: Option<Decimal>,
    status: OrderStatus,
    filled_quantity: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    fills: Vec<Fill>,
}

impl Order {
    /// New DRAFT with a pending-local id
    pub fn from_draft(draft: &OrderDraft) -> Result<Self, ValidationError> {
        draft.validate()?;

        let now = Utc::now();
        Ok(Self {
            id: OrderId::local(),
            symbol: draft.symbol.clone(),
            order_type: draft.order_type,
            side: draft.side,
            quantity: draft.quantity,
            limit_price: draft.limit_price,
            status: OrderStatus::Draft,
            filled_quantity: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            fills: Vec::new(),
        })
    }

    /// Rebuild an order reported by the backend, checking the invariants
    pub fn restore(
        id: OrderId,
        draft: &OrderDraft,
        status: OrderStatus,
        filled_quantity: Decimal,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        fills: Vec<Fill>,
    ) -> Result<Self, ValidationError> {
        draft.validate()?;

        if filled_quantity < Decimal::ZERO || filled_quantity > draft.quantity {
            return Err(ValidationError::Overfilled {
                filled: filled_quantity,
                quantity: draft.quantity,
            });
        }

        Ok(Self {
            id,
            symbol: draft.symbol.clone(),
            order_type: draft.order_type,
            side: draft.side,
            quantity: draft.quantity,
            limit_price: draft.limit_price,
            status,
            filled_quantity,
            created_at,
            updated_at: updated_at.max(created_at),
            fills,
        })
    }

    pub fn id(&self) -> &OrderId {
        &self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn limit_price(&self) -> Option<Decimal> {
        self.limit_price
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn filled_quantity(&self) -> Decimal {
        self.filled_quantity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_cancellable(&self) -> bool {
        self.status.is_cancellable()
    }

    /// Quantity-weighted average over fills
    pub fn avg_fill_price(&self) -> Option<Decimal> {
        let filled: Decimal = self.fills.iter().map(|f| f.quantity).sum();
        if filled.is_zero() {
            return None;
        }

        let notional: Decimal = self.fills.iter().map(|f| f.price * f.quantity).sum();
        Some(notional / filled)
    }

    pub fn total_commission(&self) -> Decimal {
        self.fills.iter().map(|f| f.commission).sum()
    }

    /// Time between creation and the last update
    pub fn duration(&self) -> Duration {
        self.updated_at - self.created_at
    }

    /// Move to `to`, refusing anything the state machine does not allow
    pub fn transition(&mut self, to: OrderStatus, at: DateTime<Utc>) -> Result<(), DeskError> {
        if !self.status.can_transition_to(to) {
            return Err(DeskError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }

        self.status = to;
        self.updated_at = at.max(self.updated_at);
        Ok(())
    }

    /// Fold a newer backend view of this order into ours.
    ///
    /// Returns whether anything changed. Fill progress never goes backwards.
    pub fn apply_remote(&mut self, remote: &Order) -> Result<bool, DeskError> {
        if remote.status == self.status
            && remote.filled_quantity == self.filled_quantity
            && remote.fills.len() == self.fills.len()
        {
            return Ok(false);
        }

        self.transition(remote.status, remote.updated_at)?;

        if remote.filled_quantity > self.filled_quantity {
            self.filled_quantity = remote.filled_quantity.min(self.quantity);
        }
        if remote.fills.len() > self.fills.len() {
            self.fills = remote.fills.clone();
        }

        Ok(true)
    }

    /// Adopt the server id and status from a submission ack
    pub(crate) fn acknowledge(
        &mut self,
        id: OrderId,
        status: OrderStatus,
        filled_quantity: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), DeskError> {
        self.transition(status, at)?;
        self.id = id;

        if filled_quantity > self.quantity {
            tracing::warn!(
                order_id = %self.id,
                "ack reports filled {} above quantity {}, clamping",
                filled_quantity,
                self.quantity
            );
        }
        self.filled_quantity = filled_quantity.clamp(Decimal::ZERO, self.quantity);
        Ok(())
    }
}

/// One row of the ticker table
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTick {
    pub symbol: String,
    pub last_price: Decimal,
    pub change_percent: Decimal,
    pub volume: Decimal,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Depth snapshot; both sides held in price-descending order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    symbol: String,
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    sampled_at: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn new(
        symbol: impl Into<String>,
        mut bids: Vec<BookLevel>,
        mut asks: Vec<BookLevel>,
        sampled_at: DateTime<Utc>,
    ) -> Self {
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| b.price.cmp(&a.price));

        Self {
            symbol: symbol.into(),
            bids,
            asks,
            sampled_at,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bids(&self) -> &[BookLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[BookLevel] {
        &self.asks
    }

    pub fn sampled_at(&self) -> DateTime<Utc> {
        self.sampled_at
    }

    /// Highest bid
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    /// Lowest ask
    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.last()
    }

    /// Both sides present
    pub fn is_full(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    /// Absent unless the snapshot is full
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => Some(ask.price - bid.price),
            _ => None,
        }
    }
}

/// A public trade print from the recent-trades tape
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradePrint {
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    pub time: DateTime<Utc>,
}
