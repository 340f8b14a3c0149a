use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::error::NetworkError;
use crate::execution::{CancelReport, PaginationState, SelectAllState, Series};
use crate::models::{Order, OrderId};

/// State-change notifications for whatever renders the desk
///
/// Subscribers only read. Every mutation goes back through an intent.
#[derive(Debug, Clone, PartialEq)]
pub enum DeskEvent {
    // market data
    TickersUpdated,
    OrderBookUpdated {
        spread: Option<Decimal>,
    },
    TradesUpdated,
    OpenOrdersUpdated,
    BalanceUpdated(Decimal),
    FeedError {
        series: Series,
        error: NetworkError,
    },
    FetchSkipped {
        series: Series,
    },
    FeedStopped,

    // orders
    OrderUpdated(Order),
    SubmissionFailed {
        order_id: OrderId,
        error: NetworkError,
    },
    OrdersReplaced {
        total: usize,
        pruned: Vec<OrderId>,
    },
    CancelReported(CancelReport),

    // list view
    ViewChanged(PaginationState),
    SelectionChanged(SelectAllState),
}

/// Fan-out of `DeskEvent`s over a broadcast channel
///
/// Publishing never blocks. A subscriber that falls more than `capacity`
/// events behind sees `RecvError::Lagged` and skips ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DeskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeskEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: DeskEvent) {
        // Err only means nobody is listening
        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
