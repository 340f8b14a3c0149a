// Single-task event loop tying the feed, the order lifecycle and the list together
pub mod events;

pub use events::{DeskEvent, EventBus};

use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};

use crate::api::{ApiResult, CancelAck, OrderQuery, SubmitAck, TradingBackend};
use crate::error::DeskError;
use crate::execution::{
    CancelReport, ConfirmOutcome, CostEstimate, FeedEvent, FeedManager, FeedSettings, ListChange,
    OrderFilter, OrderLifecycle, OrderList, Series,
};
use crate::models::{Order, OrderDraft, OrderId};

pub type Reply<T> = oneshot::Sender<T>;

/// Something the operator asked for
#[derive(Debug)]
pub enum Intent {
    // feed
    StartFeed {
        symbols: Vec<String>,
        interval: Duration,
    },
    StopFeed,
    SetFocus(String),

    // lifecycle
    Place {
        draft: OrderDraft,
        reply: Reply<Result<CostEstimate, DeskError>>,
    },
    Confirm {
        id: OrderId,
        reply: Reply<Result<ConfirmOutcome, DeskError>>,
    },
    Discard(OrderId),
    Cancel {
        ids: Vec<OrderId>,
        reply: Reply<CancelReport>,
    },
    CancelSelected {
        reply: Reply<CancelReport>,
    },
    Refresh {
        query: OrderQuery,
        reply: Reply<Result<ListChange, DeskError>>,
    },

    // list view
    ApplyFilter(OrderFilter),
    GoToPage(usize),
    NextPage,
    PreviousPage,
    ToggleSelect(OrderId),
    ToggleSelectAll,
    ClearSelection,

    Shutdown,
}

/// A backend request that finished off the loop task
enum Op {
    Submit {
        order: Order,
        result: ApiResult<SubmitAck>,
        reply: Reply<Result<ConfirmOutcome, DeskError>>,
    },
    Cancel {
        results: Vec<(Order, ApiResult<CancelAck>)>,
        rejected: Vec<(OrderId, String)>,
        reply: Reply<CancelReport>,
    },
    Refresh {
        result: ApiResult<Vec<Order>>,
        reply: Reply<Result<ListChange, DeskError>>,
    },
}

/// One operator's desk
///
/// Owns every piece of mutable state. Backend requests run as tasks, but
/// their results are applied here, one at a time, in completion order.
pub struct Session<B: TradingBackend> {
    backend: B,
    feed: FeedManager<B>,
    lifecycle: OrderLifecycle,
    orders: OrderList,
    bus: EventBus,
    ops: JoinSet<Op>,
}

impl<B: TradingBackend> Session<B> {
    pub fn new(backend: B, feed_settings: FeedSettings, page_size: usize) -> Self {
        Self {
            feed: FeedManager::new(backend.clone(), feed_settings),
            lifecycle: OrderLifecycle::new(),
            orders: OrderList::new(page_size),
            bus: EventBus::default(),
            ops: JoinSet::new(),
            backend,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeskEvent> {
        self.bus.subscribe()
    }

    pub fn feed(&self) -> &FeedManager<B> {
        &self.feed
    }

    pub fn orders(&self) -> &OrderList {
        &self.orders
    }

    pub fn lifecycle(&self) -> &OrderLifecycle {
        &self.lifecycle
    }

    /// Backend requests still outstanding
    pub fn pending_ops(&self) -> usize {
        self.ops.len()
    }

    /// Run until the intent channel closes or `Intent::Shutdown` arrives
    ///
    /// Submissions and cancels already sent are waited for before returning.
    pub async fn run(&mut self, mut intents: mpsc::Receiver<Intent>) {
        tracing::info!("Session started");

        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(Intent::Shutdown) | None => break,
                    Some(intent) => self.handle(intent),
                },
                event = self.feed.next_event() => self.on_feed_event(event),
                Some(joined) = self.ops.join_next(), if !self.ops.is_empty() => {
                    self.on_op(joined);
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop the feed and apply whatever is still in flight
    pub async fn shutdown(&mut self) {
        if self.feed.stop() {
            self.bus.publish(DeskEvent::FeedStopped);
        }

        if !self.ops.is_empty() {
            tracing::info!(pending = self.ops.len(), "Waiting for in-flight order requests");
        }
        while let Some(joined) = self.ops.join_next().await {
            self.on_op(joined);
        }

        tracing::info!("Session stopped");
    }

    /// Apply one intent. Anything needing the backend is spawned.
    pub fn handle(&mut self, intent: Intent) {
        match intent {
            Intent::StartFeed { symbols, interval } => {
                tracing::info!(symbols = symbols.len(), ?interval, "Starting market feed");
                self.feed.start(symbols, interval);
            }
            Intent::StopFeed => {
                if self.feed.stop() {
                    self.bus.publish(DeskEvent::FeedStopped);
                }
            }
            Intent::SetFocus(symbol) => self.feed.set_focus(symbol),

            Intent::Place { draft, reply } => {
                let _ = reply.send(self.place_order(&draft));
            }
            Intent::Confirm { id, reply } => self.confirm(&id, reply),
            Intent::Discard(id) => {
                if let Err(e) = self.lifecycle.discard_draft(&id) {
                    tracing::warn!(order_id = %id, "Cannot discard: {}", e);
                }
            }
            Intent::Cancel { ids, reply } => self.cancel(ids, reply),
            Intent::CancelSelected { reply } => {
                let ids = self.orders.selected_ids();
                self.cancel(ids, reply);
            }
            Intent::Refresh { query, reply } => self.refresh(query, reply),

            Intent::ApplyFilter(filter) => {
                self.orders.apply_filter(filter);
                self.publish_view();
            }
            Intent::GoToPage(n) => {
                if self.orders.go_to_page(n) {
                    self.publish_view();
                }
            }
            Intent::NextPage => {
                if self.orders.next_page() {
                    self.publish_view();
                }
            }
            Intent::PreviousPage => {
                if self.orders.previous_page() {
                    self.publish_view();
                }
            }
            Intent::ToggleSelect(id) => match self.orders.toggle_select(&id) {
                Ok(_) => self.publish_selection(),
                Err(e) => tracing::debug!("Ignoring selection toggle: {}", e),
            },
            Intent::ToggleSelectAll => {
                self.orders.toggle_select_all();
                self.publish_selection();
            }
            Intent::ClearSelection => {
                self.orders.clear_selection();
                self.publish_selection();
            }

            // handled by the loop
            Intent::Shutdown => {}
        }
    }

    /// Validate a draft and price it against the latest ticker
    pub fn place_order(&mut self, draft: &OrderDraft) -> Result<CostEstimate, DeskError> {
        let reference_price = self.feed.last_price(&draft.symbol);
        self.lifecycle.place_order(draft, reference_price)
    }

    fn confirm(&mut self, id: &OrderId, reply: Reply<Result<ConfirmOutcome, DeskError>>) {
        let (order, request) = match self.lifecycle.begin_confirm(id) {
            Ok(begun) => begun,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        // Listed from SUBMITTED on, under its local id until the ack
        self.list_order(order.clone(), None);

        let backend = self.backend.clone();
        self.ops.spawn(async move {
            let result = backend.submit_order(&request).await;
            Op::Submit {
                order,
                result,
                reply,
            }
        });
    }

    fn cancel(&mut self, ids: Vec<OrderId>, reply: Reply<CancelReport>) {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for id in ids {
            let Some(order) = self.orders.get(&id).cloned() else {
                rejected.push((id.clone(), DeskError::UnknownOrder(id).to_string()));
                continue;
            };
            match self.lifecycle.begin_cancel(&order) {
                Ok(()) => accepted.push(order),
                Err(e) => rejected.push((id, e.to_string())),
            }
        }

        let backend = self.backend.clone();
        self.ops.spawn(async move {
            let mut requests = JoinSet::new();
            for order in accepted {
                let backend = backend.clone();
                requests.spawn(async move {
                    let result = backend.cancel_order(order.id()).await;
                    (order, result)
                });
            }

            let mut results = Vec::new();
            while let Some(joined) = requests.join_next().await {
                match joined {
                    Ok(done) => results.push(done),
                    Err(e) => tracing::error!("Cancel request task failed: {}", e),
                }
            }

            Op::Cancel {
                results,
                rejected,
                reply,
            }
        });
    }

    fn refresh(&mut self, query: OrderQuery, reply: Reply<Result<ListChange, DeskError>>) {
        let backend = self.backend.clone();
        self.ops.spawn(async move {
            let result = backend.fetch_orders(&query).await;
            Op::Refresh { result, reply }
        });
    }

    fn on_op(&mut self, joined: Result<Op, JoinError>) {
        let op = match joined {
            Ok(op) => op,
            Err(e) => {
                tracing::error!("Order request task failed: {}", e);
                return;
            }
        };

        match op {
            Op::Submit {
                order,
                result,
                reply,
            } => {
                let outcome = self.lifecycle.complete_confirm(order, result);
                self.list_order(outcome.order.clone(), Some(&outcome.replaces));
                if let Some(error) = &outcome.error {
                    self.bus.publish(DeskEvent::SubmissionFailed {
                        order_id: outcome.order.id().clone(),
                        error: error.clone(),
                    });
                }
                let _ = reply.send(Ok(outcome));
            }

            Op::Cancel {
                results,
                rejected,
                reply,
            } => {
                let mut report = CancelReport {
                    cancelled: Vec::new(),
                    failed: rejected,
                };

                for (sent, result) in results {
                    // Apply against the copy as it stands now, not when the cancel was sent
                    let current = self.orders.get(sent.id()).cloned();
                    let settled = self
                        .lifecycle
                        .complete_cancel(sent, current, result, &mut report);
                    if let Some(order) = settled {
                        self.list_order(order, None);
                    }
                }

                if !report.is_complete() {
                    tracing::warn!(
                        cancelled = report.cancelled.len(),
                        failed = report.failed.len(),
                        "Bulk cancel partially failed"
                    );
                }
                self.bus.publish(DeskEvent::CancelReported(report.clone()));
                let _ = reply.send(report);
            }

            Op::Refresh { result, reply } => match result {
                Ok(orders) => {
                    let change = self.orders.replace_all(orders);
                    if let Some(stale) = change.stale_selection() {
                        tracing::debug!("{}", stale);
                    }
                    tracing::info!(
                        total = self.orders.len(),
                        pruned = change.pruned.len(),
                        "Order list refreshed"
                    );

                    self.bus.publish(DeskEvent::OrdersReplaced {
                        total: self.orders.len(),
                        pruned: change.pruned.clone(),
                    });
                    self.publish_view();
                    let _ = reply.send(Ok(change));
                }
                Err(e) => {
                    tracing::warn!("Order list refresh failed: {}", e);
                    let _ = reply.send(Err(DeskError::Network(e)));
                }
            },
        }
    }

    fn on_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Tick { skipped, .. } => {
                for series in skipped {
                    self.bus.publish(DeskEvent::FetchSkipped { series });
                }
            }
            FeedEvent::Updated(series) => self.on_series_updated(series),
            FeedEvent::Failed { series, error } => {
                self.bus.publish(DeskEvent::FeedError { series, error });
            }
            FeedEvent::Stopped => self.bus.publish(DeskEvent::FeedStopped),
        }
    }

    fn on_series_updated(&mut self, series: Series) {
        let event = match series {
            Series::Tickers => DeskEvent::TickersUpdated,
            Series::OrderBook => DeskEvent::OrderBookUpdated {
                spread: self.feed.spread(),
            },
            Series::Trades => DeskEvent::TradesUpdated,
            Series::OpenOrders => {
                let (changed, change) = self.orders.merge_updates(self.feed.open_orders());
                for order in changed {
                    self.bus.publish(DeskEvent::OrderUpdated(order));
                }
                if !change.pruned.is_empty() {
                    self.publish_selection();
                }
                DeskEvent::OpenOrdersUpdated
            }
            Series::Balance => match self.feed.balance() {
                Some(balance) => DeskEvent::BalanceUpdated(balance),
                None => return,
            },
        };
        self.bus.publish(event);
    }

    /// Put a lifecycle result into the list and announce it
    fn list_order(&mut self, order: Order, replaces: Option<&OrderId>) {
        let change = self.orders.upsert(order.clone(), replaces);
        self.bus.publish(DeskEvent::OrderUpdated(order));
        if !change.pruned.is_empty() {
            self.publish_selection();
        }
    }

    fn publish_view(&self) {
        self.bus
            .publish(DeskEvent::ViewChanged(self.orders.pagination()));
        self.publish_selection();
    }

    fn publish_selection(&self) {
        self.bus
            .publish(DeskEvent::SelectionChanged(self.orders.select_all_state()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::scripted::{Endpoint, ScriptedBackend};
    use crate::error::NetworkError;
    use crate::models::{OrderStatus, Side};
    use rust_decimal_macros::dec;

    fn session(backend: &ScriptedBackend) -> Session<ScriptedBackend> {
        Session::new(backend.clone(), FeedSettings::default(), 10)
    }

    async fn settle(session: &mut Session<ScriptedBackend>) {
        while let Some(joined) = session.ops.join_next().await {
            session.on_op(joined);
        }
    }

    #[tokio::test]
    async fn test_confirm_lists_order_under_backend_id() {
        let backend = ScriptedBackend::new();
        backend.set_submit_status(OrderStatus::Open);
        let mut session = session(&backend);
        let mut events = session.subscribe();

        let draft = OrderDraft::limit("BTCUSDT", Side::Buy, dec!(0.01), dec!(44000));
        let estimate = session.place_order(&draft).unwrap();
        assert_eq!(estimate.estimated_cost, Some(dec!(440.00)));
        assert!(session.orders().is_empty());

        let (tx, rx) = oneshot::channel();
        session.handle(Intent::Confirm {
            id: estimate.order_id.clone(),
            reply: tx,
        });
        assert_eq!(session.orders().len(), 1);
        assert_eq!(session.orders().orders()[0].status(), OrderStatus::Submitted);

        settle(&mut session).await;
        let outcome = rx.await.unwrap().unwrap();

        assert!(outcome.error.is_none());
        assert_eq!(session.orders().len(), 1);
        assert!(session.orders().get(&estimate.order_id).is_none());
        assert_eq!(
            session.orders().get(outcome.order.id()).unwrap().status(),
            OrderStatus::Open
        );

        assert!(matches!(events.recv().await.unwrap(), DeskEvent::OrderUpdated(o) if o.status() == OrderStatus::Submitted));
        assert!(matches!(events.recv().await.unwrap(), DeskEvent::OrderUpdated(o) if o.status() == OrderStatus::Open));
    }

    #[tokio::test]
    async fn test_failed_submission_is_listed_as_failed() {
        let backend = ScriptedBackend::new();
        backend.fail_next(Endpoint::Submit, NetworkError::Timeout);
        let mut session = session(&backend);
        let mut events = session.subscribe();

        let draft = OrderDraft::market("ETHUSDT", Side::Sell, dec!(1));
        let estimate = session.place_order(&draft).unwrap();
        let (tx, rx) = oneshot::channel();
        session.handle(Intent::Confirm {
            id: estimate.order_id.clone(),
            reply: tx,
        });
        settle(&mut session).await;

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.error, Some(NetworkError::Timeout));
        assert_eq!(
            session.orders().get(&estimate.order_id).unwrap().status(),
            OrderStatus::Failed
        );
        assert_eq!(backend.calls(Endpoint::Submit), 1);

        let _submitted = events.recv().await.unwrap();
        let _failed = events.recv().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            DeskEvent::SubmissionFailed { error: NetworkError::Timeout, .. }
        ));
    }

    #[tokio::test]
    async fn test_confirm_twice_is_refused() {
        let backend = ScriptedBackend::new();
        let mut session = session(&backend);

        let draft = OrderDraft::limit("BTCUSDT", Side::Buy, dec!(0.01), dec!(44000));
        let id = session.place_order(&draft).unwrap().order_id;

        let (tx1, _rx1) = oneshot::channel();
        session.handle(Intent::Confirm { id: id.clone(), reply: tx1 });
        let (tx2, rx2) = oneshot::channel();
        session.handle(Intent::Confirm { id: id.clone(), reply: tx2 });

        assert!(matches!(
            rx2.await.unwrap(),
            Err(DeskError::AlreadySubmitted(_))
        ));
        settle(&mut session).await;
        assert_eq!(backend.calls(Endpoint::Submit), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_reported() {
        let backend = ScriptedBackend::new();
        let mut session = session(&backend);

        let (tx, rx) = oneshot::channel();
        session.handle(Intent::Cancel {
            ids: vec![OrderId::new("nope")],
            reply: tx,
        });
        settle(&mut session).await;

        let report = rx.await.unwrap();
        assert!(report.cancelled.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(backend.calls(Endpoint::Cancel), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_answer_does_not_relist_dropped_order() {
        let backend = ScriptedBackend::new();
        let draft = OrderDraft::limit("BTCUSDT", Side::Buy, dec!(1), dec!(100));
        let now = chrono::Utc::now();
        backend.insert_order(
            Order::restore(OrderId::new("a"), &draft, OrderStatus::Open, dec!(0), now, now, Vec::new())
                .unwrap(),
        );
        let mut session = session(&backend);

        let (tx, rx) = oneshot::channel();
        session.handle(Intent::Refresh { query: OrderQuery::default(), reply: tx });
        settle(&mut session).await;
        rx.await.unwrap().unwrap();

        // The cancel is slow; a narrower refresh drops "a" before it answers
        backend.set_latency(Endpoint::Cancel, Duration::from_secs(1));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        session.handle(Intent::Cancel { ids: vec![OrderId::new("a")], reply: cancel_tx });
        let (tx, rx) = oneshot::channel();
        session.handle(Intent::Refresh {
            query: OrderQuery { symbol: Some("ETHUSDT".into()), ..OrderQuery::default() },
            reply: tx,
        });
        settle(&mut session).await;

        assert_eq!(rx.await.unwrap().unwrap().pruned, Vec::<OrderId>::new());
        let report = cancel_rx.await.unwrap();
        assert_eq!(report.cancelled_ids(), vec![OrderId::new("a")]);
        assert!(session.orders().is_empty());
        assert!(!session.lifecycle().is_cancelling(&OrderId::new("a")));
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_list() {
        let backend = ScriptedBackend::demo();
        let mut session = session(&backend);

        let (tx, rx) = oneshot::channel();
        session.handle(Intent::Refresh {
            query: OrderQuery::default(),
            reply: tx,
        });
        settle(&mut session).await;
        rx.await.unwrap().unwrap();
        let before = session.orders().len();
        assert!(before > 0);

        backend.fail_next(Endpoint::Orders, NetworkError::Timeout);
        let (tx, rx) = oneshot::channel();
        session.handle(Intent::Refresh {
            query: OrderQuery::default(),
            reply: tx,
        });
        settle(&mut session).await;

        assert!(matches!(rx.await.unwrap(), Err(DeskError::Network(NetworkError::Timeout))));
        assert_eq!(session.orders().len(), before);
    }

    #[tokio::test]
    async fn test_run_exits_when_intents_close() {
        let backend = ScriptedBackend::demo();
        let mut session = session(&backend);
        let (tx, rx) = mpsc::channel(8);

        let (reply, answer) = oneshot::channel();
        tx.send(Intent::Refresh {
            query: OrderQuery::default(),
            reply,
        })
        .await
        .unwrap();
        drop(tx);

        session.run(rx).await;

        // The refresh was dispatched before the channel closed and drained on shutdown
        assert!(answer.await.unwrap().is_ok());
        assert_eq!(session.pending_ops(), 0);
        assert!(!session.feed().is_running());
    }
}
