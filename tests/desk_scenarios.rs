// End-to-end scenarios over a running session and the scripted backend
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use tradedesk::api::scripted::{Endpoint, ScriptedBackend};
use tradedesk::api::OrderQuery;
use tradedesk::execution::{FeedSettings, SelectAllState, Series};
use tradedesk::models::{
    BookLevel, Order, OrderBookSnapshot, OrderDraft, OrderId, OrderStatus, Side,
};
use tradedesk::session::{DeskEvent, Intent, Session};
use tradedesk::NetworkError;

struct Desk {
    tx: mpsc::Sender<Intent>,
    events: broadcast::Receiver<DeskEvent>,
    task: JoinHandle<Session<ScriptedBackend>>,
}

impl Desk {
    fn start(backend: &ScriptedBackend, page_size: usize) -> Self {
        let mut session = Session::new(backend.clone(), FeedSettings::default(), page_size);
        let events = session.subscribe();
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(async move {
            session.run(rx).await;
            session
        });
        Self { tx, events, task }
    }

    async fn send(&self, intent: Intent) {
        self.tx.send(intent).await.unwrap();
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Intent) -> T {
        let (reply, answer) = oneshot::channel();
        self.send(build(reply)).await;
        answer.await.unwrap()
    }

    async fn refresh(&self) {
        self.request(|reply| Intent::Refresh {
            query: OrderQuery::default(),
            reply,
        })
        .await
        .unwrap();
    }

    /// Wait for the first event matching `pred`, returning everything seen on the way
    async fn wait_for(&mut self, pred: impl Fn(&DeskEvent) -> bool) -> Vec<DeskEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.events.recv().await.unwrap();
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    async fn finish(self) -> Session<ScriptedBackend> {
        self.tx.send(Intent::Shutdown).await.unwrap();
        self.task.await.unwrap()
    }
}

fn order(id: &str, symbol: &str, status: OrderStatus, minutes_ago: i64) -> Order {
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let created = base - ChronoDuration::minutes(minutes_ago);
    let draft = OrderDraft::limit(symbol, Side::Buy, dec!(1), dec!(100));
    Order::restore(
        OrderId::new(id),
        &draft,
        status,
        Decimal::ZERO,
        created,
        created,
        Vec::new(),
    )
    .unwrap()
}

fn book(bid: Decimal, ask: Decimal) -> OrderBookSnapshot {
    OrderBookSnapshot::new(
        "BTCUSDT",
        vec![BookLevel {
            price: bid,
            amount: dec!(1),
        }],
        vec![BookLevel {
            price: ask,
            amount: dec!(1),
        }],
        Utc::now(),
    )
}

#[tokio::test]
async fn limit_order_is_priced_then_submitted_once() {
    let backend = ScriptedBackend::new();
    let mut desk = Desk::start(&backend, 10);

    let draft = OrderDraft::limit("BTCUSDT", Side::Buy, dec!(0.01), dec!(44000));
    let estimate = desk
        .request(|reply| Intent::Place {
            draft: draft.clone(),
            reply,
        })
        .await
        .unwrap();

    assert_eq!(estimate.estimated_cost, Some(dec!(440.00)));
    assert_eq!(backend.calls(Endpoint::Submit), 0);

    let outcome = desk
        .request(|reply| Intent::Confirm {
            id: estimate.order_id.clone(),
            reply,
        })
        .await
        .unwrap();
    assert_eq!(outcome.order.status(), OrderStatus::Open);

    let again = desk
        .request(|reply| Intent::Confirm {
            id: estimate.order_id.clone(),
            reply,
        })
        .await;
    assert!(again.is_err());

    desk.wait_for(|e| matches!(e, DeskEvent::OrderUpdated(o) if o.status() == OrderStatus::Open))
        .await;

    let session = desk.finish().await;
    assert_eq!(backend.calls(Endpoint::Submit), 1);
    assert_eq!(backend.submissions()[0].price, Some(dec!(44000)));
    assert_eq!(session.orders().len(), 1);
}

#[tokio::test]
async fn fifty_orders_page_newest_first() {
    let backend = ScriptedBackend::new();
    for i in (0..50).rev() {
        backend.insert_order(order(&format!("ord-{:02}", i), "BTCUSDT", OrderStatus::Open, i));
    }

    let desk = Desk::start(&backend, 10);
    desk.refresh().await;
    let session = desk.finish().await;

    let list = session.orders();
    assert_eq!(list.pagination().total_pages(), 5);

    let page: Vec<&str> = list.page().iter().map(|o| o.id().as_str()).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("ord-{:02}", i)).collect();
    assert_eq!(page, expected);
}

#[tokio::test(start_paused = true)]
async fn failed_book_refreshes_keep_ticking() {
    let backend = ScriptedBackend::new();
    backend.set_order_book(book(dec!(100), dec!(101)));
    let mut desk = Desk::start(&backend, 10);

    desk.send(Intent::SetFocus("BTCUSDT".into())).await;
    desk.send(Intent::StartFeed {
        symbols: vec!["BTCUSDT".into()],
        interval: Duration::from_secs(5),
    })
    .await;

    desk.wait_for(|e| matches!(e, DeskEvent::OrderBookUpdated { .. }))
        .await;

    for _ in 0..3 {
        backend.fail_next(Endpoint::OrderBook, NetworkError::Timeout);
    }
    backend.set_order_book(book(dec!(100), dec!(102)));

    let seen = desk
        .wait_for(|e| matches!(e, DeskEvent::OrderBookUpdated { .. }))
        .await;

    let book_failures = seen
        .iter()
        .filter(|e| {
            matches!(
                e,
                DeskEvent::FeedError {
                    series: Series::OrderBook,
                    ..
                }
            )
        })
        .count();
    assert_eq!(book_failures, 3);
    assert_eq!(
        seen.last(),
        Some(&DeskEvent::OrderBookUpdated {
            spread: Some(dec!(2))
        })
    );

    let session = desk.finish().await;
    assert!(!session.feed().is_running());
    assert_eq!(session.feed().health(Series::OrderBook).consecutive_failures, 0);
    assert_eq!(backend.calls(Endpoint::OrderBook), 5);
}

#[tokio::test]
async fn bulk_cancel_reports_each_id() {
    let backend = ScriptedBackend::new();
    backend.insert_order(order("a", "BTCUSDT", OrderStatus::Open, 1));
    backend.insert_order(order("b", "ETHUSDT", OrderStatus::Partial, 2));
    backend.insert_order(order("c", "BTCUSDT", OrderStatus::Open, 3));
    backend.fail_cancel_of(
        OrderId::new("b"),
        NetworkError::Rejected {
            status: 400,
            message: "Order is being matched".into(),
        },
    );

    let mut desk = Desk::start(&backend, 10);
    desk.refresh().await;

    desk.send(Intent::ToggleSelectAll).await;
    let report = desk
        .request(|reply| Intent::CancelSelected { reply })
        .await;

    let mut cancelled = report.cancelled_ids();
    cancelled.sort();
    assert_eq!(cancelled, vec![OrderId::new("a"), OrderId::new("c")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, OrderId::new("b"));
    assert!(report.clone().into_result().is_err());

    desk.wait_for(|e| matches!(e, DeskEvent::CancelReported(_)))
        .await;
    let session = desk.finish().await;

    let list = session.orders();
    assert_eq!(list.get(&OrderId::new("a")).unwrap().status(), OrderStatus::Cancelled);
    assert_eq!(list.get(&OrderId::new("b")).unwrap().status(), OrderStatus::Partial);
    assert_eq!(list.get(&OrderId::new("c")).unwrap().status(), OrderStatus::Cancelled);
    assert!(!session.lifecycle().is_cancelling(&OrderId::new("b")));
}

#[tokio::test]
async fn selection_follows_refreshes() {
    let backend = ScriptedBackend::new();
    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        backend.insert_order(order(id, "BTCUSDT", OrderStatus::Open, i as i64));
    }

    let mut desk = Desk::start(&backend, 10);
    desk.refresh().await;

    desk.send(Intent::ToggleSelectAll).await;
    desk.send(Intent::ToggleSelect(OrderId::new("b"))).await;
    desk.wait_for(|e| *e == DeskEvent::SelectionChanged(SelectAllState::Indeterminate))
        .await;

    // "c" disappears on the backend; its selection goes with it
    backend.remove_order(&OrderId::new("c"));
    desk.refresh().await;

    let seen = desk
        .wait_for(|e| matches!(e, DeskEvent::OrdersReplaced { .. }))
        .await;
    assert_eq!(
        seen.last(),
        Some(&DeskEvent::OrdersReplaced {
            total: 2,
            pruned: vec![OrderId::new("c")],
        })
    );

    let session = desk.finish().await;
    assert_eq!(session.orders().selected_ids(), vec![OrderId::new("a")]);
}

#[tokio::test(start_paused = true)]
async fn open_orders_series_updates_canonical_list() {
    let backend = ScriptedBackend::new();
    backend.insert_order(order("a", "BTCUSDT", OrderStatus::Open, 1));

    let mut desk = Desk::start(&backend, 10);
    desk.refresh().await;

    // The backend reports a partial fill on the next poll
    backend.remove_order(&OrderId::new("a"));
    let draft = OrderDraft::limit("BTCUSDT", Side::Buy, dec!(1), dec!(100));
    let created = order("a", "BTCUSDT", OrderStatus::Open, 1).created_at();
    backend.insert_order(
        Order::restore(
            OrderId::new("a"),
            &draft,
            OrderStatus::Partial,
            dec!(0.4),
            created,
            Utc::now(),
            Vec::new(),
        )
        .unwrap(),
    );

    desk.send(Intent::StartFeed {
        symbols: vec!["BTCUSDT".into()],
        interval: Duration::from_secs(5),
    })
    .await;

    let seen = desk
        .wait_for(|e| matches!(e, DeskEvent::OpenOrdersUpdated))
        .await;
    assert!(seen.iter().any(|e| matches!(
        e,
        DeskEvent::OrderUpdated(o) if o.id().as_str() == "a" && o.filled_quantity() == dec!(0.4)
    )));

    let session = desk.finish().await;
    let a = session.orders().get(&OrderId::new("a")).unwrap();
    assert_eq!(a.status(), OrderStatus::Partial);
    assert_eq!(a.remaining_quantity(), dec!(0.6));
}

#[tokio::test]
async fn cancel_that_loses_to_a_fill_is_reported_failed() {
    let backend = ScriptedBackend::new();
    backend.insert_order(order("a", "BTCUSDT", OrderStatus::Open, 1));
    backend.set_cancel_status(OrderStatus::Filled);

    let desk = Desk::start(&backend, 10);
    desk.refresh().await;

    let report = desk
        .request(|reply| Intent::Cancel {
            ids: vec![OrderId::new("a")],
            reply,
        })
        .await;

    assert!(report.cancelled.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, OrderId::new("a"));
    assert!(report.into_result().is_err());

    let session = desk.finish().await;
    assert_eq!(
        session.orders().get(&OrderId::new("a")).unwrap().status(),
        OrderStatus::Filled
    );
}
