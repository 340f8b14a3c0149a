// Market-data polling, order lifecycle and the order list
pub mod feed;
pub mod history;
pub mod lifecycle;
pub mod order_list;
pub mod scheduler;

pub use feed::{FeedEvent, FeedManager, FeedSettings, Series, SeriesData, SeriesHealth};
pub use history::{BalanceHistory, BalancePoint};
pub use lifecycle::{CancelReport, ConfirmOutcome, CostEstimate, OrderLifecycle};
pub use order_list::{
    ListChange, OrderFilter, OrderList, OrderStats, PaginationState, SelectAllState,
};
pub use scheduler::{CancelToken, Scheduler};
