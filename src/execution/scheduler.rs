use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};

/// Cancellation flag shared between a scheduler and whoever stops it
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Safe to call any number of times
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in self, so the channel cannot close under us
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-period tick source with an explicit stop
///
/// The first tick fires immediately. Late ticks are skipped rather than
/// bunched up, so a stalled loop never sees a burst of catch-up cycles.
#[derive(Debug)]
pub struct Scheduler {
    interval: Interval,
    token: CancelToken,
    period: Duration,
}

impl Scheduler {
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            interval,
            token: CancelToken::new(),
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Next tick, or `None` once cancelled
    pub async fn tick(&mut self) -> Option<Instant> {
        if self.token.is_cancelled() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            at = self.interval.tick() => Some(at),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}
