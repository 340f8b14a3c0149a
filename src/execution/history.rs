use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// One balance reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalancePoint {
    pub at: DateTime<Utc>,
    pub value: Decimal,
}

/// Rolling window of wallet balance readings
///
/// Oldest points fall off once `max_points` is reached.
#[derive(Debug, Clone)]
pub struct BalanceHistory {
    points: VecDeque<BalancePoint>,
    max_points: usize,
}

impl BalanceHistory {
    /// # Arguments
    /// * `max_points` - Maximum number of readings to keep (at least 1)
    pub fn new(max_points: usize) -> Self {
        let max_points = max_points.max(1);
        Self {
            points: VecDeque::with_capacity(max_points),
            max_points,
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>, value: Decimal) {
        self.points.push_back(BalancePoint { at, value });

        while self.points.len() > self.max_points {
            self.points.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&BalancePoint> {
        self.points.back()
    }

    /// The N most recent readings, oldest first
    pub fn recent(&self, n: usize) -> Vec<BalancePoint> {
        let skip = self.points.len().saturating_sub(n);
        self.points.iter().skip(skip).copied().collect()
    }

    /// Values as plot coordinates, oldest first
    pub fn series(&self) -> Vec<f64> {
        self.points
            .iter()
            .filter_map(|p| p.value.to_f64())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_points
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}
