use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

use crate::api::{ApiResult, CancelAck, OrderRequest, SubmitAck};
use crate::error::{DeskError, NetworkError, ValidationError};
use crate::models::{Order, OrderDraft, OrderId, OrderStatus, OrderType};

/// What the confirmation prompt shows before anything is sent
#[derive(Debug, Clone, PartialEq)]
pub struct CostEstimate {
    pub order_id: OrderId,
    /// Limit price, or the last ticker price for MARKET orders
    pub effective_price: Option<Decimal>,
    /// `quantity × effective_price`, absent when no price is known yet
    pub estimated_cost: Option<Decimal>,
}

/// Result of a submission, success or not
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmOutcome {
    pub order: Order,
    /// Local id the order carried before the backend assigned one
    pub replaces: OrderId,
    pub error: Option<NetworkError>,
}

/// Per-id result of a bulk cancel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CancelReport {
    pub cancelled: Vec<Order>,
    pub failed: Vec<(OrderId, String)>,
}

impl CancelReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn cancelled_ids(&self) -> Vec<OrderId> {
        self.cancelled.iter().map(|o| o.id().clone()).collect()
    }

    /// Collapse into an error only when at least one id failed
    pub fn into_result(self) -> Result<Vec<OrderId>, DeskError> {
        let succeeded = self.cancelled_ids();
        if self.failed.is_empty() {
            Ok(succeeded)
        } else {
            Err(DeskError::PartialBatchFailure {
                succeeded,
                failed: self.failed,
            })
        }
    }
}

/// Drives orders from draft through submission and cancellation
///
/// Holds drafts until they are confirmed. Once an order is submitted the
/// canonical copy lives in the order list; this type only keeps the guards
/// that stop a draft being sent twice or a cancel being issued twice. The
/// requests themselves are sent by the caller, between a `begin_*` and the
/// matching `complete_*`.
#[derive(Debug, Default)]
pub struct OrderLifecycle {
    drafts: HashMap<OrderId, Order>,
    submitted: HashSet<OrderId>,
    cancelling: HashSet<OrderId>,
}

impl OrderLifecycle {
    pub fn new() -> Self {
        Self {
            drafts: HashMap::new(),
            submitted: HashSet::new(),
            cancelling: HashSet::new(),
        }
    }

    pub fn validate_draft(&self, draft: &OrderDraft) -> Result<(), ValidationError> {
        draft.validate()
    }

    /// Create the order and move it to PENDING_CONFIRMATION
    ///
    /// # Arguments
    /// * `draft` - What the operator entered
    /// * `reference_price` - Latest ticker price for the symbol, used by MARKET orders
    pub fn place_order(
        &mut self,
        draft: &OrderDraft,
        reference_price: Option<Decimal>,
    ) -> Result<CostEstimate, DeskError> {
        let mut order = Order::from_draft(draft)?;
        order.transition(OrderStatus::PendingConfirmation, Utc::now())?;

        let effective_price = match order.order_type() {
            OrderType::Limit => order.limit_price(),
            OrderType::Market => reference_price,
        };
        let estimated_cost = effective_price.map(|price| (order.quantity() * price).round_dp(2));

        tracing::info!(
            order_id = %order.id(),
            symbol = %order.symbol(),
            side = ?order.side(),
            quantity = %order.quantity(),
            "Order awaiting confirmation"
        );

        let estimate = CostEstimate {
            order_id: order.id().clone(),
            effective_price,
            estimated_cost,
        };
        self.drafts.insert(order.id().clone(), order);

        Ok(estimate)
    }

    pub fn draft(&self, id: &OrderId) -> Option<&Order> {
        self.drafts.get(id)
    }

    pub fn pending_drafts(&self) -> impl Iterator<Item = &Order> {
        self.drafts.values()
    }

    /// Throw away a draft the operator declined to confirm
    pub fn discard_draft(&mut self, id: &OrderId) -> Result<Order, DeskError> {
        if self.submitted.contains(id) {
            return Err(DeskError::AlreadySubmitted(id.clone()));
        }

        let order = self
            .drafts
            .remove(id)
            .ok_or_else(|| DeskError::UnknownOrder(id.clone()))?;

        tracing::info!(order_id = %id, "Draft discarded");
        Ok(order)
    }

    pub fn is_submitted(&self, id: &OrderId) -> bool {
        self.submitted.contains(id)
    }

    /// Move a pending draft to SUBMITTED and build the one request for it
    ///
    /// The draft can never be confirmed again after this returns `Ok`.
    pub fn begin_confirm(&mut self, id: &OrderId) -> Result<(Order, OrderRequest), DeskError> {
        if self.submitted.contains(id) {
            return Err(DeskError::AlreadySubmitted(id.clone()));
        }

        let mut order = self
            .drafts
            .remove(id)
            .ok_or_else(|| DeskError::UnknownOrder(id.clone()))?;

        if let Err(e) = order.transition(OrderStatus::Submitted, Utc::now()) {
            self.drafts.insert(id.clone(), order);
            return Err(e);
        }
        self.submitted.insert(id.clone());

        tracing::info!(order_id = %id, symbol = %order.symbol(), "Submitting order");

        let request = OrderRequest::from(&order);
        Ok((order, request))
    }

    /// Apply the backend's answer to a submission
    ///
    /// Any failure, including an ack with a status the order cannot take,
    /// leaves the order FAILED. Nothing is retried.
    pub fn complete_confirm(&mut self, mut order: Order, result: ApiResult<SubmitAck>) -> ConfirmOutcome {
        let replaces = order.id().clone();
        let now = Utc::now();

        let error = match result {
            Ok(ack) => {
                match order.acknowledge(ack.order_id.clone(), ack.status, ack.filled_quantity, now) {
                    Ok(()) => {
                        tracing::info!(
                            order_id = %order.id(),
                            local_id = %replaces,
                            status = %order.status(),
                            "Order submitted"
                        );
                        None
                    }
                    Err(e) => Some(NetworkError::Decode(format!(
                        "backend acknowledged {} with status {}: {}",
                        ack.order_id, ack.status, e
                    ))),
                }
            }
            Err(e) => Some(e),
        };

        if let Some(e) = &error {
            // SUBMITTED -> FAILED is always allowed
            let _ = order.transition(OrderStatus::Failed, now);
            tracing::warn!(order_id = %order.id(), "Order submission failed: {}", e);
        }

        ConfirmOutcome {
            order,
            replaces,
            error,
        }
    }

    /// Check that `order` may be cancelled and mark the cancel as in flight
    pub fn begin_cancel(&mut self, order: &Order) -> Result<(), DeskError> {
        if !order.is_cancellable() {
            return Err(DeskError::NotCancellable {
                id: order.id().clone(),
                status: order.status(),
            });
        }

        if !self.cancelling.insert(order.id().clone()) {
            return Err(DeskError::CancelInFlight(order.id().clone()));
        }

        tracing::info!(order_id = %order.id(), "Cancelling order");
        Ok(())
    }

    /// Apply the backend's answer to a cancel and record the id's verdict
    ///
    /// `sent` is the order as it was when the cancel went out, `current` the
    /// canonical copy now, or `None` if a refresh dropped it in the meantime.
    /// Only a CANCELLED ack counts as success; an order that filled first is
    /// updated but reported as failed. Returns the order's new state when the
    /// canonical copy should be replaced with it.
    pub fn complete_cancel(
        &mut self,
        sent: Order,
        current: Option<Order>,
        result: ApiResult<CancelAck>,
        report: &mut CancelReport,
    ) -> Option<Order> {
        let id = sent.id().clone();
        self.cancelling.remove(&id);

        let ack = match result {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!(order_id = %id, "Cancel failed: {}", e);
                report.failed.push((id, DeskError::Network(e).to_string()));
                return None;
            }
        };

        let listed = current.is_some();
        let mut order = current.unwrap_or(sent);
        if let Err(e) = order.transition(ack.status, Utc::now()) {
            tracing::warn!(order_id = %id, status = %ack.status, "Cancel ack does not fit the order: {}", e);
            report.failed.push((id, e.to_string()));
            return None;
        }

        match ack.status {
            OrderStatus::Cancelled => {
                tracing::info!(order_id = %id, "Order cancelled");
                report.cancelled.push(order.clone());
            }
            status => {
                tracing::warn!(order_id = %id, status = %status, "Backend did not cancel the order");
                let reason = match status {
                    OrderStatus::Filled => "filled before the cancel arrived".to_string(),
                    other => format!("still {} after the cancel", other),
                };
                report.failed.push((id, reason));
            }
        }

        if !listed {
            tracing::debug!(order_id = %order.id(), "Cancelled order left the list during the request");
        }
        listed.then_some(order)
    }

    pub fn is_cancelling(&self, id: &OrderId) -> bool {
        self.cancelling.contains(id)
    }
}
