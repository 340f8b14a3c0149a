use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::ops::Range;

use crate::error::DeskError;
use crate::models::{Order, OrderId, OrderStatus};

/// Criteria for the visible view. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderFilter {
    /// Case-insensitive substring of the order id or symbol
    pub search: Option<String>,
    pub symbol: Option<String>,
    /// Any of these statuses; empty means any status
    pub statuses: Vec<OrderStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        if let Some(needle) = self.search.as_deref().filter(|s| !s.is_empty()) {
            let needle = needle.to_lowercase();
            let hit = order.id().as_str().to_lowercase().contains(&needle)
                || order.symbol().to_lowercase().contains(&needle);
            if !hit {
                return false;
            }
        }

        if let Some(symbol) = &self.symbol {
            if !order.symbol().eq_ignore_ascii_case(symbol) {
                return false;
            }
        }

        if !self.statuses.is_empty() && !self.statuses.contains(&order.status()) {
            return false;
        }

        if self.created_after.is_some_and(|after| order.created_at() < after) {
            return false;
        }

        !self.created_before.is_some_and(|before| order.created_at() > before)
    }
}

/// Pager over the visible view; pages are 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationState {
    pub page_size: usize,
    pub current_page: usize,
    pub total_items: usize,
}

impl PaginationState {
    /// Never less than 1, even for an empty view
    pub fn total_pages(&self) -> usize {
        self.total_items.div_ceil(self.page_size).max(1)
    }

    pub fn has_previous(&self) -> bool {
        self.current_page > 1
    }

    pub fn has_next(&self) -> bool {
        self.current_page < self.total_pages()
    }

    /// Index range of the current page within the visible view
    pub fn page_range(&self) -> Range<usize> {
        let start = (self.current_page - 1) * self.page_size;
        let end = (start + self.page_size).min(self.total_items);
        start.min(end)..end
    }
}

/// Header checkbox state over the current page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectAllState {
    Unchecked,
    Indeterminate,
    Checked,
}

impl SelectAllState {
    pub fn is_checked(self) -> bool {
        self == SelectAllState::Checked
    }

    pub fn is_indeterminate(self) -> bool {
        self == SelectAllState::Indeterminate
    }
}

/// Counts over the canonical collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderStats {
    pub total: usize,
    pub filled: usize,
    /// OPEN plus PARTIAL
    pub pending: usize,
    pub cancelled: usize,
    pub failed: usize,
}

/// Side effects of replacing or merging the canonical collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListChange {
    /// Selected ids that left the collection or were pushed off the current page
    pub pruned: Vec<OrderId>,
    /// The current page fell off the end and moved to the last page
    pub page_collapsed: bool,
}

impl ListChange {
    pub fn stale_selection(&self) -> Option<DeskError> {
        (!self.pruned.is_empty()).then(|| DeskError::StaleSelection {
            pruned: self.pruned.clone(),
        })
    }
}

/// Canonical order collection with filtered, paginated, selectable views
///
/// Orders are kept newest first by `created_at`. Ties keep arrival order.
#[derive(Debug, Clone)]
pub struct OrderList {
    orders: Vec<Order>,
    filter: OrderFilter,
    visible: Vec<usize>,
    pagination: PaginationState,
    selection: HashSet<OrderId>,
}

impl OrderList {
    pub fn new(page_size: usize) -> Self {
        Self {
            orders: Vec::new(),
            filter: OrderFilter::default(),
            visible: Vec::new(),
            pagination: PaginationState {
                page_size: page_size.max(1),
                current_page: 1,
                total_items: 0,
            },
            selection: HashSet::new(),
        }
    }

    // ========================================================================
    // Canonical collection
    // ========================================================================

    /// Replace the collection after a full refresh
    ///
    /// Orders missing from `orders` are dropped. Known orders only move
    /// forward: a stale copy cannot pull a terminal order back to OPEN.
    pub fn replace_all(&mut self, orders: Vec<Order>) -> ListChange {
        let mut seen = HashSet::new();
        let mut next = Vec::with_capacity(orders.len());

        for incoming in orders {
            if !seen.insert(incoming.id().clone()) {
                continue;
            }

            let merged = match self.get(incoming.id()) {
                Some(existing) => {
                    let mut merged = existing.clone();
                    match merged.apply_remote(&incoming) {
                        Ok(_) => merged,
                        Err(e) => {
                            tracing::debug!(order_id = %incoming.id(), "Ignoring stale order state: {}", e);
                            existing.clone()
                        }
                    }
                }
                None => incoming,
            };
            next.push(merged);
        }

        self.orders = next;
        self.sort();
        self.reconcile()
    }

    /// Insert or replace one order, e.g. a lifecycle result
    ///
    /// `replaces` names a previous id for the same order (the local token
    /// before the backend assigned its own id).
    pub fn upsert(&mut self, order: Order, replaces: Option<&OrderId>) -> ListChange {
        if let Some(old) = replaces.filter(|old| *old != order.id()) {
            self.orders.retain(|o| o.id() != old);
            if self.selection.remove(old) {
                self.selection.insert(order.id().clone());
            }
        }

        match self.orders.iter_mut().find(|o| o.id() == order.id()) {
            Some(existing) => *existing = order,
            None => self.orders.push(order),
        }

        self.sort();
        self.reconcile()
    }

    /// Fold a partial view (the open-orders series) into the collection
    ///
    /// Returns the orders that changed or were new.
    pub fn merge_updates(&mut self, updates: &[Order]) -> (Vec<Order>, ListChange) {
        let mut changed = Vec::new();

        for update in updates {
            match self.orders.iter_mut().find(|o| o.id() == update.id()) {
                Some(existing) => match existing.apply_remote(update) {
                    Ok(true) => changed.push(existing.clone()),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::debug!(order_id = %update.id(), "Ignoring stale order state: {}", e)
                    }
                },
                None => {
                    self.orders.push(update.clone());
                    changed.push(update.clone());
                }
            }
        }

        if changed.is_empty() {
            return (changed, ListChange::default());
        }

        self.sort();
        let change = self.reconcile();
        (changed, change)
    }

    fn sort(&mut self) {
        // Stable, so equal timestamps keep their relative order
        self.orders.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
    }

    /// Recompute the view, clamp the page and prune the selection
    ///
    /// Rows can shift across page boundaries when orders arrive or leave,
    /// so the selection is cut back to what the current page shows.
    fn reconcile(&mut self) -> ListChange {
        self.recompute_visible();

        let total_pages = self.pagination.total_pages();
        let page_collapsed = self.pagination.current_page > total_pages;
        if page_collapsed {
            self.pagination.current_page = total_pages;
        }

        let page: HashSet<OrderId> = self.page_ids().into_iter().collect();
        let mut pruned: Vec<OrderId> = self
            .selection
            .iter()
            .filter(|id| !page.contains(*id))
            .cloned()
            .collect();
        pruned.sort();

        for id in &pruned {
            self.selection.remove(id);
        }
        if !pruned.is_empty() {
            tracing::debug!(pruned = pruned.len(), "Dropped stale selection entries");
        }

        ListChange {
            pruned,
            page_collapsed,
        }
    }

    fn recompute_visible(&mut self) {
        self.visible = self
            .orders
            .iter()
            .enumerate()
            .filter(|(_, o)| self.filter.matches(o))
            .map(|(i, _)| i)
            .collect();
        self.pagination.total_items = self.visible.len();
    }

    pub fn get(&self, id: &OrderId) -> Option<&Order> {
        self.orders.iter().find(|o| o.id() == id)
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn stats(&self) -> OrderStats {
        let mut stats = OrderStats {
            total: self.orders.len(),
            ..OrderStats::default()
        };

        for order in &self.orders {
            match order.status() {
                OrderStatus::Filled => stats.filled += 1,
                OrderStatus::Open | OrderStatus::Partial => stats.pending += 1,
                OrderStatus::Cancelled => stats.cancelled += 1,
                OrderStatus::Failed => stats.failed += 1,
                _ => {}
            }
        }
        stats
    }

    // ========================================================================
    // Filtered view and pagination
    // ========================================================================

    /// Swap the filter criteria and go back to page 1
    pub fn apply_filter(&mut self, filter: OrderFilter) {
        self.filter = filter;
        self.recompute_visible();
        self.pagination.current_page = 1;
        self.scope_selection_to_page();
    }

    pub fn filter(&self) -> &OrderFilter {
        &self.filter
    }

    pub fn visible(&self) -> Vec<&Order> {
        self.visible.iter().map(|&i| &self.orders[i]).collect()
    }

    pub fn pagination(&self) -> PaginationState {
        self.pagination
    }

    /// Orders on the current page, newest first
    pub fn page(&self) -> Vec<&Order> {
        self.visible[self.pagination.page_range()]
            .iter()
            .map(|&i| &self.orders[i])
            .collect()
    }

    /// Jump to page `n`; out-of-range pages are ignored
    ///
    /// Returns whether the page changed.
    pub fn go_to_page(&mut self, n: usize) -> bool {
        if n < 1 || n > self.pagination.total_pages() || n == self.pagination.current_page {
            return false;
        }

        self.pagination.current_page = n;
        self.scope_selection_to_page();
        true
    }

    pub fn next_page(&mut self) -> bool {
        self.go_to_page(self.pagination.current_page + 1)
    }

    pub fn previous_page(&mut self) -> bool {
        self.go_to_page(self.pagination.current_page.saturating_sub(1))
    }

    // ========================================================================
    // Selection
    // ========================================================================

    fn page_ids(&self) -> Vec<OrderId> {
        self.page().into_iter().map(|o| o.id().clone()).collect()
    }

    fn scope_selection_to_page(&mut self) {
        let page: HashSet<OrderId> = self.page_ids().into_iter().collect();
        self.selection.retain(|id| page.contains(id));
    }

    /// Flip one row on the current page; returns its new state
    pub fn toggle_select(&mut self, id: &OrderId) -> Result<bool, DeskError> {
        if !self.page_ids().contains(id) {
            return Err(DeskError::UnknownOrder(id.clone()));
        }

        if self.selection.remove(id) {
            Ok(false)
        } else {
            self.selection.insert(id.clone());
            Ok(true)
        }
    }

    /// Header checkbox: selects the rest of the page unless the whole page
    /// is already selected, in which case it clears the page
    pub fn toggle_select_all(&mut self) -> SelectAllState {
        let page = self.page_ids();

        if self.select_all_state() == SelectAllState::Checked {
            for id in &page {
                self.selection.remove(id);
            }
        } else {
            self.selection.extend(page);
        }

        self.select_all_state()
    }

    pub fn select_all_state(&self) -> SelectAllState {
        let page = self.page_ids();
        let selected = page.iter().filter(|id| self.selection.contains(*id)).count();

        if selected == 0 {
            SelectAllState::Unchecked
        } else if selected == page.len() {
            SelectAllState::Checked
        } else {
            SelectAllState::Indeterminate
        }
    }

    pub fn is_selected(&self, id: &OrderId) -> bool {
        self.selection.contains(id)
    }

    /// Selected ids in canonical order
    pub fn selected_ids(&self) -> Vec<OrderId> {
        self.orders
            .iter()
            .filter(|o| self.selection.contains(o.id()))
            .map(|o| o.id().clone())
            .collect()
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }
}
