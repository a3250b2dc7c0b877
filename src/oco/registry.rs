//! In-memory book of open orders and position snapshots per symbol.
//!
//! The registry itself is a plain data structure; [`super::OcoOrderManager`]
//! owns it behind one mutex and performs every read-modify-write span in a
//! single critical section.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::types::{OrderKind, Symbol, TrackedOrder, TrackedPosition};
use crate::exchange::PositionSnapshot;

#[derive(Debug, Default)]
pub struct Registry {
    orders_by_symbol: HashMap<Symbol, Vec<TrackedOrder>>,
    positions_by_symbol: HashMap<Symbol, TrackedPosition>,
    /// Bumped whenever an order is tracked; lets a slow reconciliation
    /// notice that the entry it polled has since changed.
    epochs: HashMap<Symbol, u64>,
    next_epoch: u64,
    /// Brackets currently being placed, per symbol.
    in_flight: HashMap<Symbol, usize>,
    /// Symbols whose OCO was resolved by a fill while a bracket was in flight.
    resolved: HashSet<Symbol>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an order. An order id already tracked for the symbol is replaced
    /// so ids stay unique within a symbol.
    pub fn track_order(&mut self, symbol: &Symbol, order: TrackedOrder) {
        let orders = self.orders_by_symbol.entry(symbol.clone()).or_default();
        match orders.iter_mut().find(|o| o.order_id == order.order_id) {
            Some(existing) => *existing = order,
            None => orders.push(order),
        }
        self.next_epoch += 1;
        self.epochs.insert(symbol.clone(), self.next_epoch);
    }

    pub fn set_position(&mut self, position: TrackedPosition) {
        self.positions_by_symbol
            .insert(position.symbol.clone(), position);
    }

    /// Update an existing snapshot. Returns false when none is tracked.
    pub fn refresh_position(&mut self, symbol: &str, snapshot: &PositionSnapshot) -> bool {
        match self.positions_by_symbol.get_mut(symbol) {
            Some(position) => {
                position.refresh(snapshot);
                true
            }
            None => false,
        }
    }

    pub fn orders(&self, symbol: &str) -> &[TrackedOrder] {
        self.orders_by_symbol
            .get(symbol)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn position(&self, symbol: &str) -> Option<&TrackedPosition> {
        self.positions_by_symbol.get(symbol)
    }

    pub fn has_orders(&self, symbol: &str) -> bool {
        !self.orders(symbol).is_empty()
    }

    pub fn has_protective(&self, symbol: &str) -> bool {
        self.orders(symbol).iter().any(|o| o.kind.is_protective())
    }

    pub fn kind_of(&self, symbol: &str, order_id: &str) -> Option<OrderKind> {
        self.orders(symbol)
            .iter()
            .find(|o| o.order_id == order_id)
            .map(|o| o.kind)
    }

    /// Remove and return every order of `symbol` matching `pred`, keeping
    /// the placement order of the rest.
    pub fn detach<F>(&mut self, symbol: &str, mut pred: F) -> Vec<TrackedOrder>
    where
        F: FnMut(&TrackedOrder) -> bool,
    {
        let Some(orders) = self.orders_by_symbol.get_mut(symbol) else {
            return Vec::new();
        };
        let mut detached = Vec::new();
        let mut kept = Vec::with_capacity(orders.len());
        for order in orders.drain(..) {
            if pred(&order) {
                detached.push(order);
            } else {
                kept.push(order);
            }
        }
        *orders = kept;
        detached
    }

    /// Drop the symbol entirely once it has no orders left. Returns true
    /// when the symbol is absent afterwards.
    pub fn prune_if_empty(&mut self, symbol: &str) -> bool {
        if self.has_orders(symbol) {
            return false;
        }
        self.purge(symbol);
        true
    }

    /// Remove orders, position and epoch for `symbol`, returning the orders
    /// that were still tracked. Purging an absent symbol is a no-op.
    pub fn purge(&mut self, symbol: &str) -> Vec<TrackedOrder> {
        self.positions_by_symbol.remove(symbol);
        self.epochs.remove(symbol);
        self.orders_by_symbol.remove(symbol).unwrap_or_default()
    }

    /// Purge only if nothing was tracked for `symbol` since `epoch` was read
    /// and no bracket is being placed. `None` means the entry was left alone.
    pub fn purge_at_epoch(&mut self, symbol: &str, epoch: Option<u64>) -> Option<Vec<TrackedOrder>> {
        if self.is_pending(symbol) || self.epoch(symbol) != epoch || !self.is_tracked(symbol) {
            return None;
        }
        Some(self.purge(symbol))
    }

    pub fn epoch(&self, symbol: &str) -> Option<u64> {
        self.epochs.get(symbol).copied()
    }

    pub fn begin_placement(&mut self, symbol: &Symbol) {
        *self.in_flight.entry(symbol.clone()).or_insert(0) += 1;
    }

    /// Returns true when the last placement finished on a resolved OCO
    /// and the symbol entry was dropped as a result.
    pub fn end_placement(&mut self, symbol: &str) -> bool {
        let Some(count) = self.in_flight.get_mut(symbol) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return false;
        }
        self.in_flight.remove(symbol);

        if self.resolved.remove(symbol) && !self.has_protective(symbol) {
            self.purge(symbol);
            return true;
        }
        false
    }

    /// Flag the in-flight placement as settled: remaining legs must not go out.
    /// No-op when nothing is being placed.
    pub fn mark_resolved(&mut self, symbol: &str) {
        if let Some((key, _)) = self.in_flight.get_key_value(symbol) {
            let key = key.clone();
            self.resolved.insert(key);
        }
    }

    pub fn is_resolved(&self, symbol: &str) -> bool {
        self.resolved.contains(symbol)
    }

    pub fn is_pending(&self, symbol: &str) -> bool {
        self.in_flight.contains_key(symbol)
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.orders_by_symbol.contains_key(symbol) || self.positions_by_symbol.contains_key(symbol)
    }

    /// Every symbol with orders or a position, sorted.
    pub fn symbols(&self) -> Vec<Symbol> {
        self.orders_by_symbol
            .keys()
            .chain(self.positions_by_symbol.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.orders_by_symbol.is_empty() && self.positions_by_symbol.is_empty()
    }
}
