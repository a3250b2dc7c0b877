//! OCO order lifecycle: bracket placement, fill handling, reconciliation.
//!
//! # Locking
//!
//! The [`Registry`] sits behind one `parking_lot::Mutex` owned by the
//! manager. Every read-modify-write on it (track, detach, purge) happens in
//! a single critical section, and the guard is never held across an
//! exchange call or a sleep. Orders are detached from the registry *before*
//! their cancels go out, so two paths racing on the same symbol (a fill
//! event and a reconciliation pass) can never cancel or delete twice.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error::OcoError;
use super::registry::Registry;
use super::retry::{Backoff, Clock, RetryPolicy, TokioClock};
use super::types::{
    BracketRequest, BracketResult, CancelOutcome, CloseReason, Confirmation, FillOutcome,
    LegResult, OrderKind, ReconcileReport, Symbol, SymbolReconciliation, SymbolStatus,
    TrackedOrder, TrackedPosition,
};
use crate::exchange::{ExchangeClient, ExchangeError, PositionSide};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManagerConfig {
    /// Wall-clock bound on the position confirmation poll.
    pub confirm_timeout: Duration,
    /// Wait after each unsuccessful confirmation poll.
    pub confirm_backoff: Backoff,
    /// Attempts and waits for each protective leg.
    pub leg_policy: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(20),
            confirm_backoff: Backoff::capped(Duration::from_secs(1), Duration::from_secs(3)),
            leg_policy: RetryPolicy::new(3, Backoff::linear(Duration::from_secs(2))),
        }
    }
}

/// Marks a symbol as having a bracket in flight for as long as it lives.
struct PlacementGuard<'a> {
    registry: &'a Mutex<Registry>,
    symbol: Symbol,
}

impl Drop for PlacementGuard<'_> {
    fn drop(&mut self) {
        if self.registry.lock().end_placement(self.symbol.as_str()) {
            debug!(symbol = %self.symbol, "OCO resolved during placement, entry released");
        }
    }
}

pub struct OcoOrderManager<E: ExchangeClient + ?Sized> {
    exchange: Arc<E>,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
    registry: Mutex<Registry>,
}

impl<E: ExchangeClient + ?Sized> OcoOrderManager<E> {
    pub fn new(exchange: Arc<E>, config: ManagerConfig) -> Self {
        Self::with_clock(exchange, config, Arc::new(TokioClock::new()))
    }

    pub fn with_clock(exchange: Arc<E>, config: ManagerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            exchange,
            clock,
            config,
            registry: Mutex::new(Registry::new()),
        }
    }

    /// Place a main order and attach its take-profit / stop-loss legs.
    ///
    /// Only an invalid request, an untradable symbol, or a rejected main
    /// order fail the call, and in those cases nothing is tracked. Once the
    /// main order is out, confirmation trouble degrades the leg sizing and
    /// leg failures are reported per leg; the main order is never rolled back.
    pub async fn place_main_order_with_tpsl(&self, request: BracketRequest) -> BracketResult {
        if let Err(e) = request.validate() {
            warn!(symbol = %request.symbol, error = %e, "Bracket request rejected");
            return BracketResult::rejected(e);
        }
        let symbol = request.symbol.clone();

        if let Err(e) = self.exchange.get_market_data(symbol.as_str()).await {
            warn!(symbol = %symbol, error = %e, "Symbol validation failed, no orders placed");
            return BracketResult::rejected(OcoError::InvalidSymbol { symbol, source: e });
        }

        let entry = request.entry_order();
        let main = match self.exchange.place_order(&entry).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(symbol = %symbol, side = %request.direction, error = %e, "Main order failed");
                return BracketResult::rejected(OcoError::MainOrderRejected(e));
            }
        };
        info!(
            symbol = %symbol,
            order_id = %main.order_id,
            side = %request.direction,
            qty = request.quantity,
            order_type = entry.order_type.as_str(),
            "Main order placed"
        );

        let _placement = {
            let mut registry = self.registry.lock();
            registry.track_order(
                &symbol,
                TrackedOrder::new(main.order_id.clone(), OrderKind::Main, request.direction),
            );
            registry.begin_placement(&symbol);
            PlacementGuard {
                registry: &self.registry,
                symbol: symbol.clone(),
            }
        };

        let (position, confirmation) = self.confirm_position(&request).await;
        let quantity = position.size;
        let mut position_side = position.position_side;
        {
            self.registry.lock().set_position(position);
        }

        let take_profit_order = match request.take_profit {
            Some(price) => Some(
                self.place_protective_leg(&symbol, OrderKind::TakeProfit, quantity, price, &mut position_side)
                    .await,
            ),
            None => None,
        };

        let stop_loss_order = match request.stop_loss {
            Some(price) => Some(
                self.place_protective_leg(&symbol, OrderKind::StopLoss, quantity, price, &mut position_side)
                    .await,
            ),
            None => None,
        };

        BracketResult {
            main_order: Ok(main),
            take_profit_order,
            stop_loss_order,
            confirmation: Some(confirmation),
        }
    }

    /// Poll until the exchange shows the position, backing off between
    /// polls. After the timeout one last read is made; if that still shows
    /// nothing, a placeholder sized from the request is returned.
    async fn confirm_position(&self, request: &BracketRequest) -> (TrackedPosition, Confirmation) {
        let symbol = &request.symbol;
        let started = self.clock.now();
        let mut attempt: u32 = 0;

        while self.clock.now().saturating_sub(started) < self.config.confirm_timeout {
            match self.exchange.get_position(symbol.as_str()).await {
                Ok(snapshot) => {
                    if let Some(position) = TrackedPosition::established(symbol, &snapshot) {
                        info!(
                            symbol = %symbol,
                            size = position.size,
                            side = %position.position_side,
                            polls = attempt + 1,
                            "Position confirmed"
                        );
                        return (position, Confirmation::Confirmed);
                    }
                    debug!(symbol = %symbol, attempt, "Position not established yet");
                }
                Err(e) => debug!(symbol = %symbol, attempt, error = %e, "Position poll failed"),
            }

            self.clock.sleep(self.config.confirm_backoff.delay(attempt)).await;
            attempt += 1;
        }

        warn!(
            symbol = %symbol,
            timeout_secs = self.config.confirm_timeout.as_secs(),
            "Position not confirmed in time, running final check"
        );

        match self.exchange.get_position(symbol.as_str()).await {
            Ok(snapshot) if snapshot.is_open() => {
                let side = snapshot.hold_side.unwrap_or(request.direction);
                let mut position = TrackedPosition::placeholder(symbol, snapshot.size, side);
                position.refresh(&snapshot);
                warn!(symbol = %symbol, size = position.size, "Using late position data");
                return (position, Confirmation::LateConfirmed);
            }
            Ok(_) => {}
            Err(e) => warn!(symbol = %symbol, error = %e, "Final position check failed"),
        }

        warn!(
            symbol = %symbol,
            qty = request.quantity,
            "Position unconfirmed, sizing protective orders from requested quantity"
        );
        (
            TrackedPosition::placeholder(symbol, request.quantity, request.direction),
            Confirmation::Placeholder,
        )
    }

    async fn place_protective_leg(
        &self,
        symbol: &Symbol,
        kind: OrderKind,
        quantity: f64,
        price: f64,
        position_side: &mut PositionSide,
    ) -> LegResult {
        let policy = self.config.leg_policy;
        let mut last_error = None;

        for (attempt, delay) in policy.attempts() {
            if !delay.is_zero() {
                debug!(symbol = %symbol, kind = %kind, wait_secs = delay.as_secs(), "Waiting before retry");
                self.clock.sleep(delay).await;
            }

            if self.registry.lock().is_resolved(symbol.as_str()) {
                info!(symbol = %symbol, kind = %kind, "Counterpart already filled, leg not placed");
                return Err(OcoError::Superseded { kind, order_id: None });
            }

            let result = match kind {
                OrderKind::TakeProfit => {
                    self.exchange
                        .set_take_profit(symbol.as_str(), quantity, price, *position_side)
                        .await
                }
                OrderKind::StopLoss => {
                    self.exchange
                        .set_stop_loss(symbol.as_str(), quantity, price, *position_side)
                        .await
                }
                OrderKind::Main => {
                    return Err(OcoError::InvalidRequest(
                        "main order cannot be placed as a protective leg".to_string(),
                    ))
                }
            };

            match result {
                Ok(ack) => {
                    let order = TrackedOrder::new(ack.order_id.clone(), kind, *position_side);
                    let superseded = {
                        let mut registry = self.registry.lock();
                        let resolved = registry.is_resolved(symbol.as_str());
                        if !resolved {
                            registry.track_order(symbol, order.clone());
                        }
                        resolved
                    };
                    if superseded {
                        warn!(
                            symbol = %symbol,
                            kind = %kind,
                            order_id = %ack.order_id,
                            "Counterpart filled while leg was in flight, cancelling it"
                        );
                        self.cancel_orders(symbol.as_str(), &[order]).await;
                        return Err(OcoError::Superseded {
                            kind,
                            order_id: Some(ack.order_id),
                        });
                    }
                    info!(
                        symbol = %symbol,
                        kind = %kind,
                        order_id = %ack.order_id,
                        qty = quantity,
                        price,
                        attempt = attempt + 1,
                        "Protective order placed"
                    );
                    return Ok(ack);
                }
                Err(e) => {
                    warn!(
                        symbol = %symbol,
                        kind = %kind,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Protective order failed"
                    );
                    if e.is_position_not_found() && attempt + 1 < policy.max_attempts {
                        self.refresh_position_side(symbol, position_side).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let last_error = last_error
            .unwrap_or_else(|| ExchangeError::Transport("no placement attempt made".to_string()));
        error!(
            symbol = %symbol,
            kind = %kind,
            error = %last_error,
            "Protective order exhausted retries, manual intervention required"
        );
        Err(OcoError::LegExhausted {
            kind,
            attempts: policy.max_attempts,
            last_error,
        })
    }

    /// Re-read the position after a "position not found" rejection; the
    /// side may have been guessed wrong on a degraded confirmation.
    async fn refresh_position_side(&self, symbol: &Symbol, position_side: &mut PositionSide) {
        match self.exchange.get_position(symbol.as_str()).await {
            Ok(snapshot) => match snapshot.hold_side {
                Some(fresh) if snapshot.is_open() => {
                    if fresh != *position_side {
                        info!(symbol = %symbol, from = %position_side, to = %fresh, "Position side corrected");
                        *position_side = fresh;
                    }
                    self.registry.lock().refresh_position(symbol.as_str(), &snapshot);
                }
                _ => debug!(symbol = %symbol, "Refresh found no open position"),
            },
            Err(e) => debug!(symbol = %symbol, error = %e, "Position refresh failed"),
        }
    }

    /// React to a take-profit or stop-loss fill by cancelling its
    /// counterpart(s).
    ///
    /// The filled order and every counterpart are dropped from the registry
    /// whether or not the cancel succeeds. Once no protective order remains
    /// the position is considered closed and the symbol's entry (including
    /// its filled main order) is removed. Legs of a bracket still being
    /// placed for the symbol are withdrawn rather than placed.
    pub async fn handle_order_filled(&self, symbol: &str, order_id: &str, kind: OrderKind) -> FillOutcome {
        let Some(opposite) = kind.opposite() else {
            warn!(symbol, order_id, kind = %kind, "Ignoring fill: only take-profit/stop-loss fills trigger OCO");
            return FillOutcome::Rejected;
        };

        let (targets, symbol_cleared) = {
            let mut registry = self.registry.lock();
            if !registry.has_orders(symbol) {
                debug!(symbol, order_id, "Fill for untracked symbol");
                return FillOutcome::Untracked;
            }

            let targets = registry.detach(symbol, |o| o.kind == opposite);
            registry.detach(symbol, |o| o.order_id == order_id);
            // A leg still being placed must not outlive this fill.
            registry.mark_resolved(symbol);

            let cleared = if registry.has_protective(symbol) || registry.is_pending(symbol) {
                registry.prune_if_empty(symbol)
            } else {
                registry.purge(symbol);
                true
            };
            (targets, cleared)
        };

        let cancellations = self.cancel_orders(symbol, &targets).await;
        info!(
            symbol,
            order_id,
            filled = %kind,
            cancelled = cancellations.iter().filter(|c| c.succeeded()).count(),
            cancel_failures = cancellations.iter().filter(|c| !c.succeeded()).count(),
            symbol_cleared,
            "OCO resolved"
        );

        FillOutcome::Resolved {
            cancellations,
            symbol_cleared,
        }
    }

    /// Route a raw fill report. The tracked kind wins over what the event
    /// claims; entry fills are expected and only logged.
    pub async fn dispatch_fill(&self, symbol: &str, order_id: &str, reported_type: &str) -> FillOutcome {
        let tracked = { self.registry.lock().kind_of(symbol, order_id) };
        let kind = match tracked.or_else(|| reported_type.parse().ok()) {
            Some(kind) => kind,
            None => {
                debug!(symbol, order_id, reported_type, "Fill for unknown order");
                return FillOutcome::Untracked;
            }
        };

        if kind == OrderKind::Main {
            debug!(symbol, order_id, "Main order filled");
            return FillOutcome::Rejected;
        }
        self.handle_order_filled(symbol, order_id, kind).await
    }

    /// Reconcile every tracked symbol against the exchange.
    ///
    /// A symbol whose position is flat, or whose position query fails, is
    /// treated as closed: its orders are cancelled (best effort) and its
    /// entry removed. Symbols are independent; one failing never stops the
    /// pass. Symbols with a bracket in flight are left alone.
    pub async fn update_position_status(&self) -> ReconcileReport {
        let candidates: Vec<(Symbol, Option<u64>, bool)> = {
            let registry = self.registry.lock();
            registry
                .symbols()
                .into_iter()
                .map(|s| {
                    let epoch = registry.epoch(s.as_str());
                    let pending = registry.is_pending(s.as_str());
                    (s, epoch, pending)
                })
                .collect()
        };

        let mut report = ReconcileReport::default();
        for (symbol, epoch, pending) in candidates {
            let status = if pending {
                debug!(symbol = %symbol, "Bracket in flight, skipping reconciliation");
                SymbolStatus::Pending
            } else {
                self.reconcile_symbol(&symbol, epoch).await
            };
            report.symbols.push(SymbolReconciliation { symbol, status });
        }

        debug!(
            symbols = report.symbols.len(),
            closed = report.closed().count(),
            "Reconciliation pass complete"
        );
        report
    }

    async fn reconcile_symbol(&self, symbol: &Symbol, epoch: Option<u64>) -> SymbolStatus {
        let reason = match self.exchange.get_position(symbol.as_str()).await {
            Ok(snapshot) if snapshot.is_open() => {
                self.registry.lock().refresh_position(symbol.as_str(), &snapshot);
                return SymbolStatus::Open;
            }
            Ok(_) => CloseReason::Flat,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Position query failed, treating position as closed");
                CloseReason::QueryFailed(e)
            }
        };

        let purged = { self.registry.lock().purge_at_epoch(symbol.as_str(), epoch) };
        let Some(orders) = purged else {
            debug!(symbol = %symbol, "Entry changed during reconciliation, leaving it");
            return SymbolStatus::Skipped;
        };

        let cancellations = self.cancel_orders(symbol.as_str(), &orders).await;
        info!(
            symbol = %symbol,
            reason = ?reason,
            released = orders.len(),
            "Position closed, tracked orders released"
        );
        SymbolStatus::Closed {
            reason,
            cancellations,
        }
    }

    /// Cancel each order independently; a failure is recorded and the
    /// remaining cancels still go out.
    async fn cancel_orders(&self, symbol: &str, orders: &[TrackedOrder]) -> Vec<CancelOutcome> {
        let mut outcomes = Vec::with_capacity(orders.len());
        for order in orders {
            let result = self
                .exchange
                .cancel_order(symbol, &order.order_id, order.position_side)
                .await;
            match &result {
                Ok(()) => info!(symbol, order_id = %order.order_id, kind = %order.kind, "Order cancelled"),
                Err(e) => warn!(symbol, order_id = %order.order_id, kind = %order.kind, error = %e, "Cancel failed"),
            }
            outcomes.push(CancelOutcome {
                order_id: order.order_id.clone(),
                kind: order.kind,
                result,
            });
        }
        outcomes
    }

    pub fn tracked_orders(&self, symbol: &str) -> Vec<TrackedOrder> {
        self.registry.lock().orders(symbol).to_vec()
    }

    pub fn tracked_position(&self, symbol: &str) -> Option<TrackedPosition> {
        self.registry.lock().position(symbol).cloned()
    }

    pub fn tracked_symbols(&self) -> Vec<Symbol> {
        self.registry.lock().symbols()
    }

    pub fn order_kind(&self, symbol: &str, order_id: &str) -> Option<OrderKind> {
        self.registry.lock().kind_of(symbol, order_id)
    }
}
