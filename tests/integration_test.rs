use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use oco_tpsl_bot::exchange::{
    ExchangeClient, ExchangeError, MarketSnapshot, OrderAck, OrderRequest, OrderType,
    PositionSide, PositionSnapshot,
};
use oco_tpsl_bot::oco::{
    BracketRequest, Clock, CloseReason, Confirmation, FillOutcome, ManagerConfig, ManualClock,
    OcoError, OcoOrderManager, OrderKind, SymbolStatus,
};

type PositionReply = Result<PositionSnapshot, ExchangeError>;
type AckReply = Result<OrderAck, ExchangeError>;

/// Parks the caller until the test opens it, and tells the test when
/// someone is parked.
struct Gate {
    reached: Notify,
    release: Semaphore,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            reached: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    async fn pass(&self) {
        self.reached.notify_one();
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }

    async fn wait_reached(&self) {
        self.reached.notified().await;
    }

    fn open(&self) {
        self.release.add_permits(1);
    }
}

/// Virtual clock that parks on the first sleep of `gate_on`.
struct GatedClock {
    inner: ManualClock,
    gate_on: Duration,
    gate: Arc<Gate>,
    armed: AtomicBool,
}

impl GatedClock {
    fn new(gate_on: Duration, gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            inner: ManualClock::new(),
            gate_on,
            gate,
            armed: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl Clock for GatedClock {
    fn now(&self) -> Duration {
        self.inner.now()
    }

    async fn sleep(&self, duration: Duration) {
        if duration == self.gate_on && self.armed.swap(false, Ordering::SeqCst) {
            self.gate.pass().await;
        }
        self.inner.sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    MarketData(String),
    PlaceOrder(OrderRequest),
    GetPosition(String),
    TakeProfit { symbol: String, quantity: f64, price: f64, side: PositionSide },
    StopLoss { symbol: String, quantity: f64, price: f64, side: PositionSide },
    Cancel { symbol: String, order_id: String },
}

/// Scripted exchange. Position replies are consumed front to back with the
/// last one repeating; TP/SL replies are consumed and default to success.
#[derive(Default)]
struct MockExchange {
    unknown_symbols: Mutex<HashSet<String>>,
    main_error: Mutex<Option<ExchangeError>>,
    positions: Mutex<HashMap<String, VecDeque<PositionReply>>>,
    take_profit_replies: Mutex<VecDeque<AckReply>>,
    stop_loss_replies: Mutex<VecDeque<AckReply>>,
    failing_cancels: Mutex<HashSet<String>>,
    /// Parks the next `get_position` / `set_stop_loss` call, once.
    position_gate: Mutex<Option<Arc<Gate>>>,
    stop_loss_gate: Mutex<Option<Arc<Gate>>>,
    calls: Mutex<Vec<Call>>,
    main_seq: AtomicU64,
    leg_seq: AtomicU64,
}

impl MockExchange {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script_positions(&self, symbol: &str, replies: Vec<PositionReply>) {
        self.positions
            .lock()
            .insert(symbol.to_string(), replies.into_iter().collect());
    }

    fn script_take_profit(&self, replies: Vec<AckReply>) {
        *self.take_profit_replies.lock() = replies.into_iter().collect();
    }

    fn script_stop_loss(&self, replies: Vec<AckReply>) {
        *self.stop_loss_replies.lock() = replies.into_iter().collect();
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn cancelled_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Cancel { order_id, .. } => Some(order_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn get_market_data(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        self.record(Call::MarketData(symbol.to_string()));
        if self.unknown_symbols.lock().contains(symbol) {
            return Err(ExchangeError::UnknownSymbol(symbol.to_string()));
        }
        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            last_price: 65000.0,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        self.record(Call::PlaceOrder(request.clone()));
        if let Some(e) = self.main_error.lock().clone() {
            return Err(e);
        }
        let n = self.main_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(OrderAck::new(format!("m{}", n)))
    }

    async fn get_position(&self, symbol: &str) -> Result<PositionSnapshot, ExchangeError> {
        self.record(Call::GetPosition(symbol.to_string()));
        let gate = self.position_gate.lock().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let mut positions = self.positions.lock();
        match positions.get_mut(symbol) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| Ok(flat())),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| Ok(flat())),
            None => Ok(flat()),
        }
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        quantity: f64,
        price: f64,
        position_side: PositionSide,
    ) -> Result<OrderAck, ExchangeError> {
        self.record(Call::TakeProfit {
            symbol: symbol.to_string(),
            quantity,
            price,
            side: position_side,
        });
        let n = self.leg_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.take_profit_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(OrderAck::new(format!("tp-{}", n))))
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        quantity: f64,
        stop_price: f64,
        position_side: PositionSide,
    ) -> Result<OrderAck, ExchangeError> {
        self.record(Call::StopLoss {
            symbol: symbol.to_string(),
            quantity,
            price: stop_price,
            side: position_side,
        });
        let gate = self.stop_loss_gate.lock().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let n = self.leg_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.stop_loss_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(OrderAck::new(format!("sl-{}", n))))
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        _position_side: PositionSide,
    ) -> Result<(), ExchangeError> {
        self.record(Call::Cancel {
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
        });
        if self.failing_cancels.lock().contains(order_id) {
            return Err(ExchangeError::Api {
                code: 110001,
                message: "order not exists or too late to cancel".to_string(),
            });
        }
        Ok(())
    }
}

fn flat() -> PositionSnapshot {
    PositionSnapshot::flat()
}

fn open(size: f64, side: PositionSide) -> PositionSnapshot {
    PositionSnapshot {
        size,
        hold_side: Some(side),
        entry_price: 65000.0,
        unrealized_pnl: 0.0,
        margin: 650.0,
    }
}

fn no_position() -> ExchangeError {
    ExchangeError::PositionNotFound("No active position found".to_string())
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn manager(exchange: &Arc<MockExchange>) -> (OcoOrderManager<MockExchange>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let manager = OcoOrderManager::with_clock(exchange.clone(), ManagerConfig::default(), clock.clone());
    (manager, clock)
}

fn btc_bracket() -> BracketRequest {
    BracketRequest::market("BTCUSDT", PositionSide::Long, 1.0)
        .with_take_profit(70000.0)
        .with_stop_loss(60000.0)
}

#[tokio::test]
async fn test_bracket_then_take_profit_fill_resolves_oco() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(flat()), Ok(open(1.0, PositionSide::Long))]);
    exchange.script_take_profit(vec![Ok(OrderAck::new("tp1"))]);
    exchange.script_stop_loss(vec![
        Err(no_position()),
        Err(no_position()),
        Ok(OrderAck::new("sl1")),
    ]);
    let (manager, clock) = manager(&exchange);

    let result = manager.place_main_order_with_tpsl(btc_bracket()).await;

    assert_eq!(result.main_order, Ok(OrderAck::new("m1")));
    assert_eq!(result.take_profit_order, Some(Ok(OrderAck::new("tp1"))));
    assert_eq!(result.stop_loss_order, Some(Ok(OrderAck::new("sl1"))));
    assert_eq!(result.confirmation, Some(Confirmation::Confirmed));
    assert!(result.fully_protected());

    let kinds: Vec<_> = manager.tracked_orders("BTCUSDT").iter().map(|o| o.kind).collect();
    assert_eq!(kinds, vec![OrderKind::Main, OrderKind::TakeProfit, OrderKind::StopLoss]);

    // One confirmation backoff, then the stop-loss retry waits.
    assert_eq!(clock.sleeps(), vec![secs(1), secs(2), secs(4)]);
    // Two confirmation polls plus one side refresh per retried rejection.
    assert_eq!(exchange.count(|c| matches!(c, Call::GetPosition(_))), 4);

    let outcome = manager
        .handle_order_filled("BTCUSDT", "tp1", OrderKind::TakeProfit)
        .await;

    match outcome {
        FillOutcome::Resolved { cancellations, symbol_cleared } => {
            assert_eq!(cancellations.len(), 1);
            assert_eq!(cancellations[0].order_id, "sl1");
            assert!(cancellations[0].succeeded());
            assert!(symbol_cleared);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(exchange.cancelled_ids(), vec!["sl1".to_string()]);
    assert!(manager.tracked_orders("BTCUSDT").is_empty());
    assert!(manager.tracked_position("BTCUSDT").is_none());
    assert!(manager.tracked_symbols().is_empty());
}

#[tokio::test]
async fn test_stop_loss_fill_cancels_take_profit() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    exchange.script_take_profit(vec![Ok(OrderAck::new("tp1"))]);
    exchange.script_stop_loss(vec![Ok(OrderAck::new("sl1"))]);
    let (manager, _clock) = manager(&exchange);

    manager.place_main_order_with_tpsl(btc_bracket()).await;
    let outcome = manager.handle_order_filled("BTCUSDT", "sl1", OrderKind::StopLoss).await;

    assert!(matches!(outcome, FillOutcome::Resolved { symbol_cleared: true, .. }));
    assert_eq!(exchange.cancelled_ids(), vec!["tp1".to_string()]);
    assert!(!manager
        .tracked_orders("BTCUSDT")
        .iter()
        .any(|o| o.kind == OrderKind::TakeProfit));
    assert!(manager.tracked_position("BTCUSDT").is_none());
}

#[tokio::test]
async fn test_failed_cancel_still_releases_counterpart() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    exchange.script_take_profit(vec![Ok(OrderAck::new("tp1"))]);
    exchange.script_stop_loss(vec![Ok(OrderAck::new("sl1"))]);
    exchange.failing_cancels.lock().insert("sl1".to_string());
    let (manager, _clock) = manager(&exchange);

    manager.place_main_order_with_tpsl(btc_bracket()).await;
    let outcome = manager.handle_order_filled("BTCUSDT", "tp1", OrderKind::TakeProfit).await;

    let FillOutcome::Resolved { cancellations, symbol_cleared } = outcome else {
        panic!("expected resolution");
    };
    assert_eq!(cancellations.len(), 1);
    assert!(!cancellations[0].succeeded());
    assert!(symbol_cleared);
    assert!(manager.tracked_symbols().is_empty());
}

#[tokio::test]
async fn test_fill_with_invalid_kind_or_untracked_symbol() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    let (manager, _clock) = manager(&exchange);

    manager.place_main_order_with_tpsl(btc_bracket()).await;
    let before = manager.tracked_orders("BTCUSDT");

    let outcome = manager.handle_order_filled("BTCUSDT", "m1", OrderKind::Main).await;
    assert_eq!(outcome, FillOutcome::Rejected);
    assert_eq!(manager.tracked_orders("BTCUSDT"), before);

    let outcome = manager.handle_order_filled("ETHUSDT", "x", OrderKind::StopLoss).await;
    assert_eq!(outcome, FillOutcome::Untracked);
    assert!(exchange.cancelled_ids().is_empty());
}

#[tokio::test]
async fn test_dispatch_fill_prefers_tracked_kind() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    exchange.script_take_profit(vec![Ok(OrderAck::new("tp1"))]);
    exchange.script_stop_loss(vec![Ok(OrderAck::new("sl1"))]);
    let (manager, _clock) = manager(&exchange);

    manager.place_main_order_with_tpsl(btc_bracket()).await;

    assert_eq!(manager.dispatch_fill("BTCUSDT", "m1", "").await, FillOutcome::Rejected);
    assert_eq!(manager.dispatch_fill("BTCUSDT", "zzz", "Stop").await, FillOutcome::Untracked);

    // Conditional orders report "Stop"; the registry knows it is the stop-loss.
    let outcome = manager.dispatch_fill("BTCUSDT", "sl1", "Stop").await;
    assert!(matches!(outcome, FillOutcome::Resolved { symbol_cleared: true, .. }));
    assert_eq!(exchange.cancelled_ids(), vec!["tp1".to_string()]);
}

#[tokio::test]
async fn test_unconfirmed_position_falls_back_to_requested_quantity() {
    let exchange = MockExchange::new();
    exchange.script_positions("ETHUSDT", vec![Ok(flat())]);
    let (manager, clock) = manager(&exchange);

    let request = BracketRequest::market("ETHUSDT", PositionSide::Short, 0.75)
        .with_take_profit(2800.0)
        .with_stop_loss(3300.0);
    let result = manager.place_main_order_with_tpsl(request).await;

    assert_eq!(result.confirmation, Some(Confirmation::Placeholder));
    assert!(result.fully_protected());

    let legs: Vec<_> = exchange
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::TakeProfit { quantity, side, .. } | Call::StopLoss { quantity, side, .. } => {
                Some((quantity, side))
            }
            _ => None,
        })
        .collect();
    assert_eq!(legs, vec![(0.75, PositionSide::Short), (0.75, PositionSide::Short)]);

    // 1+2+3+3+3+3+3+3 = 21s crosses the 20s window after eight polls.
    assert_eq!(
        clock.sleeps(),
        vec![secs(1), secs(2), secs(3), secs(3), secs(3), secs(3), secs(3), secs(3)]
    );
    assert_eq!(exchange.count(|c| matches!(c, Call::GetPosition(_))), 9);

    let position = manager.tracked_position("ETHUSDT").unwrap();
    assert_eq!(position.size, 0.75);
    assert_eq!(position.position_side, PositionSide::Short);
}

#[tokio::test]
async fn test_final_check_uses_late_position_data() {
    let exchange = MockExchange::new();
    let mut replies: Vec<PositionReply> = (0..8).map(|_| Ok(flat())).collect();
    replies.push(Ok(open(0.4, PositionSide::Long)));
    exchange.script_positions("BTCUSDT", replies);
    let (manager, _clock) = manager(&exchange);

    let result = manager.place_main_order_with_tpsl(btc_bracket()).await;

    assert_eq!(result.confirmation, Some(Confirmation::LateConfirmed));
    let quantities: Vec<_> = exchange
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::TakeProfit { quantity, .. } | Call::StopLoss { quantity, .. } => Some(quantity),
            _ => None,
        })
        .collect();
    assert_eq!(quantities, vec![0.4, 0.4]);
}

#[tokio::test]
async fn test_take_profit_failure_does_not_affect_other_legs() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    let rejected = || -> AckReply {
        Err(ExchangeError::Api {
            code: 10001,
            message: "TriggerPrice for Buy should be higher".to_string(),
        })
    };
    exchange.script_take_profit(vec![rejected(), rejected(), rejected()]);
    exchange.script_stop_loss(vec![Ok(OrderAck::new("sl1"))]);
    let (manager, _clock) = manager(&exchange);

    let result = manager.place_main_order_with_tpsl(btc_bracket()).await;

    assert_eq!(result.main_order, Ok(OrderAck::new("m1")));
    assert_eq!(result.stop_loss_order, Some(Ok(OrderAck::new("sl1"))));
    match result.take_profit_order {
        Some(Err(OcoError::LegExhausted { kind, attempts, .. })) => {
            assert_eq!(kind, OrderKind::TakeProfit);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected take-profit result: {:?}", other),
    }
    assert!(!result.fully_protected());
    assert_eq!(exchange.count(|c| matches!(c, Call::TakeProfit { .. })), 3);

    let kinds: Vec<_> = manager.tracked_orders("BTCUSDT").iter().map(|o| o.kind).collect();
    assert_eq!(kinds, vec![OrderKind::Main, OrderKind::StopLoss]);
}

#[tokio::test]
async fn test_leg_retry_waits_are_zero_two_four() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    exchange.script_take_profit(vec![
        Err(ExchangeError::Transport("timeout".into())),
        Err(ExchangeError::Transport("timeout".into())),
        Err(ExchangeError::Transport("timeout".into())),
    ]);
    let (manager, clock) = manager(&exchange);

    let request = BracketRequest::market("BTCUSDT", PositionSide::Long, 1.0).with_take_profit(70000.0);
    let result = manager.place_main_order_with_tpsl(request).await;

    assert!(matches!(result.take_profit_order, Some(Err(_))));
    assert_eq!(result.stop_loss_order, None);
    // Confirmed on the first poll, so every recorded sleep is a retry wait.
    assert_eq!(clock.sleeps(), vec![secs(2), secs(4)]);
}

#[tokio::test]
async fn test_unknown_symbol_places_nothing() {
    let exchange = MockExchange::new();
    exchange.unknown_symbols.lock().insert("FOOUSDT".to_string());
    let (manager, _clock) = manager(&exchange);

    let request = BracketRequest::market("FOOUSDT", PositionSide::Long, 1.0).with_take_profit(2.0);
    let result = manager.place_main_order_with_tpsl(request).await;

    assert!(matches!(result.main_order, Err(OcoError::InvalidSymbol { .. })));
    assert_eq!(result.take_profit_order, None);
    assert_eq!(result.confirmation, None);
    assert_eq!(exchange.count(|c| matches!(c, Call::PlaceOrder(_))), 0);
    assert!(manager.tracked_symbols().is_empty());
}

#[tokio::test]
async fn test_main_order_failure_skips_protective_legs() {
    let exchange = MockExchange::new();
    *exchange.main_error.lock() = Some(ExchangeError::Api {
        code: 110007,
        message: "ab not enough for new order".to_string(),
    });
    let (manager, _clock) = manager(&exchange);

    let result = manager.place_main_order_with_tpsl(btc_bracket()).await;

    assert!(matches!(result.main_order, Err(OcoError::MainOrderRejected(_))));
    assert_eq!(
        exchange.count(|c| matches!(c, Call::TakeProfit { .. } | Call::StopLoss { .. } | Call::GetPosition(_))),
        0
    );
    assert!(manager.tracked_symbols().is_empty());
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_exchange() {
    let exchange = MockExchange::new();
    let (manager, _clock) = manager(&exchange);

    let result = manager
        .place_main_order_with_tpsl(BracketRequest::market("BTCUSDT", PositionSide::Long, 0.0))
        .await;

    assert!(matches!(result.main_order, Err(OcoError::InvalidRequest(_))));
    assert!(exchange.calls().is_empty());
}

#[tokio::test]
async fn test_limit_entry_uses_lowercase_position_side() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Short))]);
    let (manager, _clock) = manager(&exchange);

    let request: BracketRequest = serde_json::from_str(
        r#"{"symbol":"BTCUSDT","direction":"SHORT","quantity":1.0,"entry_price":66000}"#,
    )
    .unwrap();
    manager.place_main_order_with_tpsl(request).await;

    let placed = exchange
        .calls()
        .into_iter()
        .find_map(|c| match c {
            Call::PlaceOrder(r) => Some(r),
            _ => None,
        })
        .unwrap();
    assert_eq!(placed.order_type, OrderType::Limit);
    assert_eq!(placed.price, Some(66000.0));
    assert_eq!(placed.position_side.as_str(), "short");
}

#[tokio::test]
async fn test_position_not_found_refreshes_side() {
    let exchange = MockExchange::new();
    // Never confirmed (8 polls + final check), then the refresh sees a short.
    let mut replies: Vec<PositionReply> = (0..9).map(|_| Ok(flat())).collect();
    replies.push(Ok(open(1.0, PositionSide::Short)));
    exchange.script_positions("BTCUSDT", replies);
    exchange.script_take_profit(vec![Err(no_position()), Ok(OrderAck::new("tp1"))]);
    let (manager, _clock) = manager(&exchange);

    let request = BracketRequest::market("BTCUSDT", PositionSide::Long, 1.0).with_take_profit(60000.0);
    let result = manager.place_main_order_with_tpsl(request).await;

    assert_eq!(result.take_profit_order, Some(Ok(OrderAck::new("tp1"))));
    let sides: Vec<_> = exchange
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::TakeProfit { side, .. } => Some(side),
            _ => None,
        })
        .collect();
    assert_eq!(sides, vec![PositionSide::Long, PositionSide::Short]);

    let tp = manager
        .tracked_orders("BTCUSDT")
        .into_iter()
        .find(|o| o.kind == OrderKind::TakeProfit)
        .unwrap();
    assert_eq!(tp.position_side, PositionSide::Short);
}

#[tokio::test]
async fn test_reconciliation_cleans_up_flat_position() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    exchange.script_take_profit(vec![Ok(OrderAck::new("tp1"))]);
    exchange.script_stop_loss(vec![Ok(OrderAck::new("sl1"))]);
    let (manager, _clock) = manager(&exchange);

    manager.place_main_order_with_tpsl(btc_bracket()).await;
    exchange.script_positions("BTCUSDT", vec![Ok(flat())]);

    let report = manager.update_position_status().await;

    match report.status_of("BTCUSDT") {
        Some(SymbolStatus::Closed { reason, cancellations }) => {
            assert_eq!(*reason, CloseReason::Flat);
            assert_eq!(cancellations.len(), 3);
        }
        other => panic!("unexpected status: {:?}", other),
    }
    assert_eq!(exchange.cancelled_ids(), vec!["m1", "tp1", "sl1"]);
    assert!(manager.tracked_orders("BTCUSDT").is_empty());
    assert!(manager.tracked_position("BTCUSDT").is_none());
}

#[tokio::test]
async fn test_reconciliation_refreshes_open_position() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    let (manager, _clock) = manager(&exchange);

    manager.place_main_order_with_tpsl(btc_bracket()).await;
    let mut moved = open(1.0, PositionSide::Long);
    moved.unrealized_pnl = 125.0;
    exchange.script_positions("BTCUSDT", vec![Ok(moved)]);

    let report = manager.update_position_status().await;

    assert_eq!(report.status_of("BTCUSDT"), Some(&SymbolStatus::Open));
    assert_eq!(manager.tracked_position("BTCUSDT").unwrap().unrealized_pnl, 125.0);
    assert_eq!(manager.tracked_orders("BTCUSDT").len(), 3);
    assert!(exchange.cancelled_ids().is_empty());
}

#[tokio::test]
async fn test_reconciliation_isolates_failing_symbol() {
    let exchange = MockExchange::new();
    for symbol in ["AAAUSDT", "BBBUSDT", "CCCUSDT", "DDDUSDT"] {
        exchange.script_positions(symbol, vec![Ok(open(2.0, PositionSide::Long))]);
    }
    let (manager, _clock) = manager(&exchange);

    for symbol in ["AAAUSDT", "BBBUSDT", "CCCUSDT", "DDDUSDT"] {
        let request = BracketRequest::market(symbol, PositionSide::Long, 2.0).with_stop_loss(1.0);
        assert!(manager.place_main_order_with_tpsl(request).await.fully_protected());
    }

    exchange.script_positions("AAAUSDT", vec![Ok(flat())]);
    exchange.script_positions("BBBUSDT", vec![Err(ExchangeError::Transport("connection reset".into()))]);
    exchange.script_positions("CCCUSDT", vec![Ok(flat())]);

    let report = manager.update_position_status().await;

    assert!(matches!(
        report.status_of("AAAUSDT"),
        Some(SymbolStatus::Closed { reason: CloseReason::Flat, .. })
    ));
    assert!(matches!(
        report.status_of("BBBUSDT"),
        Some(SymbolStatus::Closed { reason: CloseReason::QueryFailed(_), .. })
    ));
    assert!(matches!(
        report.status_of("CCCUSDT"),
        Some(SymbolStatus::Closed { reason: CloseReason::Flat, .. })
    ));
    assert_eq!(report.status_of("DDDUSDT"), Some(&SymbolStatus::Open));
    assert_eq!(report.closed().count(), 3);

    let remaining: Vec<_> = manager.tracked_symbols().into_iter().map(|s| s.to_string()).collect();
    assert_eq!(remaining, vec!["DDDUSDT"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fill_and_reconciliation_cancel_once() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    exchange.script_take_profit(vec![Ok(OrderAck::new("tp1"))]);
    exchange.script_stop_loss(vec![Ok(OrderAck::new("sl1"))]);
    let clock = Arc::new(ManualClock::new());
    let manager = Arc::new(OcoOrderManager::with_clock(
        exchange.clone(),
        ManagerConfig::default(),
        clock,
    ));

    manager.place_main_order_with_tpsl(btc_bracket()).await;
    exchange.script_positions("BTCUSDT", vec![Ok(flat())]);

    let fill = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .handle_order_filled("BTCUSDT", "tp1", OrderKind::TakeProfit)
                .await
        })
    };
    let reconcile = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.update_position_status().await })
    };
    let (fill, reconcile) = (fill.await.unwrap(), reconcile.await.unwrap());

    let cancelled = exchange.cancelled_ids();
    let unique: HashSet<_> = cancelled.iter().collect();
    assert_eq!(unique.len(), cancelled.len(), "order cancelled twice: {:?}", cancelled);
    assert!(manager.tracked_symbols().is_empty());
    assert!(matches!(fill, FillOutcome::Resolved { .. } | FillOutcome::Untracked));
    assert!(reconcile.symbols.len() <= 1);
}

fn shared_manager(
    exchange: &Arc<MockExchange>,
    clock: Arc<dyn Clock>,
) -> Arc<OcoOrderManager<MockExchange>> {
    Arc::new(OcoOrderManager::with_clock(
        exchange.clone(),
        ManagerConfig::default(),
        clock,
    ))
}

#[tokio::test]
async fn test_fill_during_leg_retry_withdraws_pending_leg() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    exchange.script_take_profit(vec![Ok(OrderAck::new("tp1"))]);
    exchange.script_stop_loss(vec![Err(no_position()), Ok(OrderAck::new("sl1"))]);
    let gate = Gate::new();
    // The stop-loss parks in its 2s retry wait.
    let manager = shared_manager(&exchange, GatedClock::new(secs(2), gate.clone()));

    let placing = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.place_main_order_with_tpsl(btc_bracket()).await })
    };
    gate.wait_reached().await;

    let outcome = manager
        .handle_order_filled("BTCUSDT", "tp1", OrderKind::TakeProfit)
        .await;
    assert_eq!(
        outcome,
        FillOutcome::Resolved {
            cancellations: vec![],
            symbol_cleared: false,
        }
    );

    gate.open();
    let result = placing.await.unwrap();

    assert_eq!(result.take_profit_order, Some(Ok(OrderAck::new("tp1"))));
    assert_eq!(
        result.stop_loss_order,
        Some(Err(OcoError::Superseded {
            kind: OrderKind::StopLoss,
            order_id: None,
        }))
    );
    assert_eq!(exchange.count(|c| matches!(c, Call::StopLoss { .. })), 1);
    assert!(exchange.cancelled_ids().is_empty());
    assert!(manager.tracked_symbols().is_empty());
}

#[tokio::test]
async fn test_fill_during_leg_request_cancels_acknowledged_leg() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    exchange.script_take_profit(vec![Ok(OrderAck::new("tp1"))]);
    exchange.script_stop_loss(vec![Ok(OrderAck::new("sl1"))]);
    let gate = Gate::new();
    *exchange.stop_loss_gate.lock() = Some(gate.clone());
    let manager = shared_manager(&exchange, Arc::new(ManualClock::new()));

    let placing = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.place_main_order_with_tpsl(btc_bracket()).await })
    };
    gate.wait_reached().await;

    manager
        .handle_order_filled("BTCUSDT", "tp1", OrderKind::TakeProfit)
        .await;
    gate.open();
    let result = placing.await.unwrap();

    assert_eq!(
        result.stop_loss_order,
        Some(Err(OcoError::Superseded {
            kind: OrderKind::StopLoss,
            order_id: Some("sl1".to_string()),
        }))
    );
    assert_eq!(exchange.cancelled_ids(), vec!["sl1"]);
    assert!(manager.tracked_symbols().is_empty());
}

#[tokio::test]
async fn test_reconciliation_skips_bracket_in_flight() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(flat())]);
    let gate = Gate::new();
    // Parks on the first confirmation backoff, right after the main order.
    let manager = shared_manager(&exchange, GatedClock::new(secs(1), gate.clone()));

    let placing = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.place_main_order_with_tpsl(btc_bracket()).await })
    };
    gate.wait_reached().await;

    let report = manager.update_position_status().await;

    assert_eq!(report.status_of("BTCUSDT"), Some(&SymbolStatus::Pending));
    assert!(exchange.cancelled_ids().is_empty());
    assert_eq!(exchange.count(|c| matches!(c, Call::GetPosition(_))), 1);
    assert_eq!(manager.order_kind("BTCUSDT", "m1"), Some(OrderKind::Main));

    gate.open();
    let result = placing.await.unwrap();
    assert_eq!(result.confirmation, Some(Confirmation::Placeholder));
    assert!(result.fully_protected());

    // Placement finished: the flat position is now cleaned up.
    let report = manager.update_position_status().await;
    assert!(matches!(
        report.status_of("BTCUSDT"),
        Some(SymbolStatus::Closed { reason: CloseReason::Flat, .. })
    ));
}

#[tokio::test]
async fn test_reconciliation_leaves_entry_changed_during_poll() {
    let exchange = MockExchange::new();
    exchange.script_positions("BTCUSDT", vec![Ok(open(1.0, PositionSide::Long))]);
    exchange.script_take_profit(vec![Ok(OrderAck::new("tp1"))]);
    exchange.script_stop_loss(vec![Ok(OrderAck::new("sl1"))]);
    let manager = shared_manager(&exchange, Arc::new(ManualClock::new()));
    manager.place_main_order_with_tpsl(btc_bracket()).await;

    exchange.script_positions("BTCUSDT", vec![Ok(flat())]);
    let gate = Gate::new();
    *exchange.position_gate.lock() = Some(gate.clone());

    let reconciling = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.update_position_status().await })
    };
    gate.wait_reached().await;

    // A new bracket lands between the position poll and the purge.
    let second = manager.place_main_order_with_tpsl(btc_bracket()).await;
    assert_eq!(second.main_order, Ok(OrderAck::new("m2")));

    gate.open();
    let report = reconciling.await.unwrap();

    assert_eq!(report.status_of("BTCUSDT"), Some(&SymbolStatus::Skipped));
    assert!(exchange.cancelled_ids().is_empty());
    assert_eq!(manager.order_kind("BTCUSDT", "m2"), Some(OrderKind::Main));
    assert_eq!(manager.order_kind("BTCUSDT", "sl1"), Some(OrderKind::StopLoss));
    assert_eq!(manager.tracked_orders("BTCUSDT").len(), 6);
}
