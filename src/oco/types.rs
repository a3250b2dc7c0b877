use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::error::OcoError;
use crate::exchange::{
    ExchangeError, OrderAck, OrderRequest, OrderType, PositionSide, PositionSnapshot,
};

/// Trading pair identifier, e.g. `BTCUSDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Main,
    TakeProfit,
    StopLoss,
}

impl OrderKind {
    /// The counterpart cancelled when this kind fills. `None` for the main order.
    pub fn opposite(&self) -> Option<OrderKind> {
        match self {
            OrderKind::TakeProfit => Some(OrderKind::StopLoss),
            OrderKind::StopLoss => Some(OrderKind::TakeProfit),
            OrderKind::Main => None,
        }
    }

    pub fn is_protective(&self) -> bool {
        !matches!(self, OrderKind::Main)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Main => "main",
            OrderKind::TakeProfit => "take_profit",
            OrderKind::StopLoss => "stop_loss",
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown order kind: {0:?}")]
pub struct ParseOrderKindError(pub String);

impl FromStr for OrderKind {
    type Err = ParseOrderKindError;

    /// Accepts our own names plus Bybit `stopOrderType` values.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "main" | "entry" => Ok(OrderKind::Main),
            "takeprofit" | "tp" | "partialtakeprofit" => Ok(OrderKind::TakeProfit),
            "stoploss" | "sl" | "partialstoploss" | "trailingstop" => Ok(OrderKind::StopLoss),
            _ => Err(ParseOrderKindError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedOrder {
    pub order_id: String,
    pub kind: OrderKind,
    pub position_side: PositionSide,
    pub placed_at: DateTime<Utc>,
}

impl TrackedOrder {
    pub fn new(order_id: impl Into<String>, kind: OrderKind, position_side: PositionSide) -> Self {
        Self {
            order_id: order_id.into(),
            kind,
            position_side,
            placed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPosition {
    pub symbol: Symbol,
    pub size: f64,
    pub position_side: PositionSide,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub margin: f64,
}

impl TrackedPosition {
    /// A snapshot counts as established once it has size and a known side.
    pub fn established(symbol: &Symbol, snapshot: &PositionSnapshot) -> Option<Self> {
        if !snapshot.is_open() {
            return None;
        }
        let position_side = snapshot.hold_side?;
        Some(Self {
            symbol: symbol.clone(),
            size: snapshot.size,
            position_side,
            entry_price: snapshot.entry_price,
            unrealized_pnl: snapshot.unrealized_pnl,
            margin: snapshot.margin,
        })
    }

    /// Stand-in used when the exchange never confirmed the fill.
    pub fn placeholder(symbol: &Symbol, quantity: f64, position_side: PositionSide) -> Self {
        Self {
            symbol: symbol.clone(),
            size: quantity,
            position_side,
            entry_price: 0.0,
            unrealized_pnl: 0.0,
            margin: 0.0,
        }
    }

    /// Refresh the informational fields from a newer poll.
    pub fn refresh(&mut self, snapshot: &PositionSnapshot) {
        self.size = snapshot.size;
        if let Some(side) = snapshot.hold_side {
            self.position_side = side;
        }
        self.entry_price = snapshot.entry_price;
        self.unrealized_pnl = snapshot.unrealized_pnl;
        self.margin = snapshot.margin;
    }
}

/// Main order plus optional protective legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketRequest {
    pub symbol: Symbol,
    pub direction: PositionSide,
    pub quantity: f64,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
}

impl BracketRequest {
    pub fn market(symbol: impl Into<Symbol>, direction: PositionSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            quantity,
            entry_price: None,
            take_profit: None,
            stop_loss: None,
        }
    }

    pub fn with_entry_price(mut self, price: f64) -> Self {
        self.entry_price = Some(price);
        self
    }

    pub fn with_take_profit(mut self, price: f64) -> Self {
        self.take_profit = Some(price);
        self
    }

    pub fn with_stop_loss(mut self, price: f64) -> Self {
        self.stop_loss = Some(price);
        self
    }

    pub fn validate(&self) -> Result<(), OcoError> {
        if self.symbol.as_str().is_empty() {
            return Err(OcoError::InvalidRequest("symbol must not be empty".to_string()));
        }
        // Symbols go unencoded into signed query strings.
        if !self.symbol.as_str().chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(OcoError::InvalidRequest(format!(
                "symbol must be alphanumeric, got {:?}",
                self.symbol.as_str()
            )));
        }
        if !(self.quantity.is_finite() && self.quantity > 0.0) {
            return Err(OcoError::InvalidRequest(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        for (name, price) in [
            ("entry_price", self.entry_price),
            ("take_profit", self.take_profit),
            ("stop_loss", self.stop_loss),
        ] {
            if let Some(p) = price {
                if !(p.is_finite() && p > 0.0) {
                    return Err(OcoError::InvalidRequest(format!(
                        "{} must be positive, got {}",
                        name, p
                    )));
                }
            }
        }
        Ok(())
    }

    /// Limit order when an entry price is given, market otherwise.
    pub fn entry_order(&self) -> OrderRequest {
        let order_type = match self.entry_price {
            Some(_) => OrderType::Limit,
            None => OrderType::Market,
        };
        OrderRequest {
            symbol: self.symbol.as_str().to_string(),
            side: self.direction.entry_side(),
            quantity: self.quantity,
            price: self.entry_price,
            order_type,
            position_side: self.direction,
        }
    }
}

/// How the position used to size the protective legs was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Observed within the confirmation window.
    Confirmed,
    /// Observed only by the single check after the window elapsed.
    LateConfirmed,
    /// Never observed; legs sized from the requested quantity.
    Placeholder,
}

pub type LegResult = Result<OrderAck, OcoError>;

#[derive(Debug, Clone, PartialEq)]
pub struct BracketResult {
    pub main_order: LegResult,
    /// `None` when no take-profit price was requested.
    pub take_profit_order: Option<LegResult>,
    /// `None` when no stop-loss price was requested.
    pub stop_loss_order: Option<LegResult>,
    /// `None` when the main order never went out.
    pub confirmation: Option<Confirmation>,
}

impl BracketResult {
    pub fn rejected(error: OcoError) -> Self {
        Self {
            main_order: Err(error),
            take_profit_order: None,
            stop_loss_order: None,
            confirmation: None,
        }
    }

    pub fn main_placed(&self) -> bool {
        self.main_order.is_ok()
    }

    /// True when the main order went out and every requested leg was placed.
    pub fn fully_protected(&self) -> bool {
        self.main_placed()
            && self.take_profit_order.as_ref().map_or(true, |r| r.is_ok())
            && self.stop_loss_order.as_ref().map_or(true, |r| r.is_ok())
    }
}

/// Result of one best-effort cancellation.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub order_id: String,
    pub kind: OrderKind,
    pub result: Result<(), ExchangeError>,
}

impl CancelOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// Fill reported for a kind that has no OCO counterpart.
    Rejected,
    /// Nothing tracked for the symbol.
    Untracked,
    Resolved {
        cancellations: Vec<CancelOutcome>,
        /// Symbol entry (orders and position) removed from the registry.
        symbol_cleared: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Exchange reports zero size.
    Flat,
    /// Position query failed; treated as closed.
    QueryFailed(ExchangeError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SymbolStatus {
    Open,
    Closed {
        reason: CloseReason,
        cancellations: Vec<CancelOutcome>,
    },
    /// A bracket for the symbol is still being placed.
    Pending,
    /// Entry changed or vanished between the poll and the cleanup.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolReconciliation {
    pub symbol: Symbol,
    pub status: SymbolStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub symbols: Vec<SymbolReconciliation>,
}

impl ReconcileReport {
    pub fn closed(&self) -> impl Iterator<Item = &SymbolReconciliation> {
        self.symbols
            .iter()
            .filter(|s| matches!(s.status, SymbolStatus::Closed { .. }))
    }

    pub fn status_of(&self, symbol: &str) -> Option<&SymbolStatus> {
        self.symbols
            .iter()
            .find(|s| s.symbol.as_str() == symbol)
            .map(|s| &s.status)
    }
}
