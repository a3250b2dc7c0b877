//! Exchange collaborator surface consumed by the OCO core.
//!
//! The core only talks to an exchange through [`ExchangeClient`], so a
//! scripted fake can stand in for the Bybit client in tests.

pub mod auth;
pub mod bybit;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use auth::BybitAuth;
pub use bybit::BybitClient;
pub use stream::{OrderFill, OrderStream};

/// Bybit retCode for reduce-only orders placed against a flat position.
pub const RET_CODE_ZERO_POSITION: i64 = 110017;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("HTTP request failed: {0}")]
    Transport(String),

    #[error("Exchange rejected request ({code}): {message}")]
    Api { code: i64, message: String },

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Invalid order parameter: {0}")]
    InvalidParameter(String),
}

impl ExchangeError {
    /// Build an error from an exchange rejection, recognising the
    /// "position not found" family by code or message.
    pub fn from_rejection(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        if code == RET_CODE_ZERO_POSITION || mentions_missing_position(&message) {
            ExchangeError::PositionNotFound(message)
        } else {
            ExchangeError::Api { code, message }
        }
    }

    pub fn is_position_not_found(&self) -> bool {
        match self {
            ExchangeError::PositionNotFound(_) => true,
            ExchangeError::Api { code, message } => {
                *code == RET_CODE_ZERO_POSITION || mentions_missing_position(message)
            }
            _ => false,
        }
    }
}

fn mentions_missing_position(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("position not found")
        || lower.contains("no active position")
        || lower.contains("no position")
        || lower.contains("zero position")
        || lower.contains("position is zero")
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ExchangeError::Decode(e.to_string())
        } else {
            ExchangeError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Decode(e.to_string())
    }
}

/// Side of the exposure an order establishes or protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    /// Order side that opens a position on this side.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position on this side.
    pub fn exit_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown position side: {0:?}")]
pub struct ParsePositionSideError(pub String);

impl FromStr for PositionSide {
    type Err = ParsePositionSideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(PositionSide::Long),
            "short" | "sell" => Ok(PositionSide::Short),
            _ => Err(ParsePositionSideError(s.to_string())),
        }
    }
}

impl TryFrom<String> for PositionSide {
    type Error = ParsePositionSideError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PositionSide> for String {
    fn from(side: PositionSide) -> Self {
        side.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        }
    }
}

/// Entry order submitted through [`ExchangeClient::place_order`].
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: Option<f64>,
    pub order_type: OrderType,
    pub position_side: PositionSide,
}

/// Successful placement payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    #[serde(rename = "orderId")]
    pub order_id: String,
}

impl OrderAck {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last_price: f64,
}

/// Position as reported by the exchange. A flat position has `size == 0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionSnapshot {
    pub size: f64,
    pub hold_side: Option<PositionSide>,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub margin: f64,
}

impl PositionSnapshot {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.size > 0.0
    }
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_market_data(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn get_position(&self, symbol: &str) -> Result<PositionSnapshot, ExchangeError>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        quantity: f64,
        price: f64,
        position_side: PositionSide,
    ) -> Result<OrderAck, ExchangeError>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        quantity: f64,
        stop_price: f64,
        position_side: PositionSide,
    ) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        position_side: PositionSide,
    ) -> Result<(), ExchangeError>;
}
