use thiserror::Error;

use super::types::{OrderKind, Symbol};
use crate::exchange::ExchangeError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OcoError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Symbol {symbol} is not tradable: {source}")]
    InvalidSymbol {
        symbol: Symbol,
        #[source]
        source: ExchangeError,
    },

    #[error("Main order rejected: {0}")]
    MainOrderRejected(#[source] ExchangeError),

    #[error("{kind} placement failed after {attempts} attempts: {last_error}")]
    LegExhausted {
        kind: OrderKind,
        attempts: u32,
        #[source]
        last_error: ExchangeError,
    },

    /// The counterpart filled while this leg was still being placed.
    #[error("{kind} withdrawn: counterpart already filled")]
    Superseded {
        kind: OrderKind,
        /// Set when the leg was acknowledged and then cancelled.
        order_id: Option<String>,
    },
}
