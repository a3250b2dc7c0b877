pub mod config;
pub mod exchange;
pub mod oco;
pub mod telegram;

pub use config::Config;
pub use exchange::{BybitClient, ExchangeClient, ExchangeError, PositionSide};
pub use oco::{BracketRequest, BracketResult, OcoOrderManager, OrderKind};
pub use telegram::TelegramNotifier;
