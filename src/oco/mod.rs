pub mod error;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod types;

pub use error::OcoError;
pub use manager::{ManagerConfig, OcoOrderManager};
pub use registry::Registry;
pub use retry::{Backoff, Clock, ManualClock, RetryPolicy, TokioClock};
pub use types::*;
