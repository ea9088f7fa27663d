//! §4.4 Trading Executor.

pub mod executor;
pub mod expected_closures;

pub use executor::{MarketSnapshot, TradingExecutor};
pub use expected_closures::{ExpectedClosure, ExpectedClosures};
