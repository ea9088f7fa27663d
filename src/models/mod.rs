pub mod decision;
pub mod exchange;
pub mod kline;
pub mod order;
pub mod performance;
pub mod portfolio;
pub mod position;
pub mod regime;
pub mod signal;
