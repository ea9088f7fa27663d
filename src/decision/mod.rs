//! §4.1-§4.3 decision stack: the Strategist/Trader cognitive loop, the
//! Coordinator that schedules and persists both, tolerant LLM-output
//! parsing, and the pure technical-indicator math that feeds both prompts.

pub mod coordinator;
pub mod indicators;
pub mod parsing;
pub mod raw;
pub mod strategist;
pub mod trader;

pub use coordinator::Coordinator;
pub use strategist::{MarketEnvironment, Strategist, StrategistOutput};
pub use trader::{SymbolSnapshot, Trader, TraderOutput};
