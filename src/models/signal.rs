use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    EnterLong,
    ExitLong,
    EnterShort,
    ExitShort,
    Hold,
}

impl SignalType {
    /// Tolerate LLM-emitted synonyms for the canonical signal vocabulary.
    pub fn from_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "enter_long" | "buy" | "long" | "open_long" => Some(SignalType::EnterLong),
            "exit_long" | "sell" | "close_long" => Some(SignalType::ExitLong),
            "enter_short" | "short" | "open_short" => Some(SignalType::EnterShort),
            "exit_short" | "cover" | "close_short" => Some(SignalType::ExitShort),
            "hold" | "wait" | "none" | "no_action" => Some(SignalType::Hold),
            _ => None,
        }
    }

    pub fn is_entry(self) -> bool {
        matches!(self, SignalType::EnterLong | SignalType::EnterShort)
    }

    pub fn is_exit(self) -> bool {
        matches!(self, SignalType::ExitLong | SignalType::ExitShort)
    }

    pub fn order_side(self) -> Option<crate::models::order::OrderSide> {
        use crate::models::order::OrderSide;
        match self {
            SignalType::EnterLong | SignalType::ExitShort => Some(OrderSide::Buy),
            SignalType::EnterShort | SignalType::ExitLong => Some(OrderSide::Sell),
            SignalType::Hold => None,
        }
    }

    /// The position side (long/short) a signal is acting on or against.
    pub fn position_side(self) -> Option<crate::models::order::OrderSide> {
        use crate::models::order::OrderSide;
        match self {
            SignalType::EnterLong | SignalType::ExitLong => Some(OrderSide::Buy),
            SignalType::EnterShort | SignalType::ExitShort => Some(OrderSide::Sell),
            SignalType::Hold => None,
        }
    }
}

/// The Trader's per-symbol, per-cycle output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub signal_type: SignalType,
    pub confidence: f64,
    pub suggested_price: Option<Decimal>,
    pub suggested_amount: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub leverage: Option<u32>,
    pub reasoning: String,
    pub supporting_factors: Vec<String>,
    pub risk_factors: Vec<String>,
    pub source: String,
}

impl TradingSignal {
    pub fn hold(symbol: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            symbol: symbol.into(),
            signal_type: SignalType::Hold,
            confidence: 0.0,
            suggested_price: None,
            suggested_amount: None,
            stop_loss: None,
            take_profit: None,
            leverage: None,
            reasoning: "no actionable edge this cycle".to_string(),
            supporting_factors: Vec::new(),
            risk_factors: Vec::new(),
            source: source.into(),
        }
    }
}
