use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStructure {
    Trending,
    Ranging,
    Extreme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Extreme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeHorizon {
    Short,
    Medium,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Aggressive,
    Normal,
    Conservative,
    Defensive,
}

/// The Strategist's hourly output. Governs sizing, cash ratio, and the
/// symbol whitelist/blacklist the Trader operates against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRegime {
    pub bias: Bias,
    pub market_structure: MarketStructure,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub market_narrative: String,
    pub key_drivers: Vec<String>,
    pub volatility_range: Option<String>,
    pub time_horizon: TimeHorizon,
    pub cash_ratio: f64,
    pub max_exposure: Option<f64>,
    pub trading_mode: TradingMode,
    pub position_sizing_multiplier: f64,
    pub recommended_symbols: Vec<String>,
    pub blacklist_symbols: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub reasoning: String,
}

impl MarketRegime {
    pub const VALIDITY_SECONDS: i64 = 3_600;

    pub fn new(timestamp: DateTime<Utc>) -> chrono::DateTime<Utc> {
        timestamp + chrono::Duration::seconds(Self::VALIDITY_SECONDS)
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }

    /// Conservative fallback installed when the Strategist fails and no
    /// usable cached regime exists (scenario S5).
    pub fn default_conservative(now: DateTime<Utc>) -> Self {
        Self {
            bias: Bias::Neutral,
            market_structure: MarketStructure::Ranging,
            confidence: 0.3,
            risk_level: RiskLevel::Medium,
            market_narrative: "Strategist unavailable; defaulting to a conservative posture"
                .to_string(),
            key_drivers: Vec::new(),
            volatility_range: None,
            time_horizon: TimeHorizon::Medium,
            cash_ratio: 0.7,
            max_exposure: None,
            trading_mode: TradingMode::Conservative,
            position_sizing_multiplier: 0.5,
            recommended_symbols: vec!["BTC".to_string(), "ETH".to_string()],
            blacklist_symbols: Vec::new(),
            timestamp: now,
            valid_until: Self::new(now),
            reasoning: "fallback regime".to_string(),
        }
    }

    /// Does `symbol` (e.g. "BTC/USDT:USDT") match a regime recommendation
    /// entry (e.g. "BTC")? Matches on base asset, base/quote pair, or the
    /// full contract symbol.
    pub fn matches_symbol(entry: &str, symbol: &str) -> bool {
        let entry = entry.to_uppercase();
        let symbol = symbol.to_uppercase();
        if symbol == entry {
            return true;
        }
        let base = symbol.split('/').next().unwrap_or(&symbol);
        if base == entry {
            return true;
        }
        let pair = symbol.split(':').next().unwrap_or(&symbol);
        pair == entry
    }

    pub fn recommends(&self, symbol: &str) -> bool {
        if self
            .blacklist_symbols
            .iter()
            .any(|s| Self::matches_symbol(s, symbol))
        {
            return false;
        }
        self.recommended_symbols
            .iter()
            .any(|s| Self::matches_symbol(s, symbol))
    }
}
