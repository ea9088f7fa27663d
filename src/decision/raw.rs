//! Loosely-typed mirrors of `MarketRegime`/`TradingSignal` for the enum
//! fields an LLM might get wrong. Unknown values degrade to safe
//! defaults with a `warn!`, per spec §4.2/§9 — a malformed enum value
//! must never fail the whole cycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::models::regime::{Bias, MarketRegime, MarketStructure, RiskLevel, TimeHorizon, TradingMode};
use crate::models::signal::{SignalType, TradingSignal};

#[derive(Debug, Deserialize)]
pub struct RawMarketRegime {
    #[serde(default)]
    pub bias: Option<String>,
    #[serde(default)]
    pub market_structure: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub market_narrative: Option<String>,
    #[serde(default)]
    pub key_drivers: Vec<String>,
    #[serde(default)]
    pub volatility_range: Option<String>,
    #[serde(default)]
    pub time_horizon: Option<String>,
    #[serde(default)]
    pub cash_ratio: Option<f64>,
    #[serde(default)]
    pub max_exposure: Option<f64>,
    #[serde(default)]
    pub trading_mode: Option<String>,
    #[serde(default)]
    pub position_sizing_multiplier: Option<f64>,
    #[serde(default)]
    pub recommended_symbols: Vec<String>,
    #[serde(default)]
    pub blacklist_symbols: Vec<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

fn parse_bias(raw: Option<&str>) -> Bias {
    match raw.map(str::to_lowercase).as_deref() {
        Some("bullish") => Bias::Bullish,
        Some("bearish") => Bias::Bearish,
        Some("neutral") => Bias::Neutral,
        other => {
            warn!(?other, "unknown bias value, defaulting to neutral");
            Bias::Neutral
        }
    }
}

fn parse_structure(raw: Option<&str>) -> MarketStructure {
    match raw.map(str::to_lowercase).as_deref() {
        Some("trending") => MarketStructure::Trending,
        Some("ranging") => MarketStructure::Ranging,
        Some("extreme") => MarketStructure::Extreme,
        other => {
            warn!(?other, "unknown market_structure value, defaulting to ranging");
            MarketStructure::Ranging
        }
    }
}

fn parse_risk_level(raw: Option<&str>) -> RiskLevel {
    match raw.map(str::to_lowercase).as_deref() {
        Some("low") => RiskLevel::Low,
        Some("medium") => RiskLevel::Medium,
        Some("high") => RiskLevel::High,
        Some("extreme") => RiskLevel::Extreme,
        other => {
            warn!(?other, "unknown risk_level value, defaulting to medium");
            RiskLevel::Medium
        }
    }
}

fn parse_trading_mode(raw: Option<&str>) -> TradingMode {
    match raw.map(str::to_lowercase).as_deref() {
        Some("aggressive") => TradingMode::Aggressive,
        Some("normal") => TradingMode::Normal,
        Some("conservative") => TradingMode::Conservative,
        Some("defensive") => TradingMode::Defensive,
        other => {
            warn!(?other, "unknown trading_mode value, defaulting to normal");
            TradingMode::Normal
        }
    }
}

/// Maps the compound values the LLM sometimes emits in addition to the
/// canonical short/medium/long (spec §4.2).
fn parse_time_horizon(raw: Option<&str>) -> TimeHorizon {
    match raw.map(str::to_lowercase).as_deref() {
        Some("short") => TimeHorizon::Short,
        Some("medium") => TimeHorizon::Medium,
        Some("long") => TimeHorizon::Long,
        Some("short-to-medium") | Some("short_to_medium") => TimeHorizon::Medium,
        Some("medium-to-long") | Some("medium_to_long") => TimeHorizon::Long,
        other => {
            warn!(?other, "unknown time_horizon value, defaulting to medium");
            TimeHorizon::Medium
        }
    }
}

impl RawMarketRegime {
    pub fn into_regime(self, now: DateTime<Utc>) -> MarketRegime {
        MarketRegime {
            bias: parse_bias(self.bias.as_deref()),
            market_structure: parse_structure(self.market_structure.as_deref()),
            confidence: self.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            risk_level: parse_risk_level(self.risk_level.as_deref()),
            market_narrative: self.market_narrative.unwrap_or_default(),
            key_drivers: self.key_drivers,
            volatility_range: self.volatility_range,
            time_horizon: parse_time_horizon(self.time_horizon.as_deref()),
            cash_ratio: self.cash_ratio.unwrap_or(0.5).clamp(0.0, 1.0),
            max_exposure: self.max_exposure,
            trading_mode: parse_trading_mode(self.trading_mode.as_deref()),
            // Capped at 2.0 per spec §9; never read by the Executor, only
            // the Trader folds this into suggested_amount.
            position_sizing_multiplier: self.position_sizing_multiplier.unwrap_or(1.0).clamp(0.0, 2.0),
            recommended_symbols: self.recommended_symbols,
            blacklist_symbols: self.blacklist_symbols,
            timestamp: now,
            valid_until: MarketRegime::new(now),
            reasoning: self.reasoning.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RawTradingSignal {
    pub symbol: String,
    #[serde(default)]
    pub signal_type: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub suggested_price: Option<Decimal>,
    #[serde(default)]
    pub suggested_amount: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub supporting_factors: Vec<String>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
}

impl RawTradingSignal {
    pub fn into_signal(self, source: &str, now: DateTime<Utc>) -> TradingSignal {
        let signal_type = self
            .signal_type
            .as_deref()
            .and_then(SignalType::from_loose)
            .unwrap_or_else(|| {
                warn!(symbol = %self.symbol, raw = ?self.signal_type, "unknown signal_type, defaulting to hold");
                SignalType::Hold
            });
        TradingSignal {
            timestamp: now,
            symbol: self.symbol,
            signal_type,
            confidence: self.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
            suggested_price: self.suggested_price,
            suggested_amount: self.suggested_amount,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            leverage: self.leverage,
            reasoning: self.reasoning.unwrap_or_default(),
            supporting_factors: self.supporting_factors,
            risk_factors: self.risk_factors,
            source: source.to_string(),
        }
    }
}
