//! §4.3 Trader: one batched LLM call per cycle, covering every
//! regime-recommended symbol, emitting a `TradingSignal` per symbol.
//! Symbols the regime doesn't recommend (or explicitly blacklists) never
//! reach the prompt at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::warn;

use crate::config::{AiConfig, RiskConfig};
use crate::errors::{EngineError, EngineResult};
use crate::llm::{ChatMessage, LlmClient};
use crate::models::kline::Kline;
use crate::models::portfolio::Portfolio;
use crate::models::regime::MarketRegime;
use crate::models::signal::TradingSignal;

use super::indicators::{adx_full, adx_strength_bucket, bollinger_position, macd_histogram, summarize};
use super::parsing::parse_tolerant;
use super::raw::RawTradingSignal;

/// One symbol's market data for the batched prompt: enough recent klines
/// on the Trader's primary timeframe to derive every technical tag below.
#[derive(Debug, Clone)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub current_price: Decimal,
    pub klines: Vec<Kline>,
}

pub struct TraderOutput {
    /// One entry per eligible symbol, in the same order as the snapshots
    /// passed in. `None` means the symbol was absent from the model's
    /// response array entirely; `Some` carries whatever the model said,
    /// including an explicit `hold` — the two are not the same thing
    /// (spec §4.1: "for any expected symbol absent from the array, the
    /// signal is `None`"; confidence=0/hold is the valid "no opportunity"
    /// form, itself a non-null signal).
    pub signals: Vec<Option<TradingSignal>>,
    pub raw_response: String,
    pub tokens_used: Option<u32>,
    pub latency_ms: u64,
}

pub struct Trader {
    llm: Arc<dyn LlmClient>,
    config: AiConfig,
}

impl Trader {
    pub fn new(llm: Arc<dyn LlmClient>, config: AiConfig) -> Self {
        Self { llm, config }
    }

    pub async fn generate(
        &self,
        regime: &MarketRegime,
        snapshots: &[SymbolSnapshot],
        portfolio: &Portfolio,
        risk: &RiskConfig,
        cadence_secs: u64,
    ) -> EngineResult<TraderOutput> {
        let eligible: Vec<&SymbolSnapshot> = snapshots.iter().filter(|s| regime.recommends(&s.symbol)).collect();
        if eligible.is_empty() {
            return Ok(TraderOutput {
                signals: Vec::new(),
                raw_response: String::new(),
                tokens_used: None,
                latency_ms: 0,
            });
        }

        let messages = vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(self.user_prompt(regime, &eligible, portfolio, risk, cadence_secs)),
        ];

        let started = Instant::now();
        let call = self.llm.chat(&messages, None, 0.4, 2_500);
        let response = tokio::time::timeout(Duration::from_secs(self.config.trader_timeout_secs), call)
            .await
            .map_err(|_| EngineError::Transient("trader cycle timed out".to_string()))??;

        let raw: Vec<RawTradingSignal> = parse_tolerant(&response.content).unwrap_or_else(|err| {
            warn!(%err, "trader response did not parse as a signal array, treating every symbol as absent this cycle");
            Vec::new()
        });

        let now = Utc::now();
        let mut by_symbol: HashMap<String, TradingSignal> = raw
            .into_iter()
            .map(|r| {
                let normalized = normalize_symbol(&r.symbol, &eligible);
                let mut signal = r.into_signal("trader", now);
                signal.symbol = normalized;
                (signal.symbol.clone(), signal)
            })
            .collect();

        // Absent from the model's array stays `None`; present (including an
        // explicit hold) is `Some`. Do not default a missing symbol to hold
        // here — that would make it indistinguishable from a real hold.
        let signals = eligible.iter().map(|s| by_symbol.remove(&s.symbol)).collect();

        Ok(TraderOutput {
            signals,
            raw_response: response.content,
            tokens_used: response.tokens_used,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn system_prompt(&self) -> String {
        "You are the tactical layer of a crypto futures trading system, operating inside a \
         strategic regime set by an hourly layer above you. For every symbol listed, decide \
         enter_long, exit_long, enter_short, exit_short, or hold. Respect the regime's risk \
         posture and symbol whitelist/blacklist; never suggest leverage above the stated caps. \
         Respond with a JSON array, one object per symbol, each carrying symbol, signal_type, \
         confidence, suggested_price, suggested_amount, stop_loss, take_profit, leverage, \
         reasoning, supporting_factors, risk_factors. JSON only, no prose."
            .to_string()
    }

    fn user_prompt(
        &self,
        regime: &MarketRegime,
        snapshots: &[&SymbolSnapshot],
        portfolio: &Portfolio,
        risk: &RiskConfig,
        cadence_secs: u64,
    ) -> String {
        let regime_section = format!(
            "Regime: bias={:?} structure={:?} risk={:?} mode={:?} cash_ratio={:.2} sizing_mult={:.2}\nNarrative: {}",
            regime.bias, regime.market_structure, regime.risk_level, regime.trading_mode,
            regime.cash_ratio, regime.position_sizing_multiplier, regime.market_narrative,
        );

        let market_section = snapshots
            .iter()
            .map(|s| render_symbol_technicals(s))
            .collect::<Vec<_>>()
            .join("\n");

        let total_value = portfolio.total_value();
        let account_section = format!(
            "Wallet balance: {:.2}\nAvailable balance: {:.2}\nMargin balance: {:.2}\nTotal position value: {:.2}\n\
             Exposure ratio: {:.2}%\nDaily PnL: {:.2}\nCumulative return: {:.2}%",
            portfolio.wallet_balance,
            portfolio.available_balance,
            portfolio.margin_balance,
            portfolio.total_exposure(),
            portfolio.exposure_ratio() * Decimal::from(100),
            portfolio.daily_pnl,
            portfolio.total_return_pct(),
        );

        let position_section = if portfolio.positions.is_empty() {
            "No open positions.".to_string()
        } else {
            portfolio
                .positions
                .iter()
                .filter(|p| p.is_open)
                .map(render_position)
                .collect::<Vec<_>>()
                .join("\n")
        };

        let risk_section = format!(
            "Max position size: {:.2}\nMax leverage (mainstream): {}x\nMax leverage (altcoin): {}x\n\
             Default stop loss: {:.1}%\nDefault take profit: {:.1}%\nCircuit breaker drawdown: {:.1}%",
            risk.max_position_size,
            risk.max_leverage_mainstream,
            risk.max_leverage_altcoin,
            risk.stop_loss_pct,
            risk.take_profit_pct,
            risk.circuit_breaker_threshold * 100.0,
        );

        format!(
            "{regime_section}\n\n=== Market data ===\n{market_section}\n\n=== Account ===\n{account_section}\n\n\
             === Positions ===\n{position_section}\n\n=== Risk limits ===\n{risk_section}\n\n\
             This cycle repeats roughly every {cadence_secs}s; size and time horizon accordingly."
        )
    }
}

fn render_symbol_technicals(snapshot: &SymbolSnapshot) -> String {
    let closes: Vec<f64> = snapshot
        .klines
        .iter()
        .filter_map(|k| rust_decimal::prelude::ToPrimitive::to_f64(&k.close))
        .collect();

    let Some(summary) = summarize(snapshot.klines.first().map(|k| k.timeframe).unwrap_or(crate::models::kline::Timeframe::M15), &snapshot.klines) else {
        return format!("{}: price={} (insufficient history)", snapshot.symbol, snapshot.current_price);
    };

    let rsi_tag = match summary.rsi14 {
        Some(v) if v >= 70.0 => "overbought",
        Some(v) if v <= 30.0 => "oversold",
        Some(_) => "neutral",
        None => "n/a",
    };

    let macd_tag = match macd_histogram(&closes) {
        Some(v) if v > 0.0 => "金叉(bullish_cross)",
        Some(v) if v < 0.0 => "死叉(bearish_cross)",
        Some(_) => "flat",
        None => "n/a",
    };

    let boll_tag = bollinger_position(&closes).unwrap_or("n/a");

    let adx_tag = match adx_full(&snapshot.klines, 14) {
        Some((adx, plus_di, minus_di)) => {
            let direction = if plus_di >= minus_di { "up" } else { "down" };
            format!("{} ({})", adx_strength_bucket(adx), direction)
        }
        None => "n/a".to_string(),
    };

    format!(
        "{symbol}: price={price} rsi14={rsi}({rsi_tag}) ma_trend={trend} macd={macd_tag} boll={boll_tag} atr14={atr} adx={adx_tag} vol={vol}",
        symbol = snapshot.symbol,
        price = snapshot.current_price,
        rsi = summary.rsi14.map(|v| format!("{v:.1}")).unwrap_or_else(|| "n/a".into()),
        rsi_tag = rsi_tag,
        trend = summary.trend,
        macd_tag = macd_tag,
        boll_tag = boll_tag,
        atr = summary.atr14.map(|v| format!("{v:.2}")).unwrap_or_else(|| "n/a".into()),
        adx_tag = adx_tag,
        vol = summary.volatility_bucket,
    )
}

fn render_position(position: &crate::models::position::Position) -> String {
    format!(
        "{symbol} {side:?} lev={lev} held={held} entry={entry} current={current} liq={liq} sl={sl} tp={tp} upnl={pnl}({pct:.2}%)",
        symbol = position.symbol,
        side = position.side,
        lev = position.leverage.map(|l| format!("{l}x")).unwrap_or_else(|| "n/a".into()),
        held = format_duration((Utc::now() - position.opened_at).num_seconds()),
        entry = position.entry_price,
        current = position.current_price,
        liq = position.liquidation_price.map(|v| v.to_string()).unwrap_or_else(|| "n/a".into()),
        sl = position.stop_loss.map(|v| v.to_string()).unwrap_or_else(|| "n/a".into()),
        tp = position.take_profit.map(|v| v.to_string()).unwrap_or_else(|| "n/a".into()),
        pnl = position.unrealized_pnl(),
        pct = position.unrealized_pnl_pct(),
    )
}

fn format_duration(total_seconds: i64) -> String {
    let seconds = total_seconds.max(0);
    if seconds < 3_600 {
        format!("{}m", (seconds / 60).max(1))
    } else if seconds < 86_400 {
        format!("{}h", seconds / 3_600)
    } else {
        format!("{}d", seconds / 86_400)
    }
}

/// The LLM sometimes echoes back a bare base asset ("BTC") or a spot-style
/// pair ("BTC/USDT") instead of the full contract symbol
/// ("BTC/USDT:USDT"); resolve against the symbols actually in play.
fn normalize_symbol(raw: &str, eligible: &[&SymbolSnapshot]) -> String {
    eligible
        .iter()
        .find(|s| MarketRegime::matches_symbol(raw, &s.symbol))
        .map(|s| s.symbol.clone())
        .unwrap_or_else(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::errors::EngineResult;
    use crate::llm::{ChatResponse, ToolSchema};
    use crate::models::regime::MarketRegime;
    use crate::models::portfolio::Portfolio;
    use async_trait::async_trait;

    struct FakeLlm {
        content: &'static str,
    }

    #[async_trait]
    impl LlmClient for FakeLlm {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolSchema]>,
            _temperature: f64,
            _max_tokens: u32,
        ) -> EngineResult<ChatResponse> {
            Ok(ChatResponse {
                content: self.content.to_string(),
                tool_calls: Vec::new(),
                finish_reason: "stop".to_string(),
                tokens_used: Some(42),
                model: "fake".to_string(),
            })
        }
    }

    fn snapshot(symbol: &str) -> SymbolSnapshot {
        SymbolSnapshot {
            symbol: symbol.to_string(),
            current_price: Decimal::new(50_000, 0),
            klines: Vec::new(),
        }
    }

    /// A symbol the model never mentions must come back `None`; a symbol
    /// the model explicitly holds must come back `Some(hold)` — the two
    /// are not the same thing (spec §4.1).
    #[tokio::test]
    async fn distinguishes_absent_symbol_from_explicit_hold() {
        // ETH is never mentioned; BTC gets an explicit hold.
        let response = r#"[{"symbol": "BTC/USDT:USDT", "signal_type": "hold", "confidence": 0.0, "reasoning": "no edge"}]"#;
        let trader = Trader::new(Arc::new(FakeLlm { content: response }), crate::config::AiConfig::default());
        let regime = MarketRegime::default_conservative(Utc::now());
        let snapshots = vec![snapshot("BTC/USDT:USDT"), snapshot("ETH/USDT:USDT")];
        let portfolio = Portfolio::new("binance", Decimal::new(10_000, 0));

        let output = trader
            .generate(&regime, &snapshots, &portfolio, &RiskConfig::default(), 180)
            .await
            .expect("fake LLM call should succeed");

        assert_eq!(output.signals.len(), 2);
        let btc = output.signals[0].as_ref().expect("BTC was explicitly held, not absent");
        assert_eq!(btc.signal_type, crate::models::signal::SignalType::Hold);
        assert!(output.signals[1].is_none(), "ETH was never mentioned by the model, must be None");
    }

    #[test]
    fn format_duration_buckets_by_magnitude() {
        assert_eq!(format_duration(90), "1m");
        assert_eq!(format_duration(7_200), "2h");
        assert_eq!(format_duration(172_800), "2d");
    }

    #[test]
    fn normalize_symbol_resolves_bare_base_asset() {
        let snapshot = SymbolSnapshot {
            symbol: "BTC/USDT:USDT".to_string(),
            current_price: Decimal::ONE,
            klines: Vec::new(),
        };
        let eligible = vec![&snapshot];
        assert_eq!(normalize_symbol("BTC", &eligible), "BTC/USDT:USDT");
        assert_eq!(normalize_symbol("btc/usdt", &eligible), "BTC/USDT:USDT");
    }
}
