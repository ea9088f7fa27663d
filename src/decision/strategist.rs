//! §4.2 Strategist: turns a market environment blob plus multi-timeframe
//! BTC/ETH summaries into one `MarketRegime`. Tool use is disabled — all
//! needed data already lives in the prompt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use crate::config::{AiConfig, PromptStyle};
use crate::errors::{EngineError, EngineResult};
use crate::llm::{ChatMessage, LlmClient};
use crate::models::regime::MarketRegime;

use super::indicators::TimeframeSummary;
use super::parsing::parse_tolerant;
use super::raw::RawMarketRegime;

/// Heterogeneous environment blob the Strategist reasons over (spec
/// §4.2). Each field is already-summarized text/JSON — fetching and
/// pre-digesting these feeds is out of this crate's scope (§1 Non-goals).
#[derive(Debug, Clone, Serialize)]
pub struct MarketEnvironment {
    pub macro_summary: String,
    pub equities_summary: String,
    pub sentiment_summary: String,
    pub recent_news: Vec<String>,
    pub crypto_overview: serde_json::Value,
    pub data_completeness_ratio: f64,
}

pub struct StrategistOutput {
    pub regime: MarketRegime,
    pub raw_response: String,
    pub tokens_used: Option<u32>,
    pub latency_ms: u64,
}

pub struct Strategist {
    llm: Arc<dyn LlmClient>,
    config: AiConfig,
}

impl Strategist {
    pub fn new(llm: Arc<dyn LlmClient>, config: AiConfig) -> Self {
        Self { llm, config }
    }

    pub async fn generate(
        &self,
        env: &MarketEnvironment,
        btc: &[TimeframeSummary],
        eth: &[TimeframeSummary],
    ) -> EngineResult<StrategistOutput> {
        let messages = vec![ChatMessage::system(self.system_prompt()), ChatMessage::user(self.user_prompt(env, btc, eth))];

        let started = Instant::now();
        let call = self.llm.chat(&messages, None, 0.3, 1_500);
        let response = tokio::time::timeout(Duration::from_secs(self.config.strategist_timeout_secs), call)
            .await
            .map_err(|_| EngineError::Transient("strategist cycle timed out".to_string()))??;

        let raw: RawMarketRegime = parse_tolerant(&response.content)?;
        let regime = raw.into_regime(Utc::now());

        Ok(StrategistOutput {
            regime,
            raw_response: response.content,
            tokens_used: response.tokens_used,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn system_prompt(&self) -> String {
        let posture = match self.config.prompt_style {
            PromptStyle::Conservative => "Favor capital preservation; widen cash_ratio and lower sizing when uncertain.",
            PromptStyle::Balanced => "Balance opportunity against drawdown risk.",
            PromptStyle::Aggressive => "Favor decisive positioning when conviction is high.",
        };
        format!(
            "You are the strategic layer of a crypto futures trading system. \
             Analyze the provided macro, equities, sentiment, news, and crypto-market \
             context together with BTC/ETH multi-timeframe technicals, then emit a single \
             JSON object describing the current market regime: bias, market_structure, \
             confidence, risk_level, market_narrative, key_drivers, volatility_range, \
             time_horizon, cash_ratio, max_exposure, trading_mode, \
             position_sizing_multiplier, recommended_symbols, blacklist_symbols, \
             reasoning. {posture} Respond with JSON only."
        )
    }

    fn user_prompt(&self, env: &MarketEnvironment, btc: &[TimeframeSummary], eth: &[TimeframeSummary]) -> String {
        let render = |label: &str, summaries: &[TimeframeSummary]| {
            summaries
                .iter()
                .map(|s| {
                    format!(
                        "{label} {tf}: close={close:.2} rsi14={rsi} ma20={ma20} ma50={ma50} atr14={atr} adx14={adx} trend={trend} vol={vol}",
                        label = label,
                        tf = s.timeframe.as_str(),
                        close = s.last_close,
                        rsi = s.rsi14.map(|v| format!("{v:.1}")).unwrap_or_else(|| "n/a".into()),
                        ma20 = s.ma20.map(|v| format!("{v:.2}")).unwrap_or_else(|| "n/a".into()),
                        ma50 = s.ma50.map(|v| format!("{v:.2}")).unwrap_or_else(|| "n/a".into()),
                        atr = s.atr14.map(|v| format!("{v:.2}")).unwrap_or_else(|| "n/a".into()),
                        adx = s.adx14.map(|v| format!("{v:.1}")).unwrap_or_else(|| "n/a".into()),
                        trend = s.trend,
                        vol = s.volatility_bucket,
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "Macro: {}\nEquities: {}\nSentiment: {}\nRecent news: {}\nCrypto overview: {}\nData completeness: {:.0}%\n\nBTC technicals:\n{}\n\nETH technicals:\n{}",
            env.macro_summary,
            env.equities_summary,
            env.sentiment_summary,
            env.recent_news.join("; "),
            env.crypto_overview,
            env.data_completeness_ratio * 100.0,
            render("BTC", btc),
            render("ETH", eth),
        )
    }
}
