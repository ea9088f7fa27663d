//! §4.1 Layered Decision Coordinator: schedules the Strategist (hourly)
//! and Trader (every few minutes) cycles, owns the shared `MarketRegime`
//! state machine (∅ → Valid → Stale → Valid/Default), and records both
//! into the append-only decision ledger.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::{AiConfig, RiskConfig};
use crate::errors::EngineResult;
use crate::llm::LlmClient;
use crate::models::decision::{DecisionLayer, DecisionRecord};
use crate::models::portfolio::Portfolio;
use crate::models::regime::MarketRegime;
use crate::store::RelationalStore;

use super::strategist::{MarketEnvironment, Strategist};
use super::trader::{SymbolSnapshot, Trader};

/// Ticks since bootstrap; the Strategist runs on tick 0 and then every
/// `⌊strategist_interval / trader_interval⌋` ticks thereafter (spec §4.1).
pub struct Coordinator {
    strategist: Strategist,
    trader: Trader,
    store: Arc<dyn RelationalStore>,
    exchange_id: String,
    ai_model: String,
    current_regime: RwLock<Option<MarketRegime>>,
    tick: RwLock<u64>,
    strategist_every_n_ticks: u64,
}

impl Coordinator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        ai_config: AiConfig,
        store: Arc<dyn RelationalStore>,
        exchange_id: impl Into<String>,
        strategist_interval_secs: u64,
        trader_interval_secs: u64,
    ) -> Self {
        let ai_model = ai_config.model.clone();
        let strategist_every_n_ticks = (strategist_interval_secs / trader_interval_secs.max(1)).max(1);
        Self {
            strategist: Strategist::new(llm.clone(), ai_config.clone()),
            trader: Trader::new(llm, ai_config),
            store,
            exchange_id: exchange_id.into(),
            ai_model,
            current_regime: RwLock::new(None),
            tick: RwLock::new(0),
            strategist_every_n_ticks,
        }
    }

    pub async fn current_regime(&self) -> Option<MarketRegime> {
        self.current_regime.read().await.clone()
    }

    /// True on bootstrap (no regime yet) and every `strategist_every_n_ticks`
    /// ticks thereafter; the caller drives the outer timer.
    pub async fn should_run_strategist(&self) -> bool {
        if self.current_regime.read().await.is_none() {
            return true;
        }
        *self.tick.read().await % self.strategist_every_n_ticks == 0
    }

    pub async fn advance_tick(&self) {
        let mut tick = self.tick.write().await;
        *tick += 1;
    }

    /// §4.1 `run_strategist_cycle`. On failure, falls back to the existing
    /// cached regime if still unexpired, otherwise installs
    /// `MarketRegime::default_conservative` (scenario S5) — never leaves
    /// the Trader without a regime to reason against.
    pub async fn run_strategist_cycle(&self, env: &MarketEnvironment, btc: &[super::indicators::TimeframeSummary], eth: &[super::indicators::TimeframeSummary]) -> MarketRegime {
        let now = Utc::now();
        match self.strategist.generate(env, btc, eth).await {
            Ok(output) => {
                let record = DecisionRecord::new(
                    DecisionLayer::Strategic,
                    serde_json::to_value(env).unwrap_or_default(),
                    output.raw_response.clone(),
                    serde_json::to_value(&output.regime).unwrap_or_default(),
                    self.ai_model.clone(),
                );
                let mut record = record;
                record.tokens_used = output.tokens_used;
                record.latency_ms = Some(output.latency_ms);
                if let Err(err) = self.store.insert_decision(&record).await {
                    warn!(%err, "failed to persist strategist decision record");
                }
                *self.current_regime.write().await = Some(output.regime.clone());
                output.regime
            }
            Err(err) => {
                error!(%err, "strategist cycle failed");
                let fallback = {
                    let cached = self.current_regime.read().await.clone();
                    match cached {
                        Some(regime) if !regime.is_stale(now) => regime,
                        _ => MarketRegime::default_conservative(now),
                    }
                };
                let record = DecisionRecord::new(
                    DecisionLayer::Strategic,
                    serde_json::to_value(env).unwrap_or_default(),
                    format!("strategist cycle failed: {err}"),
                    serde_json::to_value(&fallback).unwrap_or_default(),
                    self.ai_model.clone(),
                );
                if let Err(err) = self.store.insert_decision(&record).await {
                    warn!(%err, "failed to persist fallback decision record");
                }
                *self.current_regime.write().await = Some(fallback.clone());
                fallback
            }
        }
    }

    /// §4.1 `run_trader_cycle`. Requires a regime to already be installed —
    /// the caller must have run the Strategist at least once (bootstrap
    /// ordering guarantee, spec §5).
    pub async fn run_trader_cycle(
        &self,
        snapshots: &[SymbolSnapshot],
        portfolio: &Portfolio,
        risk: &RiskConfig,
        cadence_secs: u64,
    ) -> EngineResult<Vec<crate::models::signal::TradingSignal>> {
        let regime = match self.current_regime().await {
            Some(regime) => regime,
            None => {
                warn!("trader cycle requested before any strategist cycle has run; skipping");
                return Ok(Vec::new());
            }
        };

        let output = self.trader.generate(&regime, snapshots, portfolio, risk, cadence_secs).await?;

        // Every non-null signal the Trader emits — including an explicit
        // `hold` — gets a DecisionRecord (spec §3/§8 invariant 4). Only a
        // symbol truly absent from the model's response array (`None`) is
        // skipped; that is not the same thing as the model holding on it.
        let mut signals = Vec::with_capacity(output.signals.len());
        for maybe_signal in &output.signals {
            let Some(signal) = maybe_signal else { continue };

            let record = DecisionRecord::new(
                DecisionLayer::Tactical,
                serde_json::json!({
                    "symbol": signal.symbol,
                    "regime": regime,
                }),
                signal.reasoning.clone(),
                serde_json::to_value(signal).unwrap_or_default(),
                self.ai_model.clone(),
            );
            let mut record = record;
            record.tokens_used = output.tokens_used;
            record.latency_ms = Some(output.latency_ms);
            if let Err(err) = self.store.insert_decision(&record).await {
                warn!(%err, symbol = %signal.symbol, "failed to persist trader decision record");
            }

            signals.push(signal.clone());
        }

        info!(exchange_id = %self.exchange_id, signal_count = signals.len(), "trader cycle complete");
        Ok(signals)
    }
}
