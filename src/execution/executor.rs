//! §4.4 Trading Executor: `process_trading_signal` makes a signal real.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::cache::{trade_action_key, ShortTermCache, TRADE_ACTION_TTL};
use crate::errors::{EngineError, EngineResult};
use crate::exchange::{ExchangeAdapter, OrderParams, PositionSide, WorkingType};
use crate::models::order::{Order, OrderSide, OrderType, Trade};
use crate::models::portfolio::Portfolio;
use crate::models::position::CloseReason;
use crate::models::signal::{SignalType, TradingSignal};
use crate::portfolio_manager::PortfolioManager;
use crate::risk::{OrderRiskVerdict, RiskManager};
use crate::store::RelationalStore;

use super::expected_closures::{ExpectedClosure, ExpectedClosures};

/// Duplicate-exit suppression window (spec §4.4 step 4).
const DEDUP_WINDOW: Duration = Duration::from_secs(600);
const DEDUP_AMOUNT_TOLERANCE: &str = "0.000001";

pub struct TradingExecutor {
    exchange: Arc<dyn ExchangeAdapter>,
    store: Arc<dyn RelationalStore>,
    cache: Arc<dyn ShortTermCache>,
    portfolio_mgr: Arc<PortfolioManager>,
    risk: Arc<RiskManager>,
    expected_closures: Arc<ExpectedClosures>,
    paper_mode: bool,
}

/// Market context the executor needs to repair/price a signal: just the
/// current mark price for the symbol (spec's "market snapshot").
#[derive(Debug, Clone, Copy)]
pub struct MarketSnapshot {
    pub price: Decimal,
}

impl TradingExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        store: Arc<dyn RelationalStore>,
        cache: Arc<dyn ShortTermCache>,
        portfolio_mgr: Arc<PortfolioManager>,
        risk: Arc<RiskManager>,
        expected_closures: Arc<ExpectedClosures>,
        paper_mode: bool,
    ) -> Self {
        Self {
            exchange,
            store,
            cache,
            portfolio_mgr,
            risk,
            expected_closures,
            paper_mode,
        }
    }

    /// §4.4 pipeline, steps 1-11. Returns the updated portfolio on
    /// success, or `None` if the signal was dropped/rejected before
    /// reaching the exchange (still a non-error outcome — callers should
    /// still write the `DecisionRecord`).
    pub async fn process_trading_signal(
        &self,
        signal: &TradingSignal,
        snapshot: MarketSnapshot,
        portfolio: &Portfolio,
    ) -> EngineResult<Option<Portfolio>> {
        if signal.signal_type == SignalType::Hold {
            return Ok(None);
        }

        // Step 1: validate & repair.
        let Some(repaired) = self.validate_and_repair(signal, snapshot, portfolio)? else {
            return Ok(None);
        };

        // Step 2: risk check.
        match self.risk.check_order_risk(&repaired, portfolio) {
            OrderRiskVerdict::Reject { reason, .. } => {
                info!(symbol = %repaired.symbol, reason, "signal rejected by risk check");
                return Ok(None);
            }
            OrderRiskVerdict::Pass => {}
        }

        // Step 4: deduplicate exits before touching the exchange.
        if repaired.signal_type.is_exit() && self.is_duplicate_exit(&repaired).await {
            info!(symbol = %repaired.symbol, "duplicate exit suppressed");
            return Ok(None);
        }

        let result = if repaired.signal_type.is_entry() {
            self.execute_entry(&repaired).await
        } else {
            self.execute_exit(&repaired, snapshot).await
        };

        self.remember_trade_action(&repaired).await;
        self.write_trading_context(&repaired, portfolio).await;

        result
    }

    fn validate_and_repair(
        &self,
        signal: &TradingSignal,
        snapshot: MarketSnapshot,
        portfolio: &Portfolio,
    ) -> EngineResult<Option<TradingSignal>> {
        let mut signal = signal.clone();

        if signal.signal_type.is_exit() {
            let Some(side) = signal.signal_type.position_side() else {
                return Ok(None);
            };
            let Some(position) = portfolio.position_for(&signal.symbol, side) else {
                info!(symbol = %signal.symbol, "exit signal with no matching open position, dropping");
                return Ok(None);
            };
            let requested = signal.suggested_amount.unwrap_or(position.amount);
            let clamped = requested.min(position.amount);
            if clamped != requested {
                let pct = (clamped / position.amount) * Decimal::from(100);
                info!(symbol = %signal.symbol, %pct, "partial-exit amount clamped to open position size");
            }
            signal.suggested_amount = Some(clamped);
            if signal.suggested_price.is_none() {
                signal.suggested_price = Some(snapshot.price);
            }
            return Ok(Some(signal));
        }

        if signal.suggested_amount.is_none() || signal.suggested_price.is_none() {
            warn!(symbol = %signal.symbol, "entry signal missing amount or price, dropping");
            return Ok(None);
        }
        Ok(Some(signal))
    }

    async fn is_duplicate_exit(&self, signal: &TradingSignal) -> bool {
        let tolerance: Decimal = DEDUP_AMOUNT_TOLERANCE.parse().unwrap_or(Decimal::ZERO);
        let Ok(Some(cached)) = self.cache.get(&trade_action_key(&signal.symbol)).await else {
            return false;
        };
        let Some(last_type) = cached.get("signal_type").and_then(|v| v.as_str()) else {
            return false;
        };
        let Some(last_ts) = cached.get("timestamp").and_then(|v| v.as_i64()) else {
            return false;
        };
        let Some(last_amount) = cached
            .get("amount")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
        else {
            return false;
        };

        let same_type = serde_json::to_value(signal.signal_type)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .as_deref()
            == Some(last_type);
        let within_window = (chrono::Utc::now().timestamp_millis() - last_ts) <= DEDUP_WINDOW.as_millis() as i64;
        let amount = signal.suggested_amount.unwrap_or_default();
        let same_amount = (amount - last_amount).abs() <= tolerance;

        same_type && within_window && same_amount
    }

    async fn remember_trade_action(&self, signal: &TradingSignal) {
        let payload = serde_json::json!({
            "signal_type": signal.signal_type,
            "amount": signal.suggested_amount.unwrap_or_default().to_string(),
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        if let Err(e) = self.cache.set(&trade_action_key(&signal.symbol), payload, TRADE_ACTION_TTL).await {
            warn!(error = %e, "failed to record last trade action");
        }
    }

    async fn write_trading_context(&self, signal: &TradingSignal, portfolio: &Portfolio) {
        let payload = serde_json::json!({
            "symbol": signal.symbol,
            "signal": signal,
            "portfolio_total_value": portfolio.total_value().to_string(),
            "portfolio_exposure_ratio": portfolio.exposure_ratio().to_string(),
        });
        if let Err(e) = self
            .cache
            .set(crate::cache::trading_context_key(), payload, crate::cache::TRADING_CONTEXT_TTL)
            .await
        {
            warn!(error = %e, "failed to write trading context");
        }
    }

    /// Steps 3, 5 (n/a for entries), 6, 7, 8, 10 (n/a), 11 for an entry
    /// signal: derive protective prices if missing, place the main
    /// order, then the stop-loss and take-profit as a best-effort order
    /// group.
    async fn execute_entry(&self, signal: &TradingSignal) -> EngineResult<Option<Portfolio>> {
        let amount = signal.suggested_amount.expect("validated above");
        let price = signal.suggested_price.expect("validated above");
        let side = signal.signal_type.order_side().expect("entry signal has a side");

        let (default_sl, default_tp) = self.risk.calculate_stop_loss_take_profit(price, side);
        let stop_loss = signal.stop_loss.unwrap_or(default_sl);
        let take_profit = signal.take_profit.unwrap_or(default_tp);

        if let Some(leverage) = signal.leverage.filter(|l| *l > 1) {
            if let Err(e) = self.exchange.set_leverage(&signal.symbol, leverage).await {
                warn!(symbol = %signal.symbol, error = %e, "failed to set leverage, continuing with existing setting");
            }
        }

        let main_order = self
            .exchange
            .create_order(
                &signal.symbol,
                OrderType::Market,
                side,
                amount,
                None,
                OrderParams {
                    position_side: Some(PositionSide::infer(side, false)),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EngineError::OrderExecution {
                symbol: signal.symbol.clone(),
                order_id: None,
                reason: e.to_string(),
            })?;

        self.persist_order_and_fills(&main_order).await?;

        let protective_side = side.opposite();
        for (order_type, stop_price, label) in [
            (OrderType::StopLoss, stop_loss, "stop-loss"),
            (OrderType::TakeProfit, take_profit, "take-profit"),
        ] {
            let result = self
                .exchange
                .create_order(
                    &signal.symbol,
                    order_type,
                    protective_side,
                    amount,
                    None,
                    OrderParams {
                        position_side: Some(PositionSide::infer(side, false)),
                        close_position: true,
                        working_type: Some(WorkingType::ContractPrice),
                        stop_price: Some(stop_price),
                        ..Default::default()
                    },
                )
                .await;
            match result {
                Ok(order) => {
                    if let Err(e) = self.persist_order_and_fills(&order).await {
                        warn!(symbol = %signal.symbol, label, error = %e, "failed to persist protective order");
                    }
                }
                // Protective-order failures never roll back the main order (spec §4.4 step 6).
                Err(e) => warn!(symbol = %signal.symbol, label, error = %e, "protective order placement failed"),
            }
        }

        if self.paper_mode {
            let fee = main_order.fee.unwrap_or_default();
            self.portfolio_mgr.apply_fill(&signal.symbol, side, amount, price, fee).await;
            Ok(Some(self.portfolio_mgr.get_current_portfolio(false).await?))
        } else {
            Ok(Some(self.portfolio_mgr.get_current_portfolio(true).await?))
        }
    }

    /// Steps 3 (n/a), 5, 6, 7, 8, 9, 10, 11 for an exit signal: cancel
    /// stale protections, place the reduce-only exit, re-protect any
    /// residual size, and register the expected closure.
    async fn execute_exit(&self, signal: &TradingSignal, snapshot: MarketSnapshot) -> EngineResult<Option<Portfolio>> {
        let amount = signal.suggested_amount.expect("validated above");
        let price = signal.suggested_price.unwrap_or(snapshot.price);
        let side = signal.signal_type.order_side().expect("exit signal has a side");
        let position_side = signal.signal_type.position_side().expect("exit signal has a position side");

        if let Err(e) = self.cancel_stale_protections(&signal.symbol).await {
            warn!(symbol = %signal.symbol, error = %e, "failed to cancel stale protective orders");
        }

        let exit_order = self
            .exchange
            .create_order(
                &signal.symbol,
                OrderType::Market,
                side,
                amount,
                None,
                OrderParams {
                    position_side: Some(PositionSide::infer(side, true)),
                    reduce_only: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EngineError::OrderExecution {
                symbol: signal.symbol.clone(),
                order_id: None,
                reason: e.to_string(),
            })?;

        self.persist_order_and_fills(&exit_order).await?;

        let portfolio = self.portfolio_mgr.get_current_portfolio(!self.paper_mode).await?;
        let remaining = portfolio
            .position_for(&signal.symbol, position_side)
            .map(|p| p.amount)
            .unwrap_or(Decimal::ZERO);

        if remaining > Decimal::ZERO {
            if let (Some(sl), Some(tp)) = (signal.stop_loss, signal.take_profit) {
                let sl_ok = match position_side {
                    OrderSide::Buy => sl < price,
                    OrderSide::Sell => sl > price,
                };
                let tp_ok = match position_side {
                    OrderSide::Buy => tp > price,
                    OrderSide::Sell => tp < price,
                };
                if sl_ok && tp_ok {
                    self.replace_residual_protection(&signal.symbol, position_side, remaining, sl, tp).await;
                } else {
                    warn!(symbol = %signal.symbol, "residual stop/take-profit on wrong side of current price, skipping");
                }
            }
        }

        let exit_price = exit_order.average.or(exit_order.price).unwrap_or(price);
        self.expected_closures
            .register(
                &signal.symbol,
                position_side,
                ExpectedClosure {
                    amount,
                    exit_price,
                    exit_time: chrono::Utc::now(),
                    order_id: Some(exit_order.id.clone()),
                    reason: CloseReason::Manual,
                },
            )
            .await;

        if self.paper_mode {
            let fee = exit_order.fee.unwrap_or_default();
            self.portfolio_mgr.apply_fill(&signal.symbol, side, amount, price, fee).await;
            Ok(Some(self.portfolio_mgr.get_current_portfolio(false).await?))
        } else {
            Ok(Some(portfolio))
        }
    }

    async fn replace_residual_protection(
        &self,
        symbol: &str,
        position_side: OrderSide,
        amount: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) {
        let protective_side = position_side.opposite();
        for (order_type, stop_price) in [(OrderType::StopLoss, stop_loss), (OrderType::TakeProfit, take_profit)] {
            let result = self
                .exchange
                .create_order(
                    symbol,
                    order_type,
                    protective_side,
                    amount,
                    None,
                    OrderParams {
                        position_side: Some(PositionSide::infer(protective_side, true)),
                        close_position: true,
                        working_type: Some(WorkingType::ContractPrice),
                        stop_price: Some(stop_price),
                        ..Default::default()
                    },
                )
                .await;
            if let Err(e) = result {
                warn!(symbol, error = %e, "failed to place residual protective order");
            }
        }
    }

    async fn cancel_stale_protections(&self, symbol: &str) -> EngineResult<()> {
        let open_orders = self.exchange.fetch_open_orders(Some(symbol)).await?;
        for order in open_orders {
            let is_protective = order.order_type.is_protective()
                || order
                    .raw
                    .as_ref()
                    .and_then(|r| r.get("closePosition"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
            if is_protective {
                if let Err(e) = self.exchange.cancel_order(&order.id, symbol).await {
                    warn!(symbol, order_id = %order.id, error = %e, "failed to cancel stale protective order");
                }
            }
        }
        Ok(())
    }

    /// §4.4.1 fill resolution, then persist the order and every fill row:
    /// prefer trades embedded in the order response, fall back to
    /// `fetch_my_trades`, and as a last resort synthesize one fill from
    /// the order's own average price.
    async fn persist_order_and_fills(&self, order: &Order) -> EngineResult<()> {
        self.store.upsert_order(order).await?;

        let embedded: Vec<Trade> = order
            .raw
            .as_ref()
            .and_then(|raw| raw.get("trades"))
            .and_then(|t| t.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| serde_json::from_value::<Trade>(row.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let trades = if !embedded.is_empty() {
            embedded
        } else if !self.paper_mode && order.filled > Decimal::ZERO {
            let fetched = self
                .exchange
                .fetch_my_trades(&order.symbol, None, Some(100))
                .await
                .unwrap_or_default();
            let matched: Vec<Trade> = fetched.into_iter().filter(|t| t.order_id == order.id).collect();
            if matched.is_empty() && order.filled > Decimal::ZERO {
                vec![Trade::synthetic(order)]
            } else {
                matched
            }
        } else if order.filled > Decimal::ZERO {
            vec![Trade::synthetic(order)]
        } else {
            Vec::new()
        };

        if !trades.is_empty() {
            self.store.insert_trades(&trades).await?;
        }
        Ok(())
    }
}
