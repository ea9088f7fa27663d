use rust_decimal::Decimal;
use tracing::warn;

use crate::config::RiskConfig;
use crate::models::order::OrderSide;
use crate::models::portfolio::Portfolio;
use crate::models::position::Position;
use crate::models::signal::{SignalType, TradingSignal};

/// Outcome of `check_order_risk`: either the order may proceed, or it is
/// rejected with a human-readable reason and (for allocation breaches) a
/// suggested amount that would pass.
#[derive(Debug, Clone)]
pub enum OrderRiskVerdict {
    Pass,
    Reject {
        reason: String,
        max_allowed_amount: Option<Decimal>,
    },
}

impl OrderRiskVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, OrderRiskVerdict::Pass)
    }
}

/// What a live position's stop/take-profit breach implies should happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionRiskAction {
    Hold,
    ClosePosition,
    TakeProfit,
}

/// Portfolio-wide circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortfolioRiskAction {
    Continue,
    CircuitBreaker,
}

/// Pure risk functions over a `RiskConfig`, as specified in §4.7. No
/// mutable state of its own — the Coordinator/Executor hold whatever
/// portfolio and regime context these functions need and pass it in.
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    fn is_mainstream(symbol: &str) -> bool {
        let upper = symbol.to_uppercase();
        upper.contains("BTC") || upper.contains("ETH")
    }

    fn max_leverage_for(&self, symbol: &str) -> u32 {
        if Self::is_mainstream(symbol) {
            self.config.max_leverage_mainstream
        } else {
            self.config.max_leverage_altcoin
        }
    }

    /// §4.7 `check_order_risk`. Exits always pass; entries are checked
    /// for directional conflict, required fields, leverage bounds,
    /// position-size allocation, and the daily circuit breaker.
    pub fn check_order_risk(&self, signal: &TradingSignal, portfolio: &Portfolio) -> OrderRiskVerdict {
        if signal.signal_type.is_exit() || signal.signal_type == SignalType::Hold {
            return OrderRiskVerdict::Pass;
        }

        let Some(side) = signal.signal_type.position_side() else {
            return OrderRiskVerdict::Pass;
        };

        if portfolio.opposite_position(&signal.symbol, side).is_some() {
            return OrderRiskVerdict::Reject {
                reason: "持仓方向冲突: an opposite-direction position already exists on this symbol"
                    .to_string(),
                max_allowed_amount: None,
            };
        }

        let (Some(amount), Some(price)) = (signal.suggested_amount, signal.suggested_price) else {
            return OrderRiskVerdict::Reject {
                reason: "entry signal missing suggested_amount or suggested_price".to_string(),
                max_allowed_amount: None,
            };
        };

        let leverage = signal.leverage.unwrap_or(1).max(1);
        let max_leverage = self.max_leverage_for(&signal.symbol);
        if leverage > max_leverage {
            return OrderRiskVerdict::Reject {
                reason: format!(
                    "leverage {leverage}x exceeds the {max_leverage}x cap for {}",
                    signal.symbol
                ),
                max_allowed_amount: None,
            };
        }
        if leverage > self.config.high_leverage_warning {
            warn!(symbol = %signal.symbol, leverage, "high leverage requested");
        }

        let notional = amount * price;
        let margin_required = notional / Decimal::from(leverage);
        let total_value = portfolio.total_value();
        if total_value <= Decimal::ZERO {
            return OrderRiskVerdict::Reject {
                reason: "portfolio has no remaining value to size against".to_string(),
                max_allowed_amount: None,
            };
        }
        let allocation_pct = margin_required / total_value;
        let max_position_size = Decimal::try_from(self.config.max_position_size).unwrap_or(Decimal::ONE);
        if allocation_pct > max_position_size {
            let max_allowed_amount =
                (max_position_size * total_value * Decimal::from(leverage)) / price;
            return OrderRiskVerdict::Reject {
                reason: format!(
                    "allocation {allocation_pct:.4} exceeds max_position_size {max_position_size:.4}"
                ),
                max_allowed_amount: Some(max_allowed_amount),
            };
        }

        if portfolio.daily_pnl < Decimal::ZERO {
            let loss_ratio = portfolio.daily_pnl.abs() / total_value;
            let max_daily_loss = Decimal::try_from(self.config.max_daily_loss).unwrap_or(Decimal::ONE);
            if loss_ratio >= max_daily_loss {
                return OrderRiskVerdict::Reject {
                    reason: "daily circuit breaker: loss ratio exceeds max_daily_loss".to_string(),
                    max_allowed_amount: None,
                };
            }
        }

        OrderRiskVerdict::Pass
    }

    /// §4.7 `check_position_risk`: emits a close/take-profit action when
    /// the live stop or target is breached.
    pub fn check_position_risk(&self, position: &Position, current_price: Decimal) -> PositionRiskAction {
        if position.stop_breached(current_price) {
            PositionRiskAction::ClosePosition
        } else if position.take_profit_breached(current_price) {
            PositionRiskAction::TakeProfit
        } else {
            PositionRiskAction::Hold
        }
    }

    /// §4.7 `check_portfolio_risk`: trips when cumulative return has
    /// fallen past `circuit_breaker_threshold` (expressed as percentage
    /// points against `total_return_pct`) or the portfolio has no value.
    pub fn check_portfolio_risk(&self, portfolio: &Portfolio) -> PortfolioRiskAction {
        let threshold_pct = Decimal::try_from(self.config.circuit_breaker_threshold).unwrap_or(Decimal::ONE)
            * Decimal::from(100);
        if portfolio.total_return_pct() <= -threshold_pct || portfolio.total_value() <= Decimal::ZERO {
            PortfolioRiskAction::CircuitBreaker
        } else {
            PortfolioRiskAction::Continue
        }
    }

    /// §4.7 `calculate_stop_loss_take_profit`: symmetric percent formulas,
    /// side-flipped for shorts. Config percentages may be given either as
    /// fractions (0.05) or whole percentages (5.0); normalize to a
    /// fraction before applying.
    pub fn calculate_stop_loss_take_profit(&self, entry: Decimal, side: OrderSide) -> (Decimal, Decimal) {
        let stop_frac = Self::as_fraction(self.config.stop_loss_pct);
        let tp_frac = Self::as_fraction(self.config.take_profit_pct);
        match side {
            OrderSide::Buy => (entry * (Decimal::ONE - stop_frac), entry * (Decimal::ONE + tp_frac)),
            OrderSide::Sell => (entry * (Decimal::ONE + stop_frac), entry * (Decimal::ONE - tp_frac)),
        }
    }

    fn as_fraction(pct: f64) -> Decimal {
        let d = Decimal::try_from(pct).unwrap_or(Decimal::ZERO);
        if d > Decimal::ONE {
            d / Decimal::from(100)
        } else {
            d
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn cfg() -> RiskConfig {
        RiskConfig::default()
    }

    fn portfolio() -> Portfolio {
        Portfolio::new("binance", dec!(10000))
    }

    fn enter_long_signal(amount: Decimal, price: Decimal, leverage: u32) -> TradingSignal {
        TradingSignal {
            timestamp: Utc::now(),
            symbol: "BTC/USDT:USDT".to_string(),
            signal_type: SignalType::EnterLong,
            confidence: 0.8,
            suggested_price: Some(price),
            suggested_amount: Some(amount),
            stop_loss: None,
            take_profit: None,
            leverage: Some(leverage),
            reasoning: "test".to_string(),
            supporting_factors: vec![],
            risk_factors: vec![],
            source: "test".to_string(),
        }
    }

    #[test]
    fn rejects_oversized_allocation_and_suggests_a_passing_amount() {
        let rm = RiskManager::new(cfg());
        let p = portfolio();
        // margin_required = 1 * 50000 / 10 = 5000, allocation = 50% > 20% cap
        let signal = enter_long_signal(dec!(1), dec!(50000), 10);
        match rm.check_order_risk(&signal, &p) {
            OrderRiskVerdict::Reject { max_allowed_amount, .. } => {
                let max_amount = max_allowed_amount.expect("should suggest an amount");
                let mut adjusted = signal.clone();
                adjusted.suggested_amount = Some(max_amount);
                assert!(rm.check_order_risk(&adjusted, &p).is_pass());
            }
            OrderRiskVerdict::Pass => panic!("expected rejection"),
        }
    }

    #[test]
    fn rejects_directional_conflict() {
        let rm = RiskManager::new(cfg());
        let mut p = portfolio();
        p.positions.push(Position {
            exchange_id: "binance".into(),
            symbol: "BTC/USDT:USDT".into(),
            side: OrderSide::Sell,
            amount: dec!(0.01),
            entry_price: dec!(50000),
            current_price: dec!(50000),
            stop_loss: None,
            take_profit: None,
            leverage: Some(10),
            liquidation_price: None,
            entry_fee: Decimal::ZERO,
            entry_order_id: None,
            opened_at: Utc::now(),
            is_open: true,
        });
        let signal = enter_long_signal(dec!(0.01), dec!(50000), 10);
        assert!(!rm.check_order_risk(&signal, &p).is_pass());
    }

    #[test]
    fn daily_circuit_breaker_blocks_new_entries() {
        let rm = RiskManager::new(cfg());
        let mut p = portfolio();
        p.daily_pnl = -dec!(600); // 6% of 10000 > default 5% max_daily_loss
        let signal = enter_long_signal(dec!(0.001), dec!(50000), 5);
        assert!(!rm.check_order_risk(&signal, &p).is_pass());
    }

    #[test]
    fn stop_loss_take_profit_symmetric_for_shorts() {
        let rm = RiskManager::new(cfg());
        let (sl, tp) = rm.calculate_stop_loss_take_profit(dec!(100), OrderSide::Sell);
        assert!(sl > dec!(100));
        assert!(tp < dec!(100));
    }
}
