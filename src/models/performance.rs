use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::ClosedPosition;

/// Derived, not persisted incrementally — recomputed by folding the
/// closed-position ledger over a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub exchange_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub win_rate: f64,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub net_pnl: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub profit_factor: Option<f64>,
}

impl PerformanceMetrics {
    pub fn from_ledger(
        exchange_id: impl Into<String>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        closed: &[ClosedPosition],
    ) -> Self {
        let in_window: Vec<&ClosedPosition> = closed
            .iter()
            .filter(|c| c.exit_time >= period_start && c.exit_time <= period_end)
            .collect();

        let total_trades = in_window.len() as u64;
        let wins: Vec<Decimal> = in_window
            .iter()
            .filter(|c| c.realized_pnl > Decimal::ZERO)
            .map(|c| c.realized_pnl)
            .collect();
        let losses: Vec<Decimal> = in_window
            .iter()
            .filter(|c| c.realized_pnl < Decimal::ZERO)
            .map(|c| c.realized_pnl)
            .collect();

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().copied().sum();
        let winning_trades = wins.len() as u64;
        let losing_trades = losses.len() as u64;

        Self {
            exchange_id: exchange_id.into(),
            period_start,
            period_end,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate: if total_trades == 0 {
                0.0
            } else {
                winning_trades as f64 / total_trades as f64
            },
            gross_profit,
            gross_loss,
            net_pnl: gross_profit + gross_loss,
            largest_win: wins.iter().copied().fold(Decimal::ZERO, Decimal::max),
            largest_loss: losses.iter().copied().fold(Decimal::ZERO, Decimal::min),
            avg_win: if winning_trades == 0 {
                Decimal::ZERO
            } else {
                gross_profit / Decimal::from(winning_trades)
            },
            avg_loss: if losing_trades == 0 {
                Decimal::ZERO
            } else {
                gross_loss / Decimal::from(losing_trades)
            },
            profit_factor: if gross_loss == Decimal::ZERO {
                None
            } else {
                (gross_profit / gross_loss.abs())
                    .to_string()
                    .parse::<f64>()
                    .ok()
            },
        }
    }
}
