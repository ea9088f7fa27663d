use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveReason {
    Initial,
    Hourly,
    PositionChange,
}

/// Durable row: either the single mutable "latest" row (archive=None) or
/// one of the immutable archive rows inserted at bootstrap, hourly, or on
/// a position-count change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub exchange_id: String,
    pub wallet_balance: Decimal,
    pub available_balance: Decimal,
    pub margin_balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub positions: Vec<Position>,
    pub snapshot_date: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub is_archive: bool,
    pub archive_reason: Option<ArchiveReason>,
    pub position_count: usize,
}

/// In-memory projection consumed by the Trader and Risk Manager. Built
/// either from the exchange (live mode, via the Portfolio Manager) or
/// purely in memory (paper mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub exchange_id: String,
    pub wallet_balance: Decimal,
    pub available_balance: Decimal,
    pub margin_balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub positions: Vec<Position>,
    pub daily_pnl: Decimal,
    /// UTC calendar date `daily_pnl` has been accumulating against;
    /// `roll_daily_pnl` zeroes the counter the first time it observes a
    /// later date (spec §7: the circuit breaker lifts "on the next UTC
    /// day").
    pub daily_pnl_date: NaiveDate,
    pub total_pnl: Decimal,
    pub initial_capital: Decimal,
    pub total_trades: u64,
    pub winning_trades: u64,
}

impl Portfolio {
    pub fn new(exchange_id: impl Into<String>, initial_capital: Decimal) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            wallet_balance: initial_capital,
            available_balance: initial_capital,
            margin_balance: initial_capital,
            unrealized_pnl: Decimal::ZERO,
            positions: Vec::new(),
            daily_pnl: Decimal::ZERO,
            daily_pnl_date: Utc::now().date_naive(),
            total_pnl: Decimal::ZERO,
            initial_capital,
            total_trades: 0,
            winning_trades: 0,
        }
    }

    /// Zeroes `daily_pnl` the first time it is observed to be a later
    /// UTC calendar date than the one it last accumulated against.
    pub fn roll_daily_pnl(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.daily_pnl_date {
            self.daily_pnl = Decimal::ZERO;
            self.daily_pnl_date = today;
        }
    }

    /// `total_value` as referenced throughout the risk checks: wallet
    /// balance already carries realized cash, so total value for margin
    /// sizing purposes is wallet balance plus unrealized PnL.
    pub fn total_value(&self) -> Decimal {
        self.wallet_balance + self.unrealized_pnl
    }

    pub fn total_exposure(&self) -> Decimal {
        self.positions.iter().map(|p| p.value()).sum()
    }

    pub fn exposure_ratio(&self) -> Decimal {
        let total = self.total_value();
        if total == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.total_exposure() / total
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / self.total_trades as f64
    }

    pub fn total_return_pct(&self) -> Decimal {
        if self.initial_capital == Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.total_value() - self.initial_capital) / self.initial_capital) * Decimal::from(100)
    }

    pub fn position_for(&self, symbol: &str, side: super::order::OrderSide) -> Option<&Position> {
        self.positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == side && p.is_open)
    }

    pub fn opposite_position(&self, symbol: &str, side: super::order::OrderSide) -> Option<&Position> {
        self.positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == side.opposite() && p.is_open)
    }

    /// Apply a fill against the in-memory portfolio (paper mode, or as a
    /// same-tick optimistic update before the next live sync lands).
    pub fn apply_fill(&mut self, symbol: &str, side: super::order::OrderSide, amount: Decimal, price: Decimal, fee: Decimal) {
        self.roll_daily_pnl(Utc::now());
        self.wallet_balance -= fee;

        if let Some(existing) = self
            .positions
            .iter_mut()
            .find(|p| p.symbol == symbol && p.side == side && p.is_open)
        {
            let new_amount = existing.amount + amount;
            existing.entry_price = if new_amount == Decimal::ZERO {
                price
            } else {
                (existing.entry_price * existing.amount + price * amount) / new_amount
            };
            existing.amount = new_amount;
            existing.entry_fee += fee;
            return;
        }

        if let Some(opposite) = self
            .positions
            .iter_mut()
            .find(|p| p.symbol == symbol && p.side == side.opposite() && p.is_open)
        {
            let closing = amount.min(opposite.amount);
            let realized = match opposite.side {
                super::order::OrderSide::Buy => (price - opposite.entry_price) * closing,
                super::order::OrderSide::Sell => (opposite.entry_price - price) * closing,
            };
            self.wallet_balance += realized;
            self.daily_pnl += realized;
            self.total_pnl += realized;
            self.total_trades += 1;
            if realized > Decimal::ZERO {
                self.winning_trades += 1;
            }
            opposite.amount -= closing;
            if opposite.amount <= Decimal::ZERO {
                opposite.is_open = false;
            }
            let leftover = amount - closing;
            if leftover > Decimal::ZERO {
                self.positions.retain(|p| p.is_open);
                self.positions.push(Position {
                    exchange_id: self.exchange_id.clone(),
                    symbol: symbol.to_string(),
                    side,
                    amount: leftover,
                    entry_price: price,
                    current_price: price,
                    stop_loss: None,
                    take_profit: None,
                    leverage: None,
                    liquidation_price: None,
                    entry_fee: Decimal::ZERO,
                    entry_order_id: None,
                    opened_at: Utc::now(),
                    is_open: true,
                });
            }
            self.positions.retain(|p| p.is_open);
            return;
        }

        self.positions.push(Position {
            exchange_id: self.exchange_id.clone(),
            symbol: symbol.to_string(),
            side,
            amount,
            entry_price: price,
            current_price: price,
            stop_loss: None,
            take_profit: None,
            leverage: None,
            liquidation_price: None,
            entry_fee: fee,
            entry_order_id: None,
            opened_at: Utc::now(),
            is_open: true,
        });
    }
}
