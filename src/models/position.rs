use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    Liquidation,
    System,
    Unknown,
}

impl CloseReason {
    /// Infer a reason from a Binance order-type string, as the account
    /// sync loop does when reconstructing a close from fill history.
    pub fn from_order_type(order_type: &str) -> Self {
        let lower = order_type.to_lowercase();
        if lower.contains("liquidation") {
            CloseReason::Liquidation
        } else if lower.contains("stop") {
            CloseReason::StopLoss
        } else if lower.contains("take_profit") || lower.contains("limit") {
            CloseReason::TakeProfit
        } else {
            CloseReason::Manual
        }
    }
}

/// A live, open position. Unique per `(exchange_id, symbol, side)` while
/// `is_open` — hedge mode permits one long and one short on the same
/// symbol simultaneously, never two of the same side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub exchange_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub leverage: Option<u32>,
    pub liquidation_price: Option<Decimal>,
    pub entry_fee: Decimal,
    pub entry_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub is_open: bool,
}

impl Position {
    pub fn value(&self) -> Decimal {
        self.amount * self.current_price
    }

    pub fn entry_value(&self) -> Decimal {
        self.amount * self.entry_price
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        match self.side {
            OrderSide::Buy => (self.current_price - self.entry_price) * self.amount,
            OrderSide::Sell => (self.entry_price - self.current_price) * self.amount,
        }
    }

    pub fn unrealized_pnl_pct(&self) -> Decimal {
        let entry_value = self.entry_value();
        if entry_value == Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.unrealized_pnl() / entry_value) * Decimal::from(100)
    }

    pub fn stop_breached(&self, current_price: Decimal) -> bool {
        match (self.side, self.stop_loss) {
            (OrderSide::Buy, Some(sl)) => current_price <= sl,
            (OrderSide::Sell, Some(sl)) => current_price >= sl,
            _ => false,
        }
    }

    pub fn take_profit_breached(&self, current_price: Decimal) -> bool {
        match (self.side, self.take_profit) {
            (OrderSide::Buy, Some(tp)) => current_price >= tp,
            (OrderSide::Sell, Some(tp)) => current_price <= tp,
            _ => false,
        }
    }

    /// The exchange-reported holding side's protective-order side is
    /// always the opposite of the position's own side.
    pub fn protective_order_side(&self) -> OrderSide {
        self.side.opposite()
    }

    /// The slice of this position's accumulated `entry_fee` attributable
    /// to closing `amount` out of it — `entry_fee * (amount / self.amount)`.
    /// Callers closing part of a position must subtract this from the
    /// live position's `entry_fee` in the same transaction that books the
    /// `ClosedPosition` and decrements `amount` (spec §9: ledger
    /// correctness under partial exits), or successive partial closes
    /// double-count the original entry fee.
    pub fn prorated_entry_fee(&self, amount: Decimal) -> Decimal {
        if self.amount == Decimal::ZERO {
            return self.entry_fee;
        }
        self.entry_fee * (amount / self.amount)
    }
}

/// Append-only ledger row emitted whenever a live position reaches zero,
/// in full or in part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub exchange_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub entry_order_id: Option<String>,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_order_id: Option<String>,
    pub exit_price: Decimal,
    pub exit_time: DateTime<Utc>,
    pub amount: Decimal,
    pub entry_value: Decimal,
    pub exit_value: Decimal,
    pub realized_pnl: Decimal,
    pub realized_pnl_pct: Decimal,
    pub total_fee: Decimal,
    pub fee_currency: String,
    pub close_reason: CloseReason,
    pub holding_duration_seconds: i64,
    pub leverage: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl ClosedPosition {
    /// Build a closed-position row for a full or partial exit of `amount`
    /// out of an open position, pro-rating the entry fee by the closed
    /// fraction of the position.
    pub fn from_exit(
        position: &Position,
        amount: Decimal,
        exit_price: Decimal,
        exit_time: DateTime<Utc>,
        exit_order_id: Option<String>,
        exit_fee: Decimal,
        fee_currency: String,
        reason: CloseReason,
    ) -> Self {
        let entry_value = amount * position.entry_price;
        let exit_value = amount * exit_price;
        let realized_pnl = match position.side {
            OrderSide::Buy => (exit_price - position.entry_price) * amount,
            OrderSide::Sell => (position.entry_price - exit_price) * amount,
        };
        let realized_pnl_pct = if entry_value == Decimal::ZERO {
            Decimal::ZERO
        } else {
            (realized_pnl / entry_value) * Decimal::from(100)
        };
        let fee_ratio = if position.amount == Decimal::ZERO {
            Decimal::ONE
        } else {
            amount / position.amount
        };
        let prorated_entry_fee = position.entry_fee * fee_ratio;

        Self {
            exchange_id: position.exchange_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_order_id: position.entry_order_id.clone(),
            entry_price: position.entry_price,
            entry_time: position.opened_at,
            exit_order_id,
            exit_price,
            exit_time,
            amount,
            entry_value,
            exit_value,
            realized_pnl,
            realized_pnl_pct,
            total_fee: prorated_entry_fee + exit_fee,
            fee_currency,
            close_reason: reason,
            holding_duration_seconds: (exit_time - position.opened_at).num_seconds(),
            leverage: position.leverage,
            created_at: Utc::now(),
        }
    }
}
