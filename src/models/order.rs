use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    StopLossLimit,
    TakeProfit,
    TakeProfitLimit,
}

impl OrderType {
    /// Binance USDM's order `type` string for this kind.
    pub fn binance_type(self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "STOP_MARKET",
            OrderType::StopLossLimit => "STOP",
            OrderType::TakeProfit => "TAKE_PROFIT_MARKET",
            OrderType::TakeProfitLimit => "TAKE_PROFIT",
        }
    }

    pub fn is_protective(self) -> bool {
        matches!(
            self,
            OrderType::StopLoss
                | OrderType::StopLossLimit
                | OrderType::TakeProfit
                | OrderType::TakeProfitLimit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Normalize a reported status against the filled/amount invariant:
    /// `filled >= amount` always implies `Filled`, regardless of what the
    /// exchange's raw status string said.
    pub fn normalize(reported: OrderStatus, filled: Decimal, amount: Decimal) -> OrderStatus {
        if filled >= amount && amount > Decimal::ZERO {
            OrderStatus::Filled
        } else {
            reported
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_id: Option<String>,
    pub exchange_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub cost: Decimal,
    pub average: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub fee_currency: Option<String>,
    pub stop_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub raw: Option<serde_json::Value>,
}

impl Order {
    /// Apply the filled/amount invariant in place.
    pub fn normalize_status(&mut self) {
        self.status = OrderStatus::normalize(self.status, self.filled, self.amount);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub order_id: String,
    pub exchange_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub cost: Decimal,
    pub fee: Option<Decimal>,
    pub fee_currency: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub raw: Option<serde_json::Value>,
}

impl Trade {
    /// Fabricate a synthetic fill for an order the exchange reports as
    /// filled but did not return trade rows for.
    pub fn synthetic(order: &Order) -> Self {
        let price = order.average.or(order.price).unwrap_or(Decimal::ZERO);
        Self {
            id: format!("{}_synthetic", order.id),
            order_id: order.id.clone(),
            exchange_id: order.exchange_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price,
            amount: order.filled,
            cost: price * order.filled,
            fee: order.fee,
            fee_currency: order.fee_currency.clone(),
            timestamp: order.timestamp,
            raw: None,
        }
    }
}
