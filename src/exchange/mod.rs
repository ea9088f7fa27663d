pub mod binance;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::EngineResult;
use crate::models::kline::{Kline, Timeframe};
use crate::models::order::{Order, OrderSide, OrderType, Trade};
use crate::models::position::Position;

pub use binance::BinanceAdapter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub wallet_balance: Decimal,
    pub available_balance: Decimal,
    pub used_margin: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    pub fn midpoint(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }
}

/// Extra placement parameters the exchange needs beyond the core order
/// fields — the Binance USDM `positionSide`/`reduceOnly`/`closePosition`/
/// `workingType` semantics of spec §4.4 step 6.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderParams {
    pub position_side: Option<PositionSide>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub working_type: Option<WorkingType>,
    pub stop_price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
    Both,
}

impl PositionSide {
    /// Infer `positionSide` from the order side and whether it is
    /// reduce-only, exactly as Binance USDM hedge mode requires (spec
    /// §4.4 step 6 / §6).
    pub fn infer(side: OrderSide, reduce_only: bool) -> Self {
        match (side, reduce_only) {
            (OrderSide::Buy, true) => PositionSide::Short,
            (OrderSide::Sell, true) => PositionSide::Long,
            (OrderSide::Buy, false) => PositionSide::Long,
            (OrderSide::Sell, false) => PositionSide::Short,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
            PositionSide::Both => "BOTH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkingType {
    ContractPrice,
    MarkPrice,
}

impl WorkingType {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkingType::ContractPrice => "CONTRACT_PRICE",
            WorkingType::MarkPrice => "MARK_PRICE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeStatus {
    pub operational: bool,
    pub message: Option<String>,
}

/// The contract the core consumes from an exchange. Internals (HTTP
/// client, signing, rate limiting) are the adapter's concern; the core
/// only ever speaks this trait.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange_id(&self) -> &str;

    async fn fetch_ticker(&self, symbol: &str) -> EngineResult<Ticker>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<i64>,
        limit: Option<u32>,
    ) -> EngineResult<Vec<Kline>>;

    async fn fetch_order_book(&self, symbol: &str, limit: Option<u32>) -> EngineResult<OrderBook>;

    async fn fetch_balance(&self) -> EngineResult<Balance>;

    async fn fetch_positions(&self, symbols: Option<&[String]>) -> EngineResult<Vec<Position>>;

    async fn fetch_my_trades(
        &self,
        symbol: &str,
        since: Option<i64>,
        limit: Option<u32>,
    ) -> EngineResult<Vec<Trade>>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()>;

    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        amount: Decimal,
        price: Option<Decimal>,
        params: OrderParams,
    ) -> EngineResult<Order>;

    async fn cancel_order(&self, id: &str, symbol: &str) -> EngineResult<()>;

    async fn fetch_order(&self, id: &str, symbol: &str) -> EngineResult<Order>;

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> EngineResult<Vec<Order>>;

    async fn fetch_status(&self) -> EngineResult<ExchangeStatus>;
}
