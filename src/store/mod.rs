//! Relational store seam (spec §3 ownership table, §6 schema). The core
//! only ever speaks through `RelationalStore`; `SqliteStore` is the one
//! concrete implementation — a real embedded database (not an in-memory
//! fake) so the UPSERT/append-only idempotence laws of spec §8 are
//! actually exercised against a storage engine, while staying a single
//! file with no external service to stand up.

pub mod sqlite;

use async_trait::async_trait;

use crate::errors::EngineResult;
use crate::models::decision::DecisionRecord;
use crate::models::exchange::AccountSettings;
use crate::models::kline::Kline;
use crate::models::order::{Order, Trade};
use crate::models::portfolio::PortfolioSnapshot;
use crate::models::position::{ClosedPosition, Position};

pub use sqlite::SqliteStore;

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// UPSERT by `id`; applies the filled>=amount -> Filled normalization
    /// invariant before writing (spec §3 Order invariant).
    async fn upsert_order(&self, order: &Order) -> EngineResult<()>;
    async fn get_order(&self, exchange_id: &str, id: &str) -> EngineResult<Option<Order>>;

    async fn insert_trades(&self, trades: &[Trade]) -> EngineResult<()>;
    async fn trades_for_order(&self, order_id: &str) -> EngineResult<Vec<Trade>>;

    /// UPSERT by `(exchange_id, symbol, side, is_open=true)`.
    async fn upsert_position(&self, position: &Position) -> EngineResult<()>;
    async fn delete_position(&self, exchange_id: &str, symbol: &str, side: crate::models::order::OrderSide) -> EngineResult<()>;
    async fn open_positions(&self, exchange_id: &str) -> EngineResult<Vec<Position>>;

    /// Append-only.
    async fn insert_closed_position(&self, closed: &ClosedPosition) -> EngineResult<()>;
    async fn closed_positions(&self, exchange_id: &str) -> EngineResult<Vec<ClosedPosition>>;

    /// Overwrites the single mutable latest row for `exchange_id`.
    async fn upsert_latest_snapshot(&self, snapshot: &PortfolioSnapshot) -> EngineResult<()>;
    /// Immutable archive insert.
    async fn insert_archive_snapshot(&self, snapshot: &PortfolioSnapshot) -> EngineResult<()>;
    async fn latest_snapshot(&self, exchange_id: &str) -> EngineResult<Option<PortfolioSnapshot>>;
    async fn last_archive_snapshot(&self, exchange_id: &str) -> EngineResult<Option<PortfolioSnapshot>>;

    /// Append-only (spec §8 invariant 4).
    async fn insert_decision(&self, decision: &DecisionRecord) -> EngineResult<()>;

    /// UPSERT by `(exchange_id, symbol, timeframe, timestamp)`.
    async fn upsert_klines(&self, klines: &[Kline]) -> EngineResult<()>;
    async fn klines(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: crate::models::kline::Timeframe,
        limit: usize,
    ) -> EngineResult<Vec<Kline>>;

    async fn upsert_account_settings(&self, settings: &AccountSettings) -> EngineResult<()>;
    async fn account_settings(&self, exchange_id: &str) -> EngineResult<Option<AccountSettings>>;
}
