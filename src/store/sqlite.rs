use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};

use crate::errors::{EngineError, EngineResult};
use crate::models::decision::DecisionRecord;
use crate::models::kline::{Kline, Timeframe};
use crate::models::order::{Order, OrderSide, Trade};
use crate::models::portfolio::PortfolioSnapshot;
use crate::models::position::{ClosedPosition, Position};

use super::{AccountSettings, RelationalStore};

fn to_query_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::QueryFailed(e.to_string())
}

/// Embedded SQLite store. Each logical table keys on the natural
/// identity columns spec §6 requires unique constraints on (order id,
/// `(exchange_id, symbol, side)` for open positions, `(exchange_id,
/// symbol, timeframe, timestamp)` for klines); the remaining fields ride
/// along as a JSON blob rather than one column per field, the way the
/// teacher's own `storage.rs` keeps its schema to exactly the columns it
/// queries on.
///
/// Calls take a synchronous connection lock rather than spawning onto a
/// blocking pool — acceptable at the call volumes this engine drives
/// (one sync iteration per `T_sync`, one order group per signal), and it
/// keeps every query a straight-line `rusqlite` call like the teacher's.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open(path).map_err(to_query_err)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory().map_err(to_query_err)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> EngineResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS orders (
                exchange_id TEXT NOT NULL,
                id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (exchange_id, id)
            );
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                exchange_id TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_order ON trades(order_id);
            CREATE TABLE IF NOT EXISTS positions (
                exchange_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (exchange_id, symbol, side)
            );
            CREATE TABLE IF NOT EXISTS closed_positions (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange_id TEXT NOT NULL,
                exit_time INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS latest_snapshot (
                exchange_id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS archive_snapshot (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS klines (
                exchange_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (exchange_id, symbol, timeframe, timestamp)
            );
            CREATE TABLE IF NOT EXISTS account_settings (
                exchange_id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            COMMIT;",
        )
        .map_err(to_query_err)
    }
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn upsert_order(&self, order: &Order) -> EngineResult<()> {
        let mut order = order.clone();
        order.normalize_status();
        let data = serde_json::to_string(&order).map_err(to_query_err)?;
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO orders (exchange_id, id, symbol, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(exchange_id, id) DO UPDATE SET symbol = excluded.symbol, data = excluded.data",
            params![order.exchange_id, order.id, order.symbol, data],
        )
        .map_err(to_query_err)?;
        Ok(())
    }

    async fn get_order(&self, exchange_id: &str, id: &str) -> EngineResult<Option<Order>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT data FROM orders WHERE exchange_id = ?1 AND id = ?2")
            .map_err(to_query_err)?;
        let row: Option<String> = stmt
            .query_row(params![exchange_id, id], |r| r.get(0))
            .ok();
        Ok(row.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn insert_trades(&self, trades: &[Trade]) -> EngineResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        for trade in trades {
            let data = serde_json::to_string(trade).map_err(to_query_err)?;
            conn.execute(
                "INSERT OR IGNORE INTO trades (id, order_id, exchange_id, data) VALUES (?1, ?2, ?3, ?4)",
                params![trade.id, trade.order_id, trade.exchange_id, data],
            )
            .map_err(to_query_err)?;
        }
        Ok(())
    }

    async fn trades_for_order(&self, order_id: &str) -> EngineResult<Vec<Trade>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT data FROM trades WHERE order_id = ?1")
            .map_err(to_query_err)?;
        let rows = stmt
            .query_map(params![order_id], |r| r.get::<_, String>(0))
            .map_err(to_query_err)?;
        let mut out = Vec::new();
        for row in rows {
            let data = row.map_err(to_query_err)?;
            if let Ok(trade) = serde_json::from_str(&data) {
                out.push(trade);
            }
        }
        Ok(out)
    }

    async fn upsert_position(&self, position: &Position) -> EngineResult<()> {
        let data = serde_json::to_string(position).map_err(to_query_err)?;
        let side = position.side.as_str();
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO positions (exchange_id, symbol, side, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(exchange_id, symbol, side) DO UPDATE SET data = excluded.data",
            params![position.exchange_id, position.symbol, side, data],
        )
        .map_err(to_query_err)?;
        Ok(())
    }

    async fn delete_position(&self, exchange_id: &str, symbol: &str, side: OrderSide) -> EngineResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "DELETE FROM positions WHERE exchange_id = ?1 AND symbol = ?2 AND side = ?3",
            params![exchange_id, symbol, side.as_str()],
        )
        .map_err(to_query_err)?;
        Ok(())
    }

    async fn open_positions(&self, exchange_id: &str) -> EngineResult<Vec<Position>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT data FROM positions WHERE exchange_id = ?1")
            .map_err(to_query_err)?;
        let rows = stmt
            .query_map(params![exchange_id], |r| r.get::<_, String>(0))
            .map_err(to_query_err)?;
        let mut out = Vec::new();
        for row in rows {
            let data = row.map_err(to_query_err)?;
            if let Ok(position) = serde_json::from_str(&data) {
                out.push(position);
            }
        }
        Ok(out)
    }

    async fn insert_closed_position(&self, closed: &ClosedPosition) -> EngineResult<()> {
        let data = serde_json::to_string(closed).map_err(to_query_err)?;
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO closed_positions (exchange_id, exit_time, data) VALUES (?1, ?2, ?3)",
            params![closed.exchange_id, closed.exit_time.timestamp_millis(), data],
        )
        .map_err(to_query_err)?;
        Ok(())
    }

    async fn closed_positions(&self, exchange_id: &str) -> EngineResult<Vec<ClosedPosition>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT data FROM closed_positions WHERE exchange_id = ?1 ORDER BY exit_time ASC")
            .map_err(to_query_err)?;
        let rows = stmt
            .query_map(params![exchange_id], |r| r.get::<_, String>(0))
            .map_err(to_query_err)?;
        let mut out = Vec::new();
        for row in rows {
            let data = row.map_err(to_query_err)?;
            if let Ok(closed) = serde_json::from_str(&data) {
                out.push(closed);
            }
        }
        Ok(out)
    }

    async fn upsert_latest_snapshot(&self, snapshot: &PortfolioSnapshot) -> EngineResult<()> {
        let data = serde_json::to_string(snapshot).map_err(to_query_err)?;
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO latest_snapshot (exchange_id, data) VALUES (?1, ?2)
             ON CONFLICT(exchange_id) DO UPDATE SET data = excluded.data",
            params![snapshot.exchange_id, data],
        )
        .map_err(to_query_err)?;
        Ok(())
    }

    async fn insert_archive_snapshot(&self, snapshot: &PortfolioSnapshot) -> EngineResult<()> {
        let data = serde_json::to_string(snapshot).map_err(to_query_err)?;
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO archive_snapshot (exchange_id, timestamp, data) VALUES (?1, ?2, ?3)",
            params![snapshot.exchange_id, snapshot.timestamp.timestamp_millis(), data],
        )
        .map_err(to_query_err)?;
        Ok(())
    }

    async fn latest_snapshot(&self, exchange_id: &str) -> EngineResult<Option<PortfolioSnapshot>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT data FROM latest_snapshot WHERE exchange_id = ?1")
            .map_err(to_query_err)?;
        let row: Option<String> = stmt.query_row(params![exchange_id], |r| r.get(0)).ok();
        Ok(row.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn last_archive_snapshot(&self, exchange_id: &str) -> EngineResult<Option<PortfolioSnapshot>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT data FROM archive_snapshot WHERE exchange_id = ?1 ORDER BY timestamp DESC LIMIT 1",
            )
            .map_err(to_query_err)?;
        let row: Option<String> = stmt.query_row(params![exchange_id], |r| r.get(0)).ok();
        Ok(row.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn insert_decision(&self, decision: &DecisionRecord) -> EngineResult<()> {
        let data = serde_json::to_string(decision).map_err(to_query_err)?;
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO decisions (id, timestamp, data) VALUES (?1, ?2, ?3)",
            params![decision.id, decision.timestamp.timestamp_millis(), data],
        )
        .map_err(to_query_err)?;
        Ok(())
    }

    async fn upsert_klines(&self, klines: &[Kline]) -> EngineResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        for kline in klines {
            let data = serde_json::to_string(kline).map_err(to_query_err)?;
            conn.execute(
                "INSERT INTO klines (exchange_id, symbol, timeframe, timestamp, data) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(exchange_id, symbol, timeframe, timestamp) DO UPDATE SET data = excluded.data",
                params![
                    kline.exchange_id,
                    kline.symbol,
                    kline.timeframe.as_str(),
                    kline.timestamp,
                    data
                ],
            )
            .map_err(to_query_err)?;
        }
        Ok(())
    }

    async fn klines(
        &self,
        exchange_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> EngineResult<Vec<Kline>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT data FROM klines WHERE exchange_id = ?1 AND symbol = ?2 AND timeframe = ?3
                 ORDER BY timestamp DESC LIMIT ?4",
            )
            .map_err(to_query_err)?;
        let rows = stmt
            .query_map(
                params![exchange_id, symbol, timeframe.as_str(), limit as i64],
                |r| r.get::<_, String>(0),
            )
            .map_err(to_query_err)?;
        let mut out = Vec::new();
        for row in rows {
            let data = row.map_err(to_query_err)?;
            if let Ok(kline) = serde_json::from_str(&data) {
                out.push(kline);
            }
        }
        out.reverse();
        Ok(out)
    }

    async fn upsert_account_settings(&self, settings: &AccountSettings) -> EngineResult<()> {
        let data = serde_json::json!({
            "exchange_id": settings.exchange_id,
            "initial_capital": settings.initial_capital.to_string(),
            "capital_currency": settings.capital_currency,
            "set_at": settings.set_at,
            "notes": settings.notes,
        })
        .to_string();
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO account_settings (exchange_id, data) VALUES (?1, ?2)
             ON CONFLICT(exchange_id) DO UPDATE SET data = excluded.data",
            params![settings.exchange_id, data],
        )
        .map_err(to_query_err)?;
        Ok(())
    }

    async fn account_settings(&self, exchange_id: &str) -> EngineResult<Option<AccountSettings>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT data FROM account_settings WHERE exchange_id = ?1")
            .map_err(to_query_err)?;
        let row: Option<String> = stmt.query_row(params![exchange_id], |r| r.get(0)).ok();
        let Some(raw) = row else { return Ok(None) };
        let v: serde_json::Value = serde_json::from_str(&raw).map_err(to_query_err)?;
        Ok(Some(AccountSettings {
            exchange_id: v["exchange_id"].as_str().unwrap_or_default().to_string(),
            initial_capital: v["initial_capital"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            capital_currency: v["capital_currency"].as_str().unwrap_or("USDT").to_string(),
            set_at: serde_json::from_value(v["set_at"].clone()).unwrap_or_else(|_| chrono::Utc::now()),
            notes: v["notes"].as_str().map(String::from),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::{OrderStatus, OrderType};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn sample_order() -> Order {
        Order {
            id: "1".to_string(),
            client_id: None,
            exchange_id: "binance".to_string(),
            symbol: "BTC/USDT:USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            status: OrderStatus::Open,
            price: None,
            amount: dec!(0.01),
            filled: dec!(0.01),
            remaining: dec!(0),
            cost: dec!(500),
            average: Some(dec!(50000)),
            fee: None,
            fee_currency: None,
            stop_price: None,
            take_profit_price: None,
            stop_loss_price: None,
            timestamp: Utc::now(),
            raw: None,
        }
    }

    #[tokio::test]
    async fn upserting_the_same_order_twice_yields_identical_state() {
        let store = SqliteStore::in_memory().unwrap();
        let order = sample_order();
        store.upsert_order(&order).await.unwrap();
        store.upsert_order(&order).await.unwrap();
        let fetched = store.get_order("binance", "1").await.unwrap().unwrap();
        assert_eq!(fetched.status, OrderStatus::Filled);
        assert_eq!(fetched.filled, dec!(0.01));
    }

    #[tokio::test]
    async fn closed_positions_are_append_only() {
        let store = SqliteStore::in_memory().unwrap();
        let position = Position {
            exchange_id: "binance".into(),
            symbol: "BTC/USDT:USDT".into(),
            side: OrderSide::Buy,
            amount: dec!(0.01),
            entry_price: dec!(50000),
            current_price: dec!(52000),
            stop_loss: None,
            take_profit: None,
            leverage: Some(10),
            liquidation_price: None,
            entry_fee: dec!(0.5),
            entry_order_id: Some("1".into()),
            opened_at: Utc::now(),
            is_open: true,
        };
        let closed = ClosedPosition::from_exit(
            &position,
            dec!(0.01),
            dec!(52000),
            Utc::now(),
            Some("2".into()),
            dec!(0.5),
            "USDT".into(),
            crate::models::position::CloseReason::TakeProfit,
        );
        store.insert_closed_position(&closed).await.unwrap();
        store.insert_closed_position(&closed).await.unwrap();
        assert_eq!(store.closed_positions("binance").await.unwrap().len(), 2);
    }
}
