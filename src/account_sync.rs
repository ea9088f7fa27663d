//! §4.6 Account Sync Service: reconciles the engine's view of open
//! positions against exchange-reported truth, reconstructs closes into
//! the append-only ledger, and maintains the latest/archive snapshot
//! rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::errors::EngineResult;
use crate::exchange::ExchangeAdapter;
use crate::execution::ExpectedClosures;
use crate::models::order::OrderSide;
use crate::models::portfolio::{ArchiveReason, PortfolioSnapshot};
use crate::models::position::{ClosedPosition, CloseReason, Position};
use crate::portfolio_manager::{merge_protection_map, ProtectionMap};
use crate::store::RelationalStore;

/// The 1e-4 amount delta below which a position is considered unchanged
/// (spec §8 idempotence law: float/decimal noise floor).
const NOISE_FLOOR: Decimal = rust_decimal_macros::dec!(0.0001);

/// One detected difference between the previous and current sync's view
/// of a position.
#[derive(Debug, Clone)]
pub enum PositionChange {
    Opened(Position),
    Increased {
        position: Position,
        from: Decimal,
    },
    Reduced {
        symbol: String,
        side: OrderSide,
        from: Decimal,
        to: Decimal,
    },
    Closed {
        symbol: String,
        side: OrderSide,
        last_known: Position,
    },
}

struct SyncState {
    previous: HashMap<(String, OrderSide), Position>,
    sync_count: u64,
    error_count: u64,
    last_sync_time: Option<DateTime<Utc>>,
    last_archive_at: Option<DateTime<Utc>>,
}

pub struct AccountSyncService {
    exchange: Arc<dyn ExchangeAdapter>,
    store: Arc<dyn RelationalStore>,
    expected_closures: Arc<ExpectedClosures>,
    exchange_id: String,
    sync_interval: Duration,
    state: Mutex<SyncState>,
}

impl AccountSyncService {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        store: Arc<dyn RelationalStore>,
        expected_closures: Arc<ExpectedClosures>,
        exchange_id: impl Into<String>,
        sync_interval: Duration,
    ) -> Self {
        Self {
            exchange,
            store,
            expected_closures,
            exchange_id: exchange_id.into(),
            sync_interval,
            state: Mutex::new(SyncState {
                previous: HashMap::new(),
                sync_count: 0,
                error_count: 0,
                last_sync_time: None,
                last_archive_at: None,
            }),
        }
    }

    pub async fn sync_count(&self) -> u64 {
        self.state.lock().await.sync_count
    }

    pub async fn error_count(&self) -> u64 {
        self.state.lock().await.error_count
    }

    pub async fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_sync_time
    }

    /// Runs `sync_once` on `sync_interval` until `shutdown` fires.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.sync_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        error!(error = %e, "account sync iteration failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("account sync service shutting down");
                    return;
                }
            }
        }
    }

    /// One sync iteration: fetch exchange truth under a single mutex,
    /// diff against the previous iteration, reconstruct closes, and
    /// persist everything.
    pub async fn sync_once(&self) -> EngineResult<Vec<PositionChange>> {
        let mut state = self.state.lock().await;

        let result = self.sync_locked(&mut state).await;
        state.sync_count += 1;
        state.last_sync_time = Some(Utc::now());
        if result.is_err() {
            state.error_count += 1;
        }
        result
    }

    async fn sync_locked(&self, state: &mut SyncState) -> EngineResult<Vec<PositionChange>> {
        let balance = self.exchange.fetch_balance().await?;
        let positions = self.exchange.fetch_positions(None).await?;

        let mut protection = ProtectionMap::new();
        let mut symbols: Vec<String> = positions.iter().map(|p| p.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();
        for symbol in &symbols {
            match self.exchange.fetch_open_orders(Some(symbol)).await {
                Ok(orders) => merge_protection_map(&mut protection, &orders),
                Err(e) => debug!(symbol, error = %e, "could not fetch open orders during sync"),
            }
        }

        let mut current: HashMap<(String, OrderSide), Position> = HashMap::new();
        for mut position in positions {
            if let Some((sl, tp)) = protection.get(&(position.symbol.clone(), position.side)) {
                position.stop_loss = *sl;
                position.take_profit = *tp;
            }
            current.insert((position.symbol.clone(), position.side), position);
        }

        let mut changes = self.diff(&state.previous, &current);

        // Orphan sweep: a position the store still thinks is open but the
        // exchange no longer reports at all (e.g. liquidated between
        // syncs) is treated as an external close too.
        let stored_open = self.store.open_positions(&self.exchange_id).await?;
        for stored in stored_open {
            let key = (stored.symbol.clone(), stored.side);
            if !current.contains_key(&key) && !state.previous.contains_key(&key) {
                changes.push(PositionChange::Closed {
                    symbol: stored.symbol.clone(),
                    side: stored.side,
                    last_known: stored,
                });
            }
        }

        for change in &changes {
            self.apply_change(change).await?;
        }

        let archive_reason = self.archive_reason(state, &current);
        let unrealized_pnl: Decimal = current.values().map(|p| p.unrealized_pnl()).sum();
        let snapshot = PortfolioSnapshot {
            exchange_id: self.exchange_id.clone(),
            wallet_balance: balance.wallet_balance,
            available_balance: balance.available_balance,
            margin_balance: balance.wallet_balance + unrealized_pnl,
            unrealized_pnl,
            positions: current.values().cloned().collect(),
            snapshot_date: Utc::now(),
            timestamp: Utc::now(),
            is_archive: false,
            archive_reason: None,
            position_count: current.len(),
        };
        self.store.upsert_latest_snapshot(&snapshot).await?;
        if let Some(reason) = archive_reason {
            let mut archived = snapshot.clone();
            archived.is_archive = true;
            archived.archive_reason = Some(reason);
            self.store.insert_archive_snapshot(&archived).await?;
            state.last_archive_at = Some(Utc::now());
        }

        state.previous = current;
        Ok(changes)
    }

    fn archive_reason(&self, state: &SyncState, current: &HashMap<(String, OrderSide), Position>) -> Option<ArchiveReason> {
        if state.last_archive_at.is_none() {
            return Some(ArchiveReason::Initial);
        }
        if let Some(last) = state.last_archive_at {
            if Utc::now() - last >= chrono::Duration::hours(1) {
                return Some(ArchiveReason::Hourly);
            }
        }
        if current.len() != state.previous.len() {
            return Some(ArchiveReason::PositionChange);
        }
        None
    }

    fn diff(
        &self,
        previous: &HashMap<(String, OrderSide), Position>,
        current: &HashMap<(String, OrderSide), Position>,
    ) -> Vec<PositionChange> {
        let mut changes = Vec::new();

        for (key, position) in current {
            match previous.get(key) {
                None => changes.push(PositionChange::Opened(position.clone())),
                Some(prev) => {
                    let delta = position.amount - prev.amount;
                    if delta.abs() <= NOISE_FLOOR {
                        continue;
                    }
                    if delta > Decimal::ZERO {
                        changes.push(PositionChange::Increased {
                            position: position.clone(),
                            from: prev.amount,
                        });
                    } else {
                        changes.push(PositionChange::Reduced {
                            symbol: key.0.clone(),
                            side: key.1,
                            from: prev.amount,
                            to: position.amount,
                        });
                    }
                }
            }
        }

        for (key, prev) in previous {
            if !current.contains_key(key) {
                changes.push(PositionChange::Closed {
                    symbol: key.0.clone(),
                    side: key.1,
                    last_known: prev.clone(),
                });
            }
        }

        changes
    }

    async fn apply_change(&self, change: &PositionChange) -> EngineResult<()> {
        match change {
            PositionChange::Opened(position) => {
                info!(symbol = %position.symbol, side = ?position.side, amount = %position.amount, "position opened");
                self.store.upsert_position(position).await
            }
            PositionChange::Increased { position, from } => {
                info!(symbol = %position.symbol, from = %from, to = %position.amount, "position increased");
                self.store.upsert_position(position).await
            }
            PositionChange::Reduced { symbol, side, from, to } => {
                info!(symbol, ?side, from = %from, to = %to, "position reduced, reconstructing partial close");
                let closed_amount = from - to;
                self.reconstruct_close(symbol, *side, closed_amount, false).await
            }
            PositionChange::Closed { symbol, side, last_known } => {
                info!(symbol, ?side, "position closed");
                let closed_amount = last_known.amount;
                self.reconstruct_close(symbol, *side, closed_amount, true).await
            }
        }
    }

    /// §4.6 step 4: resolve the exit price/fee/reason for a close, in
    /// order of preference: the expected-closure registry (one-shot hint
    /// left by the Executor), then exchange fill history, then a
    /// mark-price fallback attributed to an external/system close.
    async fn reconstruct_close(&self, symbol: &str, side: OrderSide, amount: Decimal, fully_closed: bool) -> EngineResult<()> {
        let position = match self.store.open_positions(&self.exchange_id).await?.into_iter().find(|p| p.symbol == symbol && p.side == side) {
            Some(p) => p,
            None => {
                warn!(symbol, ?side, "no stored open position to reconcile against a detected close");
                return Ok(());
            }
        };

        if let Some(hint) = self.expected_closures.take(symbol, side).await {
            let closed = ClosedPosition::from_exit(
                &position,
                amount,
                hint.exit_price,
                hint.exit_time,
                hint.order_id,
                Decimal::ZERO,
                "USDT".to_string(),
                hint.reason,
            );
            self.store.insert_closed_position(&closed).await?;
        } else {
            let trades = self.exchange.fetch_my_trades(symbol, None, Some(50)).await.unwrap_or_default();
            let matching: Vec<_> = trades
                .into_iter()
                .filter(|t| t.side == side.opposite() && t.timestamp >= position.opened_at)
                .collect();

            if !matching.is_empty() {
                let total_amount: Decimal = matching.iter().map(|t| t.amount).sum();
                let total_cost: Decimal = matching.iter().map(|t| t.cost).sum();
                let total_fee: Decimal = matching.iter().filter_map(|t| t.fee).sum();
                let exit_price = if total_amount > Decimal::ZERO {
                    total_cost / total_amount
                } else {
                    position.current_price
                };
                let reason = CloseReason::from_order_type(
                    matching.first().and_then(|t| t.raw.as_ref()).and_then(|r| r.get("type")).and_then(|v| v.as_str()).unwrap_or("manual"),
                );
                let closed = ClosedPosition::from_exit(
                    &position,
                    amount,
                    exit_price,
                    matching.last().map(|t| t.timestamp).unwrap_or_else(Utc::now),
                    matching.last().map(|t| t.order_id.clone()),
                    total_fee,
                    matching.first().and_then(|t| t.fee_currency.clone()).unwrap_or_else(|| "USDT".to_string()),
                    reason,
                );
                self.store.insert_closed_position(&closed).await?;
            } else {
                warn!(symbol, ?side, "no trade history found for detected close, falling back to mark price");
                let exit_price = self.exchange.fetch_ticker(symbol).await.map(|t| t.last).unwrap_or(position.current_price);
                let closed = ClosedPosition::from_exit(
                    &position,
                    amount,
                    exit_price,
                    Utc::now(),
                    None,
                    Decimal::ZERO,
                    "USDT".to_string(),
                    CloseReason::System,
                );
                self.store.insert_closed_position(&closed).await?;
            }
        }

        if fully_closed {
            self.store.delete_position(&self.exchange_id, symbol, side).await?;
        } else {
            // `ClosedPosition::from_exit` above already pro-rated this same
            // slice of `entry_fee` into the ledger row; subtract it from the
            // live position here so a later partial/full close doesn't
            // re-attribute it (spec §9, ledger correctness under partial exits).
            let prorated_entry_fee = position.prorated_entry_fee(amount);
            let mut reduced = position;
            reduced.amount -= amount;
            reduced.entry_fee -= prorated_entry_fee;
            self.store.upsert_position(&reduced).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::OrderSide;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn position(symbol: &str, side: OrderSide, amount: Decimal) -> Position {
        Position {
            exchange_id: "binance".into(),
            symbol: symbol.into(),
            side,
            amount,
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
        }
    }

    #[test]
    fn diff_ignores_noise_below_the_floor() {
        let service_diff = |previous: &HashMap<(String, OrderSide), Position>, current: &HashMap<(String, OrderSide), Position>| {
            let mut changes = Vec::new();
            for (key, position) in current {
                if let Some(prev) = previous.get(key) {
                    let delta = position.amount - prev.amount;
                    if delta.abs() > NOISE_FLOOR {
                        changes.push(());
                    }
                }
            }
            changes
        };

        let mut previous = HashMap::new();
        previous.insert(("BTC/USDT:USDT".to_string(), OrderSide::Buy), position("BTC/USDT:USDT", OrderSide::Buy, dec!(1.0)));
        let mut current = HashMap::new();
        current.insert(("BTC/USDT:USDT".to_string(), OrderSide::Buy), position("BTC/USDT:USDT", OrderSide::Buy, dec!(1.00001)));

        assert!(service_diff(&previous, &current).is_empty());
    }

    #[test]
    fn closed_position_from_exit_carries_full_amount_when_fully_closed() {
        let p = position("BTC/USDT:USDT", OrderSide::Buy, dec!(1.0));
        let closed = ClosedPosition::from_exit(&p, dec!(1.0), dec!(51000), Utc::now(), None, dec!(1), "USDT".into(), CloseReason::System);
        assert_eq!(closed.amount, dec!(1.0));
        assert!(closed.realized_pnl > Decimal::ZERO);
    }

    /// Two successive partial closes must each only pro-rate their own
    /// slice of `entry_fee` against the *current* live position, never
    /// the original unreduced fee (spec §9).
    #[test]
    fn successive_partial_closes_do_not_double_count_entry_fee() {
        let mut p = position("BTC/USDT:USDT", OrderSide::Buy, dec!(1.0));
        p.entry_fee = dec!(10);

        // Close half: pro-rated fee is 10 * (0.5 / 1.0) = 5.
        let first_close_amount = dec!(0.5);
        let first_fee = p.prorated_entry_fee(first_close_amount);
        assert_eq!(first_fee, dec!(5));
        p.amount -= first_close_amount;
        p.entry_fee -= first_fee;
        assert_eq!(p.amount, dec!(0.5));
        assert_eq!(p.entry_fee, dec!(5));

        // Close the remaining half against the now-reduced position: pro-rated
        // fee is 5 * (0.5 / 0.5) = 5, not the original 10.
        let second_close_amount = dec!(0.5);
        let second_fee = p.prorated_entry_fee(second_close_amount);
        assert_eq!(second_fee, dec!(5));
        p.amount -= second_close_amount;
        p.entry_fee -= second_fee;

        assert_eq!(p.amount, Decimal::ZERO);
        assert_eq!(p.entry_fee, Decimal::ZERO, "entry fee must fully unwind, never go negative or re-charge");

        // Across both closes, exactly the original fee was attributed, no more.
        assert_eq!(first_fee + second_fee, dec!(10));
    }
}
