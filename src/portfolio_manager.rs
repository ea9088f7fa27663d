//! §4.5 Portfolio Manager: a consistent, rate-limited
//! `get_current_portfolio()` with a paper-mode emulation path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::errors::EngineResult;
use crate::exchange::ExchangeAdapter;
use crate::models::order::OrderSide;
use crate::models::portfolio::Portfolio;

/// `(symbol, side) -> {stop_loss, take_profit}`, derived from open
/// reduce-only/close-position orders. The stop/TP side is the opposite
/// of the protective order's own side, because a reduce-only SELL
/// protects a LONG (spec §4.5).
pub type ProtectionMap = HashMap<(String, OrderSide), (Option<Decimal>, Option<Decimal>)>;

pub struct PortfolioManager {
    exchange: Arc<dyn ExchangeAdapter>,
    exchange_id: String,
    paper_mode: bool,
    sync_interval: Duration,
    debounce: Duration,
    refresh_lock: Mutex<()>,
    cache: RwLock<Portfolio>,
    last_sync: RwLock<Option<Instant>>,
}

impl PortfolioManager {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        exchange_id: impl Into<String>,
        paper_mode: bool,
        initial_capital: Decimal,
        sync_interval: Duration,
        debounce: Duration,
    ) -> Self {
        let exchange_id = exchange_id.into();
        Self {
            exchange,
            cache: RwLock::new(Portfolio::new(exchange_id.clone(), initial_capital)),
            exchange_id,
            paper_mode,
            sync_interval,
            debounce,
            refresh_lock: Mutex::new(()),
            last_sync: RwLock::new(None),
        }
    }

    /// Apply a fill against the in-memory portfolio. Paper mode only —
    /// live mode relies on the next exchange sync to reflect fills.
    pub async fn apply_fill(&self, symbol: &str, side: OrderSide, amount: Decimal, price: Decimal, fee: Decimal) {
        if !self.paper_mode {
            return;
        }
        self.cache.write().await.apply_fill(symbol, side, amount, price, fee);
    }

    /// §4.5: paper mode returns the in-memory cache untouched; live mode
    /// serializes exchange refreshes under a lock, with a time-based gate
    /// and a short debounce window absorbing bursts of concurrent calls.
    pub async fn get_current_portfolio(&self, force_sync: bool) -> EngineResult<Portfolio> {
        if self.paper_mode {
            let mut portfolio = self.cache.read().await.clone();
            portfolio.roll_daily_pnl(chrono::Utc::now());
            *self.cache.write().await = portfolio.clone();
            return Ok(portfolio);
        }

        let now = Instant::now();
        {
            let last_sync = *self.last_sync.read().await;
            let within_debounce = last_sync.is_some_and(|t| now.duration_since(t) < self.debounce);
            if within_debounce {
                return Ok(self.cache.read().await.clone());
            }
            if !force_sync {
                let stale = match last_sync {
                    Some(t) => now.duration_since(t) >= self.sync_interval,
                    None => true,
                };
                if !stale {
                    return Ok(self.cache.read().await.clone());
                }
            }
        }

        let _guard = self.refresh_lock.lock().await;
        // Double-check: another caller may have refreshed while we waited
        // for the lock.
        let now = Instant::now();
        let last_sync = *self.last_sync.read().await;
        if last_sync.is_some_and(|t| now.duration_since(t) < self.debounce) {
            return Ok(self.cache.read().await.clone());
        }
        if !force_sync && last_sync.is_some_and(|t| now.duration_since(t) < self.sync_interval) {
            return Ok(self.cache.read().await.clone());
        }

        match self.refresh_from_exchange().await {
            Ok(portfolio) => {
                *self.cache.write().await = portfolio.clone();
                *self.last_sync.write().await = Some(Instant::now());
                Ok(portfolio)
            }
            Err(e) => {
                warn!(error = %e, "portfolio refresh failed, serving stale cache");
                Ok(self.cache.read().await.clone())
            }
        }
    }

    async fn refresh_from_exchange(&self) -> EngineResult<Portfolio> {
        let balance = self.exchange.fetch_balance().await?;
        let mut positions = self.exchange.fetch_positions(None).await?;

        let mut protection = ProtectionMap::new();
        let mut symbols: Vec<String> = positions.iter().map(|p| p.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();
        for symbol in &symbols {
            match self.exchange.fetch_open_orders(Some(symbol)).await {
                Ok(orders) => merge_protection_map(&mut protection, &orders),
                Err(e) => debug!(symbol, error = %e, "could not fetch open orders for protection map"),
            }
        }

        for position in &mut positions {
            if let Some((sl, tp)) = protection.get(&(position.symbol.clone(), position.side)) {
                position.stop_loss = *sl;
                position.take_profit = *tp;
            }
        }

        let unrealized_pnl: Decimal = positions.iter().map(|p| p.unrealized_pnl()).sum();
        let mut previous = self.cache.read().await.clone();
        previous.roll_daily_pnl(chrono::Utc::now());

        Ok(Portfolio {
            exchange_id: self.exchange_id.clone(),
            wallet_balance: balance.wallet_balance,
            available_balance: balance.available_balance,
            margin_balance: balance.wallet_balance + unrealized_pnl,
            unrealized_pnl,
            positions,
            daily_pnl: previous.daily_pnl,
            daily_pnl_date: previous.daily_pnl_date,
            total_pnl: previous.total_pnl,
            initial_capital: previous.initial_capital,
            total_trades: previous.total_trades,
            winning_trades: previous.winning_trades,
        })
    }
}

/// Build (or extend) a protection map from a batch of open orders, per
/// spec §4.5: only `reduce_only`/`close_position` orders with a
/// recognizable stop price populate the map, keyed by the position side
/// the order protects (the opposite of the order's own side).
pub fn merge_protection_map(map: &mut ProtectionMap, orders: &[crate::models::order::Order]) {
    for order in orders {
        if !order.order_type.is_protective() {
            continue;
        }
        let Some(stop) = order.stop_price else { continue };
        if stop == Decimal::ZERO {
            continue;
        }
        let position_side = order.side.opposite();
        let entry = map.entry((order.symbol.clone(), position_side)).or_insert((None, None));
        match order.order_type {
            crate::models::order::OrderType::StopLoss | crate::models::order::OrderType::StopLossLimit => {
                entry.0 = Some(stop);
            }
            crate::models::order::OrderType::TakeProfit | crate::models::order::OrderType::TakeProfitLimit => {
                entry.1 = Some(stop);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::{Order, OrderStatus, OrderType};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn protective_order(symbol: &str, side: OrderSide, order_type: OrderType, stop: Decimal) -> Order {
        Order {
            id: "1".into(),
            client_id: None,
            exchange_id: "binance".into(),
            symbol: symbol.into(),
            side,
            order_type,
            status: OrderStatus::Open,
            price: None,
            amount: dec!(0.01),
            filled: dec!(0),
            remaining: dec!(0.01),
            cost: dec!(0),
            average: None,
            fee: None,
            fee_currency: None,
            stop_price: Some(stop),
            take_profit_price: None,
            stop_loss_price: None,
            timestamp: Utc::now(),
            raw: None,
        }
    }

    #[test]
    fn protection_map_uses_opposite_side() {
        let mut map = ProtectionMap::new();
        let orders = vec![
            protective_order("BTC/USDT:USDT", OrderSide::Sell, OrderType::StopLoss, dec!(49000)),
            protective_order("BTC/USDT:USDT", OrderSide::Sell, OrderType::TakeProfit, dec!(52000)),
        ];
        merge_protection_map(&mut map, &orders);
        let (sl, tp) = map.get(&("BTC/USDT:USDT".to_string(), OrderSide::Buy)).unwrap();
        assert_eq!(*sl, Some(dec!(49000)));
        assert_eq!(*tp, Some(dec!(52000)));
    }
}
