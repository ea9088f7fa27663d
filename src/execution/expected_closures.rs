//! Expected-closure registry (spec §4.4 step 10 / §4.6 / GLOSSARY). A
//! one-shot hint the Executor leaves for the Account Sync Service so the
//! next sync iteration can short-circuit fill-history reconstruction for
//! an exit it just placed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::models::order::OrderSide;
use crate::models::position::CloseReason;

#[derive(Debug, Clone)]
pub struct ExpectedClosure {
    pub amount: Decimal,
    pub exit_price: Decimal,
    pub exit_time: DateTime<Utc>,
    pub order_id: Option<String>,
    pub reason: CloseReason,
}

/// Keyed by `(symbol, side)`; popped (not just read) on use, so a given
/// registration is consumed exactly once (spec §8 idempotence law).
#[derive(Default)]
pub struct ExpectedClosures {
    inner: Mutex<HashMap<(String, OrderSide), ExpectedClosure>>,
}

impl ExpectedClosures {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, symbol: &str, side: OrderSide, closure: ExpectedClosure) {
        self.inner.lock().await.insert((symbol.to_string(), side), closure);
    }

    pub async fn take(&self, symbol: &str, side: OrderSide) -> Option<ExpectedClosure> {
        self.inner.lock().await.remove(&(symbol.to_string(), side))
    }
}
