use serde::{Deserialize, Serialize};

/// Static description of one configured exchange connection.
///
/// Credentials are held by the adapter, not here — this record is the
/// identity other tables key off (`exchange_id`), not a secrets container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub id: String,
    pub name: String,
    pub testnet: bool,
}

impl Exchange {
    pub fn new(id: impl Into<String>, name: impl Into<String>, testnet: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            testnet,
        }
    }
}

/// Baseline capital recorded once per exchange; used only to compute
/// cumulative return percentage, never mutated by the sync loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSettings {
    pub exchange_id: String,
    pub initial_capital: rust_decimal::Decimal,
    pub capital_currency: String,
    pub set_at: chrono::DateTime<chrono::Utc>,
    pub notes: Option<String>,
}
