use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionLayer {
    Strategic,
    Tactical,
}

/// Append-only audit row written for every Strategist cycle and every
/// non-null signal the Trader emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub decision_layer: DecisionLayer,
    pub input_context: serde_json::Value,
    pub thought_process: String,
    pub tools_used: Vec<String>,
    pub decision: serde_json::Value,
    pub action_taken: Option<String>,
    pub model_used: String,
    pub tokens_used: Option<u32>,
    pub latency_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(
        layer: DecisionLayer,
        input_context: serde_json::Value,
        thought_process: impl Into<String>,
        decision: serde_json::Value,
        model_used: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            decision_layer: layer,
            input_context,
            thought_process: thought_process.into(),
            tools_used: Vec::new(),
            decision,
            action_taken: None,
            model_used: model_used.into(),
            tokens_used: None,
            latency_ms: None,
            timestamp: Utc::now(),
        }
    }
}
