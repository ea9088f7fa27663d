//! Redis short-term cache and vector-memory seams (spec §6 cache layout).
//! Treated, per spec §1, purely as key/value and similarity-search
//! interfaces; `InMemoryCache`/`InMemoryVectorMemory` are non-persistent
//! reference implementations sufficient to run the engine end-to-end. A
//! production deployment swaps these for Redis- and Qdrant-backed ones
//! without touching the core.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::errors::EngineResult;

pub const MARKET_CONTEXT_TTL: Duration = Duration::from_secs(300);
pub const TRADING_CONTEXT_TTL: Duration = Duration::from_secs(3_600);
pub const TRADE_ACTION_TTL: Duration = Duration::from_secs(900);

pub fn market_context_key(symbol: &str) -> String {
    format!("market:context:{symbol}")
}

pub fn trading_context_key() -> &'static str {
    "trading:context"
}

pub fn trade_action_key(symbol: &str) -> String {
    format!("trade:action:{symbol}")
}

/// JSON-valued key/value store with per-key TTLs, namespaced the way
/// spec §6 lays out (`market:context:*`, `trading:context`,
/// `trade:action:*`, `market:prices:*`).
#[async_trait]
pub trait ShortTermCache: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<serde_json::Value>>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> EngineResult<()>;
    async fn delete(&self, key: &str) -> EngineResult<()>;
}

/// Similarity search over embedded text, standing in for the vector
/// memory store (Qdrant in production).
#[async_trait]
pub trait VectorMemory: Send + Sync {
    async fn upsert(&self, id: &str, embedding: Vec<f32>, payload: serde_json::Value) -> EngineResult<()>;
    async fn search(&self, query: &[f32], top_k: usize) -> EngineResult<Vec<(String, f32, serde_json::Value)>>;
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// In-process reference cache: a `DashMap` keyed by the same namespaced
/// strings Redis would use, with lazy expiry checked on read.
#[derive(Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShortTermCache for InMemoryCache {
    async fn get(&self, key: &str) -> EngineResult<Option<serde_json::Value>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> EngineResult<()> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// In-process reference vector store: brute-force cosine similarity over
/// everything upserted so far. Fine for the engine's volumes (one
/// "experience" row per decision cycle); a real deployment points this
/// at Qdrant instead.
#[derive(Default)]
pub struct InMemoryVectorMemory {
    rows: DashMap<String, (Vec<f32>, serde_json::Value)>,
}

impl InMemoryVectorMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorMemory for InMemoryVectorMemory {
    async fn upsert(&self, id: &str, embedding: Vec<f32>, payload: serde_json::Value) -> EngineResult<()> {
        self.rows.insert(id.to_string(), (embedding, payload));
        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize) -> EngineResult<Vec<(String, f32, serde_json::Value)>> {
        let mut scored: Vec<(String, f32, serde_json::Value)> = self
            .rows
            .iter()
            .map(|entry| {
                let (id, (embedding, payload)) = entry.pair();
                (id.clone(), cosine_similarity(query, embedding), payload.clone())
            })
            .map(|(id, score, payload)| (id, score, payload))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ttl_expiry_evicts_stale_entries() {
        let cache = InMemoryCache::new();
        cache
            .set("k", serde_json::json!({"a": 1}), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vector_search_ranks_by_similarity() {
        let mem = InMemoryVectorMemory::new();
        mem.upsert("a", vec![1.0, 0.0], serde_json::json!("a")).await.unwrap();
        mem.upsert("b", vec![0.0, 1.0], serde_json::json!("b")).await.unwrap();
        let results = mem.search(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(results[0].0, "a");
    }
}
