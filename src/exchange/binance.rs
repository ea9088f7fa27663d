use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::config::ExchangeConfig;
use crate::errors::{EngineError, EngineResult};
use crate::models::kline::{Kline, Timeframe};
use crate::models::order::{Order, OrderSide, OrderStatus, OrderType, Trade};
use crate::models::position::Position;

use super::{
    Balance, ExchangeAdapter, ExchangeStatus, OrderBook, OrderBookLevel, OrderParams,
    PositionSide, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

/// Testnet host overrides. The Python original carried two inconsistent
/// tables for this (one in its order-executor module, one in its
/// portfolio module); this adapter standardizes on the officially
/// documented Binance Futures testnet domain (see DESIGN.md).
const TESTNET_REST_URL: &str = "https://testnet.binancefuture.com";
const TESTNET_WS_URL: &str = "wss://stream.binancefuture.com";

/// Binance USDM futures adapter: REST request signing, rate-limited
/// calls, and (optionally) a reconnecting WebSocket ticker stream.
///
/// Grounded in the teacher's `feeds/binance.rs` reconnect-loop idiom,
/// generalized from a read-only price feed into the full CCXT-style
/// adapter contract of spec §6.
pub struct BinanceAdapter {
    config: ExchangeConfig,
    http: reqwest::Client,
    rest_url: String,
    ws_url: String,
    recv_window_ms: i64,
    leverage_cache: RwLock<HashMap<String, u32>>,
    last_price: RwLock<HashMap<String, Decimal>>,
    price_tx: broadcast::Sender<(String, Decimal)>,
    request_seq: AtomicI64,
}

impl BinanceAdapter {
    pub fn new(config: ExchangeConfig) -> Self {
        let (rest_url, ws_url) = if config.testnet {
            (TESTNET_REST_URL.to_string(), TESTNET_WS_URL.to_string())
        } else {
            (config.rest_url.clone(), config.ws_url.clone())
        };
        let (price_tx, _) = broadcast::channel(1024);
        Self {
            config,
            http: reqwest::Client::new(),
            rest_url,
            ws_url,
            recv_window_ms: 5_000,
            leverage_cache: RwLock::new(HashMap::new()),
            last_price: RwLock::new(HashMap::new()),
            price_tx,
            request_seq: AtomicI64::new(0),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .expect("HMAC accepts a key of any length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build a signed query string: every private Binance USDM endpoint
    /// needs `timestamp`, `recvWindow`, and a trailing `signature` over
    /// the preceding params in order.
    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        let timestamp = Utc::now().timestamp_millis();
        params.push(("timestamp".to_string(), timestamp.to_string()));
        params.push(("recvWindow".to_string(), self.recv_window_ms.to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn get_signed(&self, path: &str, params: Vec<(String, String)>) -> EngineResult<Value> {
        let query = self.signed_query(params);
        let url = format!("{}{}?{}", self.rest_url, path, query);
        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.config.api_key)
            .send()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        Self::parse_response(resp).await
    }

    async fn post_signed(&self, path: &str, params: Vec<(String, String)>) -> EngineResult<Value> {
        let query = self.signed_query(params);
        let url = format!("{}{}?{}", self.rest_url, path, query);
        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.config.api_key)
            .send()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        Self::parse_response(resp).await
    }

    async fn delete_signed(&self, path: &str, params: Vec<(String, String)>) -> EngineResult<Value> {
        let query = self.signed_query(params);
        let url = format!("{}{}?{}", self.rest_url, path, query);
        let resp = self
            .http
            .delete(&url)
            .header("X-MBX-APIKEY", &self.config.api_key)
            .send()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        Self::parse_response(resp).await
    }

    async fn parse_response(resp: reqwest::Response) -> EngineResult<Value> {
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::QueryFailed(e.to_string()))?;
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::from_u16(418).unwrap()
        {
            return Err(EngineError::RateLimited(body.to_string()));
        }
        if !status.is_success() {
            if status.is_server_error() {
                return Err(EngineError::Transient(body.to_string()));
            }
            return Err(EngineError::QueryFailed(body.to_string()));
        }
        Ok(body)
    }

    /// Binance returns many numeric fields as JSON strings; parse
    /// defensively per CCXT convention (spec §6).
    fn decimal_field(value: &Value, key: &str) -> Decimal {
        value
            .get(key)
            .and_then(|v| v.as_str().map(|s| s.to_string()).or_else(|| v.as_f64().map(|f| f.to_string())))
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO)
    }

    fn opt_decimal_field(value: &Value, key: &str) -> Option<Decimal> {
        let d = Self::decimal_field(value, key);
        if d == Decimal::ZERO {
            None
        } else {
            Some(d)
        }
    }

    fn binance_symbol(symbol: &str) -> String {
        symbol.split('/').next().unwrap_or(symbol).replace(':', "") + symbol.split(':').nth(1).unwrap_or("")
    }

    fn order_from_json(exchange_id: &str, symbol: &str, v: &Value) -> Order {
        let amount = Self::decimal_field(v, "origQty");
        let filled = Self::decimal_field(v, "executedQty");
        let reported = match v.get("status").and_then(|s| s.as_str()).unwrap_or("") {
            "NEW" => OrderStatus::Open,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            _ => OrderStatus::Pending,
        };
        let side = if v.get("side").and_then(|s| s.as_str()) == Some("SELL") {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let order_type = match v.get("type").and_then(|s| s.as_str()).unwrap_or("") {
            "LIMIT" => OrderType::Limit,
            "STOP_MARKET" => OrderType::StopLoss,
            "STOP" => OrderType::StopLossLimit,
            "TAKE_PROFIT_MARKET" => OrderType::TakeProfit,
            "TAKE_PROFIT" => OrderType::TakeProfitLimit,
            _ => OrderType::Market,
        };
        Order {
            id: v
                .get("orderId")
                .map(|i| i.to_string())
                .unwrap_or_default(),
            client_id: v
                .get("clientOrderId")
                .and_then(|s| s.as_str())
                .map(String::from),
            exchange_id: exchange_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type,
            status: OrderStatus::normalize(reported, filled, amount),
            price: Self::opt_decimal_field(v, "price"),
            amount,
            filled,
            remaining: amount - filled,
            cost: Self::decimal_field(v, "cumQuote"),
            average: Self::opt_decimal_field(v, "avgPrice"),
            fee: None,
            fee_currency: None,
            stop_price: Self::opt_decimal_field(v, "stopPrice"),
            take_profit_price: None,
            stop_loss_price: None,
            timestamp: v
                .get("updateTime")
                .and_then(|t| t.as_i64())
                .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
                .unwrap_or_else(Utc::now),
            raw: Some(v.clone()),
        }
    }

    /// Start a reconnecting WebSocket ticker stream for the given symbols,
    /// mirroring the teacher's `BinanceFeed::start` backoff/reconnect
    /// discipline. Not part of the `ExchangeAdapter` trait — an
    /// auxiliary real-time feed the Trader's market-data poller may use
    /// in place of polling `fetch_ticker` on a tight loop.
    pub fn start_ticker_stream(self: &Arc<Self>, symbols: Vec<String>, mut shutdown: broadcast::Receiver<()>) {
        let this = self.clone();
        tokio::spawn(async move {
            let streams = symbols
                .iter()
                .map(|s| format!("{}@markPrice", Self::binance_symbol(s).to_lowercase()))
                .collect::<Vec<_>>()
                .join("/");
            let ws_url = format!("{}/stream?streams={}", this.ws_url, streams);
            let mut backoff_ms: u64 = 500;

            loop {
                info!(%ws_url, "connecting to exchange ticker stream");
                let conn = tokio::select! {
                    result = connect_async(&ws_url) => result,
                    _ = shutdown.recv() => {
                        info!("ticker stream shutdown");
                        return;
                    }
                };

                match conn {
                    Ok((ws_stream, _)) => {
                        info!("ticker stream connected");
                        backoff_ms = 500;
                        let (_, mut read) = ws_stream.split();

                        loop {
                            let msg = tokio::select! {
                                msg = read.next() => msg,
                                _ = shutdown.recv() => {
                                    info!("ticker stream shutdown");
                                    return;
                                }
                            };

                            match msg {
                                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                                    this.handle_ticker_message(&text).await;
                                }
                                Some(Ok(tokio_tungstenite::tungstenite::Message::Ping(_))) => {
                                    debug!("ticker stream ping");
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("ticker stream error: {e}");
                                    break;
                                }
                                None => {
                                    warn!("ticker stream ended");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => error!("ticker stream connect failed: {e}"),
                }

                warn!("reconnecting ticker stream in {backoff_ms}ms");
                tokio::time::sleep(tokio::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(30_000);
            }
        });
    }

    async fn handle_ticker_message(&self, text: &str) {
        let envelope: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };
        let data = envelope.get("data").unwrap_or(&envelope);
        let symbol = match data.get("s").and_then(|s| s.as_str()) {
            Some(s) => s.to_string(),
            None => return,
        };
        let price = Self::decimal_field(data, "p");
        if price > Decimal::ZERO {
            self.last_price.write().await.insert(symbol.clone(), price);
            let _ = self.price_tx.send((symbol, price));
        }
    }

    pub fn subscribe_prices(&self) -> broadcast::Receiver<(String, Decimal)> {
        self.price_tx.subscribe()
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange_id(&self) -> &str {
        &self.config.id
    }

    async fn fetch_ticker(&self, symbol: &str) -> EngineResult<Ticker> {
        let sym = Self::binance_symbol(symbol);
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.rest_url, sym);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let body = Self::parse_response(resp).await?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: Self::decimal_field(&body, "price"),
            bid: None,
            ask: None,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<i64>,
        limit: Option<u32>,
    ) -> EngineResult<Vec<Kline>> {
        let sym = Self::binance_symbol(symbol);
        let mut url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.rest_url,
            sym,
            timeframe.as_str(),
            limit.unwrap_or(500)
        );
        if let Some(s) = since {
            url.push_str(&format!("&startTime={s}"));
        }
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let body = Self::parse_response(resp).await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let arr = row.as_array()?;
                Some(Kline {
                    exchange_id: self.config.id.clone(),
                    symbol: symbol.to_string(),
                    timeframe,
                    timestamp: arr.first()?.as_i64()?,
                    open: arr.get(1)?.as_str()?.parse().ok()?,
                    high: arr.get(2)?.as_str()?.parse().ok()?,
                    low: arr.get(3)?.as_str()?.parse().ok()?,
                    close: arr.get(4)?.as_str()?.parse().ok()?,
                    volume: arr.get(5)?.as_str()?.parse().ok()?,
                })
            })
            .collect())
    }

    async fn fetch_order_book(&self, symbol: &str, limit: Option<u32>) -> EngineResult<OrderBook> {
        let sym = Self::binance_symbol(symbol);
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.rest_url,
            sym,
            limit.unwrap_or(20)
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let body = Self::parse_response(resp).await?;
        let parse_levels = |key: &str| -> Vec<OrderBookLevel> {
            body.get(key)
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|lvl| {
                            let lvl = lvl.as_array()?;
                            Some(OrderBookLevel {
                                price: lvl.first()?.as_str()?.parse().ok()?,
                                amount: lvl.get(1)?.as_str()?.parse().ok()?,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: parse_levels("bids"),
            asks: parse_levels("asks"),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_balance(&self) -> EngineResult<Balance> {
        let body = self.get_signed("/fapi/v2/account", vec![]).await?;
        // `total` in CCXT-normalized output is margin balance, not wallet
        // balance — read the raw account payload fields directly (spec §4.5).
        let wallet_balance = Self::decimal_field(&body, "totalWalletBalance");
        let available_balance = Self::decimal_field(&body, "availableBalance");
        let initial_margin = Self::decimal_field(&body, "totalInitialMargin");
        let used_margin = if initial_margin > Decimal::ZERO {
            initial_margin
        } else {
            (wallet_balance - available_balance).max(Decimal::ZERO)
        };
        Ok(Balance {
            wallet_balance,
            available_balance,
            used_margin,
        })
    }

    async fn fetch_positions(&self, symbols: Option<&[String]>) -> EngineResult<Vec<Position>> {
        let body = self.get_signed("/fapi/v2/positionRisk", vec![]).await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        let wanted: Option<Vec<String>> = symbols.map(|s| s.iter().map(|x| Self::binance_symbol(x)).collect());

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let amt = Self::decimal_field(&row, "positionAmt");
                if amt == Decimal::ZERO {
                    return None;
                }
                let symbol = row.get("symbol")?.as_str()?.to_string();
                if let Some(w) = &wanted {
                    if !w.contains(&symbol) {
                        return None;
                    }
                }
                let side = match row.get("positionSide").and_then(|s| s.as_str()) {
                    Some("SHORT") => OrderSide::Sell,
                    Some("LONG") => OrderSide::Buy,
                    _ => {
                        if amt.is_sign_negative() {
                            OrderSide::Sell
                        } else {
                            OrderSide::Buy
                        }
                    }
                };
                let entry_price = Self::decimal_field(&row, "entryPrice");
                let mark_price = Self::decimal_field(&row, "markPrice");
                let leverage = row
                    .get("leverage")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<u32>().ok());
                Some(Position {
                    exchange_id: self.config.id.clone(),
                    symbol,
                    side,
                    amount: amt.abs(),
                    entry_price,
                    current_price: mark_price,
                    stop_loss: None,
                    take_profit: None,
                    leverage,
                    liquidation_price: Self::opt_decimal_field(&row, "liquidationPrice"),
                    entry_fee: Decimal::ZERO,
                    entry_order_id: None,
                    opened_at: row
                        .get("updateTime")
                        .and_then(|t| t.as_i64())
                        .and_then(chrono::DateTime::from_timestamp_millis)
                        .unwrap_or_else(Utc::now),
                    is_open: true,
                })
            })
            .collect())
    }

    async fn fetch_my_trades(
        &self,
        symbol: &str,
        since: Option<i64>,
        limit: Option<u32>,
    ) -> EngineResult<Vec<Trade>> {
        let sym = Self::binance_symbol(symbol);
        let mut params = vec![
            ("symbol".to_string(), sym),
            ("limit".to_string(), limit.unwrap_or(50).to_string()),
        ];
        if let Some(s) = since {
            params.push(("startTime".to_string(), s.to_string()));
        }
        let body = self.get_signed("/fapi/v1/userTrades", params).await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|row| {
                let price = Self::decimal_field(&row, "price");
                let amount = Self::decimal_field(&row, "qty");
                let side = if row.get("side").and_then(|s| s.as_str()) == Some("SELL") {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                };
                Trade {
                    id: row.get("id").map(|i| i.to_string()).unwrap_or_default(),
                    order_id: row.get("orderId").map(|i| i.to_string()).unwrap_or_default(),
                    exchange_id: self.config.id.clone(),
                    symbol: symbol.to_string(),
                    side,
                    price,
                    amount,
                    cost: price * amount,
                    fee: Self::opt_decimal_field(&row, "commission"),
                    fee_currency: row
                        .get("commissionAsset")
                        .and_then(|s| s.as_str())
                        .map(String::from),
                    timestamp: row
                        .get("time")
                        .and_then(|t| t.as_i64())
                        .and_then(chrono::DateTime::from_timestamp_millis)
                        .unwrap_or_else(Utc::now),
                    raw: Some(row),
                }
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        let sym = Self::binance_symbol(symbol);
        {
            let cache = self.leverage_cache.read().await;
            if cache.get(&sym) == Some(&leverage) {
                return Ok(());
            }
        }
        let params = vec![
            ("symbol".to_string(), sym.clone()),
            ("leverage".to_string(), leverage.to_string()),
        ];
        self.post_signed("/fapi/v1/leverage", params).await?;
        self.leverage_cache.write().await.insert(sym, leverage);
        Ok(())
    }

    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        amount: Decimal,
        price: Option<Decimal>,
        mut params: OrderParams,
    ) -> EngineResult<Order> {
        let sym = Self::binance_symbol(symbol);
        let position_side = params
            .position_side
            .unwrap_or_else(|| PositionSide::infer(side, params.reduce_only));

        // Binance rejects `reduceOnly` on market orders and on any
        // close-position protective order; rely on positionSide alone.
        if order_type == OrderType::Market || params.close_position {
            params.reduce_only = false;
        }

        let mut query = vec![
            ("symbol".to_string(), sym.clone()),
            ("side".to_string(), side.as_str().to_uppercase()),
            ("type".to_string(), order_type.binance_type().to_string()),
            ("quantity".to_string(), amount.to_string()),
            ("positionSide".to_string(), position_side.as_str().to_string()),
        ];
        if params.reduce_only {
            query.push(("reduceOnly".to_string(), "true".to_string()));
        }
        if params.close_position {
            query.push(("closePosition".to_string(), "true".to_string()));
        }
        if let Some(p) = price {
            query.push(("price".to_string(), p.to_string()));
            query.push(("timeInForce".to_string(), "GTC".to_string()));
        }
        if order_type.is_protective() {
            let stop = params.stop_price.or(price).ok_or_else(|| {
                EngineError::OrderExecution {
                    symbol: symbol.to_string(),
                    order_id: None,
                    reason: "protective order requires a stop price".to_string(),
                }
            })?;
            query.push(("stopPrice".to_string(), stop.to_string()));
            let working_type = params.working_type.unwrap_or(super::WorkingType::ContractPrice);
            query.push(("workingType".to_string(), working_type.as_str().to_string()));
        }

        let body = self.post_signed("/fapi/v1/order", query).await.map_err(|e| match e {
            EngineError::QueryFailed(reason) | EngineError::Transient(reason) => {
                EngineError::OrderExecution {
                    symbol: symbol.to_string(),
                    order_id: None,
                    reason,
                }
            }
            other => other,
        })?;

        Ok(Self::order_from_json(&self.config.id, symbol, &body))
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> EngineResult<()> {
        let sym = Self::binance_symbol(symbol);
        let params = vec![("symbol".to_string(), sym), ("orderId".to_string(), id.to_string())];
        self.delete_signed("/fapi/v1/order", params)
            .await
            .map_err(|e| EngineError::CancellationFailed {
                symbol: symbol.to_string(),
                order_id: id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn fetch_order(&self, id: &str, symbol: &str) -> EngineResult<Order> {
        let sym = Self::binance_symbol(symbol);
        let params = vec![("symbol".to_string(), sym), ("orderId".to_string(), id.to_string())];
        let body = self.get_signed("/fapi/v1/order", params).await?;
        Ok(Self::order_from_json(&self.config.id, symbol, &body))
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> EngineResult<Vec<Order>> {
        let mut params = vec![];
        let sym_owned;
        if let Some(s) = symbol {
            sym_owned = Self::binance_symbol(s);
            params.push(("symbol".to_string(), sym_owned));
        }
        let body = self.get_signed("/fapi/v1/openOrders", params).await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|row| {
                let sym = row
                    .get("symbol")
                    .and_then(|s| s.as_str())
                    .unwrap_or(symbol.unwrap_or(""))
                    .to_string();
                Self::order_from_json(&self.config.id, &sym, &row)
            })
            .collect())
    }

    async fn fetch_status(&self) -> EngineResult<ExchangeStatus> {
        let url = format!("{}/fapi/v1/ping", self.rest_url);
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(ExchangeStatus {
                operational: true,
                message: None,
            }),
            Ok(resp) => Ok(ExchangeStatus {
                operational: false,
                message: Some(resp.status().to_string()),
            }),
            Err(e) => Err(EngineError::Transient(e.to_string())),
        }
    }
}
