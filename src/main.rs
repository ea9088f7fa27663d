#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crypto_trading_engine::cache::InMemoryCache;
use crypto_trading_engine::config::Config;
use crypto_trading_engine::decision::indicators::summarize;
use crypto_trading_engine::decision::{Coordinator, MarketEnvironment, SymbolSnapshot};
use crypto_trading_engine::exchange::binance::BinanceAdapter;
use crypto_trading_engine::exchange::ExchangeAdapter;
use crypto_trading_engine::execution::{ExpectedClosures, MarketSnapshot, TradingExecutor};
use crypto_trading_engine::llm::OpenAiCompatibleClient;
use crypto_trading_engine::models::kline::Timeframe;
use crypto_trading_engine::portfolio_manager::PortfolioManager;
use crypto_trading_engine::risk::{PortfolioRiskAction, RiskManager};
use crypto_trading_engine::store::SqliteStore;
use crypto_trading_engine::telemetry::{AlertManager, LatencyTracker};

use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Timeframes fed into the Strategist's BTC/ETH technical summaries.
const STRATEGIST_TIMEFRAMES: [Timeframe; 2] = [Timeframe::H1, Timeframe::H4];
const KLINE_LOOKBACK: u32 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("================================================");
    info!("  crypto-trading-engine — autonomous futures bot");
    info!("================================================");

    let config = Config::load_or_default();
    if let Err(e) = config.validate() {
        error!("config validation failed: {e}");
        return Err(e);
    }
    if !config.enable_trading {
        warn!("ENABLE_TRADING is false — running in paper mode, no live orders will be placed");
    }

    let exchange: Arc<dyn ExchangeAdapter> = Arc::new(BinanceAdapter::new(config.exchange.clone()));
    let llm = Arc::new(OpenAiCompatibleClient::new(config.ai.clone()));
    let cache: Arc<dyn crypto_trading_engine::cache::ShortTermCache> = Arc::new(InMemoryCache::new());
    let store: Arc<dyn crypto_trading_engine::store::RelationalStore> = Arc::new(SqliteStore::open(&config.storage.database_url)?);
    let risk = Arc::new(RiskManager::new(config.risk.clone()));
    let alerts = Arc::new(AlertManager::new(config.telemetry.clone()));
    let latency = Arc::new(LatencyTracker::new(1_000));

    let portfolio_mgr = Arc::new(PortfolioManager::new(
        exchange.clone(),
        config.exchange.id.clone(),
        !config.enable_trading,
        config.initial_capital,
        Duration::from_secs(config.cadence.portfolio_sync_interval_secs),
        Duration::from_secs(config.cadence.portfolio_debounce_secs),
    ));

    let expected_closures = Arc::new(ExpectedClosures::new());

    let executor = Arc::new(TradingExecutor::new(
        exchange.clone(),
        store.clone(),
        cache.clone(),
        portfolio_mgr.clone(),
        risk.clone(),
        expected_closures.clone(),
        !config.enable_trading,
    ));

    let account_sync = Arc::new(crypto_trading_engine::account_sync::AccountSyncService::new(
        exchange.clone(),
        store.clone(),
        expected_closures.clone(),
        config.exchange.id.clone(),
        Duration::from_secs(config.cadence.sync_interval_secs),
    ));

    let coordinator = Arc::new(Coordinator::new(
        llm,
        config.ai.clone(),
        store.clone(),
        config.exchange.id.clone(),
        config.cadence.strategist_interval_secs,
        config.cadence.trader_interval_secs,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Account Sync Service: reconciles exchange-reported positions on its
    // own cadence (spec §4.6), independent of the decision loop below.
    {
        let account_sync = account_sync.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { account_sync.run(shutdown_rx).await });
    }

    // Layered decision loop: ticks at the Trader's cadence, running the
    // Strategist whenever the Coordinator says a regime refresh is due.
    {
        let exchange = exchange.clone();
        let coordinator = coordinator.clone();
        let portfolio_mgr = portfolio_mgr.clone();
        let executor = executor.clone();
        let risk = risk.clone();
        let risk_config = config.risk.clone();
        let exchange_id = config.exchange.id.clone();
        let symbols = config.data.symbols.clone();
        let trader_interval = config.cadence.trader_interval_secs;
        let latency = latency.clone();
        let alerts = alerts.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(trader_interval.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _timer = latency.start_timer("decision_cycle");
                        if coordinator.should_run_strategist().await {
                            run_strategist_cycle(&exchange, &coordinator, &symbols).await;
                        }

                        let snapshots = fetch_symbol_snapshots(&exchange, &symbols).await;
                        if snapshots.is_empty() {
                            coordinator.advance_tick().await;
                            continue;
                        }

                        let portfolio = match portfolio_mgr.get_current_portfolio(false).await {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(error = %e, "could not read current portfolio, skipping trader cycle");
                                coordinator.advance_tick().await;
                                continue;
                            }
                        };

                        // Portfolio-wide circuit breaker (spec §4.7 check_portfolio_risk):
                        // once tripped, new entries are refused until the drawdown recovers;
                        // exits still go through so existing risk can be unwound.
                        let breaker_tripped = risk.check_portfolio_risk(&portfolio) == PortfolioRiskAction::CircuitBreaker;
                        if breaker_tripped {
                            warn!(exchange_id = %exchange_id, "portfolio circuit breaker tripped, new entries suspended this cycle");
                        }

                        match coordinator.run_trader_cycle(&snapshots, &portfolio, &risk_config, trader_interval).await {
                            Ok(signals) => {
                                for signal in &signals {
                                    if signal.signal_type == crypto_trading_engine::models::signal::SignalType::Hold {
                                        continue;
                                    }
                                    if breaker_tripped && signal.signal_type.is_entry() {
                                        info!(symbol = %signal.symbol, "entry signal skipped: circuit breaker active");
                                        continue;
                                    }
                                    let Some(snapshot) = snapshots.iter().find(|s| s.symbol == signal.symbol) else { continue };
                                    let market_snapshot = MarketSnapshot { price: snapshot.current_price };
                                    match executor.process_trading_signal(signal, market_snapshot, &portfolio).await {
                                        Ok(Some(_)) => alerts.on_trade(&format!("{:?} {}", signal.signal_type, signal.symbol)).await,
                                        Ok(None) => {}
                                        Err(e) => {
                                            error!(symbol = %signal.symbol, error = %e, "trading signal execution failed");
                                            alerts.on_error(&e.to_string()).await;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "trader cycle failed");
                                alerts.on_error(&e.to_string()).await;
                            }
                        }

                        coordinator.advance_tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("decision loop shutting down");
                        return;
                    }
                }
            }
        });
    }

    info!("all systems active: account sync, strategist/trader decision loop");
    info!("press Ctrl+C to shut down");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());
    latency.log_summary();
    info!("shutdown complete");
    Ok(())
}

/// Fetches the multi-timeframe BTC/ETH technicals the Strategist reasons
/// over and runs one strategist cycle. The macro/equities/sentiment/news
/// feeds spec §1 places out of scope are represented by a neutral
/// placeholder summary rather than fabricated content.
async fn run_strategist_cycle(exchange: &Arc<dyn ExchangeAdapter>, coordinator: &Coordinator, symbols: &[String]) {
    let btc_symbol = symbols.iter().find(|s| s.starts_with("BTC")).cloned().unwrap_or_else(|| "BTC/USDT:USDT".to_string());
    let eth_symbol = symbols.iter().find(|s| s.starts_with("ETH")).cloned().unwrap_or_else(|| "ETH/USDT:USDT".to_string());

    let btc = fetch_timeframe_summaries(exchange, &btc_symbol).await;
    let eth = fetch_timeframe_summaries(exchange, &eth_symbol).await;
    let completeness = (btc.len() + eth.len()) as f64 / (STRATEGIST_TIMEFRAMES.len() * 2) as f64;

    let env = MarketEnvironment {
        macro_summary: "macro data feed not wired (out of scope)".to_string(),
        equities_summary: "equities data feed not wired (out of scope)".to_string(),
        sentiment_summary: "sentiment feed not wired (out of scope)".to_string(),
        recent_news: Vec::new(),
        crypto_overview: serde_json::json!({}),
        data_completeness_ratio: completeness,
    };

    coordinator.run_strategist_cycle(&env, &btc, &eth).await;
}

async fn fetch_timeframe_summaries(
    exchange: &Arc<dyn ExchangeAdapter>,
    symbol: &str,
) -> Vec<crypto_trading_engine::decision::indicators::TimeframeSummary> {
    let mut summaries = Vec::new();
    for timeframe in STRATEGIST_TIMEFRAMES {
        match exchange.fetch_ohlcv(symbol, timeframe, None, Some(KLINE_LOOKBACK)).await {
            Ok(klines) => {
                if let Some(summary) = summarize(timeframe, &klines) {
                    summaries.push(summary);
                }
            }
            Err(e) => warn!(symbol, timeframe = timeframe.as_str(), error = %e, "failed to fetch klines for strategist"),
        }
    }
    summaries
}

async fn fetch_symbol_snapshots(exchange: &Arc<dyn ExchangeAdapter>, symbols: &[String]) -> Vec<SymbolSnapshot> {
    let mut snapshots = Vec::new();
    for symbol in symbols {
        let ticker = match exchange.fetch_ticker(symbol).await {
            Ok(t) => t,
            Err(e) => {
                warn!(symbol, error = %e, "failed to fetch ticker for trader cycle");
                continue;
            }
        };
        let klines = exchange
            .fetch_ohlcv(symbol, Timeframe::M15, None, Some(KLINE_LOOKBACK))
            .await
            .unwrap_or_else(|e| {
                warn!(symbol, error = %e, "failed to fetch klines for trader cycle");
                Vec::new()
            });
        snapshots.push(SymbolSnapshot {
            symbol: symbol.clone(),
            current_price: ticker.last,
            klines,
        });
    }
    snapshots
}
