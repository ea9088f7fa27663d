use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub data: DataSourceConfig,
    pub cadence: CadenceConfig,
    pub risk: RiskConfig,
    pub ai: AiConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
    pub enable_trading: bool,
    pub initial_capital: rust_decimal::Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub id: String,
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    pub futures: bool,
    pub rest_url: String,
    pub ws_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub exchange: String,
    pub symbols: Vec<String>,
    pub collection_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    pub strategist_interval_secs: u64,
    pub trader_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub portfolio_sync_interval_secs: u64,
    pub portfolio_debounce_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_position_size: f64,
    pub max_daily_loss: f64,
    pub max_drawdown: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_leverage_mainstream: u32,
    pub max_leverage_altcoin: u32,
    pub high_leverage_warning: u32,
    pub circuit_breaker_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    Deepseek,
    Qwen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    Conservative,
    Balanced,
    Aggressive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub provider: AiProvider,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub prompt_style: PromptStyle,
    pub strategist_timeout_secs: u64,
    pub trader_timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the embedded SQLite database file (spec §6 relational store).
    pub database_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub alert_on_trade: bool,
    pub alert_on_error: bool,
    pub alert_on_drawdown: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            id: "binance".into(),
            api_key: String::new(),
            api_secret: String::new(),
            testnet: true,
            futures: true,
            rest_url: "https://fapi.binance.com".into(),
            ws_url: "wss://fstream.binance.com".into(),
        }
    }
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            exchange: "binance".into(),
            symbols: vec![
                "BTC/USDT:USDT".into(),
                "ETH/USDT:USDT".into(),
                "SOL/USDT:USDT".into(),
            ],
            collection_interval_secs: 60,
        }
    }
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            strategist_interval_secs: 3_600,
            trader_interval_secs: 180,
            sync_interval_secs: 10,
            portfolio_sync_interval_secs: 300,
            portfolio_debounce_secs: 2,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: 0.2,
            max_daily_loss: 0.05,
            max_drawdown: 0.3,
            stop_loss_pct: 5.0,
            take_profit_pct: 10.0,
            max_leverage_mainstream: 50,
            max_leverage_altcoin: 20,
            high_leverage_warning: 25,
            circuit_breaker_threshold: 0.3,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: AiProvider::Deepseek,
            api_key: String::new(),
            base_url: "https://api.deepseek.com/v1".into(),
            model: "deepseek-chat".into(),
            prompt_style: PromptStyle::Balanced,
            strategist_timeout_secs: 120,
            trader_timeout_secs: 60,
            max_retries: 2,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "data/trading_engine.db".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            data: DataSourceConfig::default(),
            cadence: CadenceConfig::default(),
            risk: RiskConfig::default(),
            ai: AiConfig::default(),
            storage: StorageConfig::default(),
            telemetry: TelemetryConfig {
                log_level: "info".into(),
                telegram_bot_token: None,
                telegram_chat_id: None,
                discord_webhook_url: None,
                alert_on_trade: false,
                alert_on_error: true,
                alert_on_drawdown: true,
            },
            enable_trading: false,
            initial_capital: rust_decimal::Decimal::from(10_000),
        }
    }
}

impl Config {
    /// Load configuration from environment variables (`.env` file honored)
    /// with conservative defaults for anything unset.
    ///
    /// Key env vars: `BINANCE_API_KEY`/`BINANCE_API_SECRET`,
    /// `BINANCE_TESTNET`, `BINANCE_FUTURES`, `DATA_SOURCE_SYMBOLS`,
    /// `STRATEGIST_INTERVAL`, `TRADER_INTERVAL`, `SYNC_INTERVAL_SECONDS`,
    /// `ENABLE_TRADING`, `MAX_POSITION_SIZE`, `MAX_DAILY_LOSS`,
    /// `MAX_DRAWDOWN`, `STOP_LOSS_PERCENTAGE`, `TAKE_PROFIT_PERCENTAGE`,
    /// `MAX_LEVERAGE_MAINSTREAM`, `MAX_LEVERAGE_ALTCOIN`,
    /// `HIGH_LEVERAGE_WARNING`, `AI_PROVIDER` (+ per-provider key/base/model),
    /// `PROMPT_STYLE`, `INITIAL_CAPITAL`, `DATABASE_URL`, `RUST_LOG`,
    /// `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID`, `DISCORD_WEBHOOK_URL`,
    /// `ALERT_ON_TRADE`.
    pub fn load_or_default() -> Self {
        let _ = dotenv::dotenv();
        let mut config = Self::default();

        if let Ok(key) = std::env::var("BINANCE_API_KEY") {
            if !key.is_empty() && key != "your_api_key_here" {
                config.exchange.api_key = key;
            }
        }
        if let Ok(secret) = std::env::var("BINANCE_API_SECRET") {
            if !secret.is_empty() && secret != "your_api_secret_here" {
                config.exchange.api_secret = secret;
            }
        }
        if let Ok(v) = std::env::var("BINANCE_TESTNET") {
            config.exchange.testnet = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("BINANCE_FUTURES") {
            config.exchange.futures = v == "true" || v == "1";
        }

        if let Ok(symbols) = std::env::var("DATA_SOURCE_SYMBOLS") {
            let parsed: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.data.symbols = parsed;
            }
        }
        if let Ok(v) = std::env::var("DATA_COLLECTION_INTERVAL") {
            if let Ok(secs) = v.parse() {
                config.data.collection_interval_secs = secs;
            }
        }

        if let Ok(v) = std::env::var("STRATEGIST_INTERVAL") {
            if let Ok(secs) = v.parse() {
                config.cadence.strategist_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("TRADER_INTERVAL") {
            if let Ok(secs) = v.parse() {
                config.cadence.trader_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SYNC_INTERVAL_SECONDS") {
            if let Ok(secs) = v.parse() {
                config.cadence.sync_interval_secs = secs;
            }
        }

        if let Ok(v) = std::env::var("ENABLE_TRADING") {
            config.enable_trading = v == "true" || v == "1";
        }

        if let Ok(v) = std::env::var("MAX_POSITION_SIZE") {
            if let Ok(f) = v.parse() {
                config.risk.max_position_size = f;
            }
        }
        if let Ok(v) = std::env::var("MAX_DAILY_LOSS") {
            if let Ok(f) = v.parse() {
                config.risk.max_daily_loss = f;
            }
        }
        if let Ok(v) = std::env::var("MAX_DRAWDOWN") {
            if let Ok(f) = v.parse() {
                config.risk.max_drawdown = f;
            }
        }
        if let Ok(v) = std::env::var("STOP_LOSS_PERCENTAGE") {
            if let Ok(f) = v.parse() {
                config.risk.stop_loss_pct = f;
            }
        }
        if let Ok(v) = std::env::var("TAKE_PROFIT_PERCENTAGE") {
            if let Ok(f) = v.parse() {
                config.risk.take_profit_pct = f;
            }
        }
        if let Ok(v) = std::env::var("MAX_LEVERAGE_MAINSTREAM") {
            if let Ok(n) = v.parse() {
                config.risk.max_leverage_mainstream = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_LEVERAGE_ALTCOIN") {
            if let Ok(n) = v.parse() {
                config.risk.max_leverage_altcoin = n;
            }
        }
        if let Ok(v) = std::env::var("HIGH_LEVERAGE_WARNING") {
            if let Ok(n) = v.parse() {
                config.risk.high_leverage_warning = n;
            }
        }

        if let Ok(v) = std::env::var("AI_PROVIDER") {
            match v.to_lowercase().as_str() {
                "qwen" => {
                    config.ai.provider = AiProvider::Qwen;
                    config.ai.base_url = "https://dashscope.aliyuncs.com/compatible-mode/v1".into();
                    config.ai.model = "qwen-plus".into();
                }
                "deepseek" => config.ai.provider = AiProvider::Deepseek,
                other => tracing::warn!(provider = other, "unknown AI_PROVIDER, using default"),
            }
        }
        if let Ok(v) = std::env::var("AI_API_KEY") {
            if !v.is_empty() {
                config.ai.api_key = v;
            }
        }
        if let Ok(v) = std::env::var("AI_BASE_URL") {
            if !v.is_empty() {
                config.ai.base_url = v;
            }
        }
        if let Ok(v) = std::env::var("AI_MODEL") {
            if !v.is_empty() {
                config.ai.model = v;
            }
        }
        if let Ok(v) = std::env::var("PROMPT_STYLE") {
            config.ai.prompt_style = match v.to_lowercase().as_str() {
                "aggressive" => PromptStyle::Aggressive,
                "conservative" => PromptStyle::Conservative,
                _ => PromptStyle::Balanced,
            };
        }

        if let Ok(v) = std::env::var("INITIAL_CAPITAL") {
            if let Ok(d) = v.parse() {
                config.initial_capital = d;
            }
        }

        if let Ok(v) = std::env::var("DATABASE_URL") {
            if !v.is_empty() {
                config.storage.database_url = v;
            }
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            config.telemetry.log_level = level;
        }
        if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !v.is_empty() {
                config.telemetry.telegram_bot_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("TELEGRAM_CHAT_ID") {
            if !v.is_empty() {
                config.telemetry.telegram_chat_id = Some(v);
            }
        }
        if let Ok(v) = std::env::var("DISCORD_WEBHOOK_URL") {
            if !v.is_empty() {
                config.telemetry.discord_webhook_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("ALERT_ON_TRADE") {
            config.telemetry.alert_on_trade = v == "true" || v == "1";
        }

        if !config.enable_trading {
            tracing::warn!("ENABLE_TRADING is not set — running in paper mode, no real orders will be placed");
        }

        config
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enable_trading {
            anyhow::ensure!(
                !self.exchange.api_key.is_empty() && !self.exchange.api_secret.is_empty(),
                "BINANCE_API_KEY and BINANCE_API_SECRET must be set when ENABLE_TRADING=true"
            );
        }
        anyhow::ensure!(
            self.risk.max_position_size > 0.0 && self.risk.max_position_size <= 1.0,
            "max_position_size must be between 0 and 1"
        );
        anyhow::ensure!(
            self.risk.max_daily_loss > 0.0 && self.risk.max_daily_loss <= 1.0,
            "max_daily_loss must be between 0 and 1"
        );
        anyhow::ensure!(
            self.risk.max_leverage_mainstream >= 1 && self.risk.max_leverage_altcoin >= 1,
            "leverage caps must be at least 1"
        );
        anyhow::ensure!(!self.data.symbols.is_empty(), "at least one symbol must be configured");
        anyhow::ensure!(
            self.cadence.trader_interval_secs > 0 && self.cadence.strategist_interval_secs > 0,
            "cadence intervals must be positive"
        );
        Ok(())
    }
}
