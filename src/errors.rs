use thiserror::Error;

/// Semantic error taxonomy the engine branches on. Loops catch these at
/// their outermost level, log with context, and proceed to the next tick
/// — only startup config errors are allowed to abort the process.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient exchange error: {0}")]
    Transient(String),

    #[error("exchange rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("order execution failed for {symbol} (order {order_id:?}): {reason}")]
    OrderExecution {
        symbol: String,
        order_id: Option<String>,
        reason: String,
    },

    #[error("order cancellation failed for {symbol} (order {order_id}): {reason}")]
    CancellationFailed {
        symbol: String,
        order_id: String,
        reason: String,
    },

    #[error("exchange query failed: {0}")]
    QueryFailed(String),

    #[error("portfolio sync failed: {0}")]
    PortfolioSync(String),

    #[error("could not parse a structured decision from the model output: {0}")]
    DecisionParsing(String),

    #[error("LLM request exceeded its token budget or was rejected: {0}")]
    TokenLimit(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_) | EngineError::RateLimited(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
