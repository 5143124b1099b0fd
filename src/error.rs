use thiserror::Error;

/// Main error type for the trading bot
#[derive(Error, Debug)]
pub enum CyclerError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Exchange API error ({exchange}): {message}")]
    ExchangeApi { exchange: String, message: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Record not found: {collection} id {id}")]
    RecordNotFound { collection: String, id: u64 },

    // Order errors
    #[error("Order submission failed: {0}")]
    OrderSubmission(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order cancel failed: {0}")]
    OrderCancel(String),

    #[error("Insufficient balance: need {needed} {asset}, have {available}")]
    InsufficientBalance {
        asset: String,
        needed: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Symbol rules violation: {0}")]
    SymbolRules(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    // Scheduler errors
    #[error("Task error: {0}")]
    Task(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for CyclerError
pub type Result<T> = std::result::Result<T, CyclerError>;

impl CyclerError {
    /// Whether this error is worth retrying on the next scheduled pass.
    ///
    /// Transient network and rate-limit failures are; validation,
    /// auth and state errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            CyclerError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            CyclerError::RateLimited(_) | CyclerError::MarketDataUnavailable(_) => true,
            CyclerError::ExchangeApi { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CyclerError::RateLimited("429".into()).is_transient());
        assert!(CyclerError::ExchangeApi {
            exchange: "kraken".into(),
            message: "EService:Unavailable".into()
        }
        .is_transient());
        assert!(!CyclerError::Validation("bad".into()).is_transient());
        assert!(!CyclerError::Auth("key".into()).is_transient());
    }
}
