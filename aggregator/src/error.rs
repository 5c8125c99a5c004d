//! Aggregator error types.

use swaprail_common::{NetworkPair, SwapRailError};
use thiserror::Error;

/// Errors returned by a single exchange adapter.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The exchange answered with an error or could not be reached.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The call did not finish in time.
    #[error("Provider timed out: {0}")]
    Timeout(String),

    /// The adapter does not implement this operation.
    #[error("Operation not supported by {0}")]
    Unsupported(String),
}

/// Result type for adapter calls.
pub type FetchResult<T> = Result<T, FetchError>;

/// Errors that can occur in the aggregation engine.
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// Every exchange failed, timed out or declined the pair.
    #[error("No quotes available for {from} -> {to}")]
    NoQuotes { from: NetworkPair, to: NetworkPair },

    /// No adapter registered under that name.
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// A single-exchange call failed.
    #[error("Exchange {exchange} failed: {source}")]
    Provider {
        exchange: String,
        #[source]
        source: FetchError,
    },
}

/// Result type for engine operations.
pub type AggregatorResult<T> = Result<T, AggregatorError>;

impl From<AggregatorError> for SwapRailError {
    fn from(err: AggregatorError) -> Self {
        match err {
            AggregatorError::NoQuotes { from, to } => SwapRailError::NoQuotes { from, to },
            AggregatorError::ExchangeNotFound(name) => SwapRailError::ExchangeNotFound(name),
            AggregatorError::Provider { exchange, source } => {
                SwapRailError::Provider(format!("{}: {}", exchange, source))
            }
        }
    }
}
