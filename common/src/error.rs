//! Error types for SwapRail.

use crate::currency::NetworkPair;
use crate::swap::SwapStatus;
use thiserror::Error;

/// Broad classification used by callers to map errors onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller sent something invalid.
    Client,
    /// The requested thing does not exist or nothing could be offered.
    NotFound,
    /// Something went wrong on our side or with a collaborator.
    Internal,
}

/// Main error type for SwapRail operations.
#[derive(Error, Debug)]
pub enum SwapRailError {
    /// Invalid input.
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No exchange could quote the pair.
    #[error("No quotes available for {from} -> {to}")]
    NoQuotes { from: NetworkPair, to: NetworkPair },

    /// No fetcher registered under that name.
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Invalid state transition.
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: SwapStatus, to: SwapStatus },

    /// The exchange has not finished the swap yet.
    #[error("Swap {0} is still in progress")]
    SwapInProgress(String),

    /// External provider error.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Broker error.
    #[error("Messaging error: {0}")]
    Messaging(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapRailError {
    /// Shorthand for a validation error tied to a field.
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        SwapRailError::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SwapRailError::Validation { .. } | SwapRailError::InvalidTransition { .. } => {
                ErrorKind::Client
            }
            SwapRailError::NotFound(_)
            | SwapRailError::NoQuotes { .. }
            | SwapRailError::ExchangeNotFound(_) => ErrorKind::NotFound,
            SwapRailError::SwapInProgress(_)
            | SwapRailError::Provider(_)
            | SwapRailError::Database(_)
            | SwapRailError::Messaging(_)
            | SwapRailError::Configuration(_)
            | SwapRailError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapRailError::SwapInProgress(_)
                | SwapRailError::Provider(_)
                | SwapRailError::Database(_)
                | SwapRailError::Messaging(_)
        )
    }

    /// Get a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            SwapRailError::Validation { .. } => "VALIDATION_FAILED",
            SwapRailError::NotFound(_) => "NOT_FOUND",
            SwapRailError::NoQuotes { .. } => "NO_QUOTES",
            SwapRailError::ExchangeNotFound(_) => "EXCHANGE_NOT_FOUND",
            SwapRailError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SwapRailError::SwapInProgress(_) => "SWAP_IN_PROGRESS",
            SwapRailError::Provider(_) => "PROVIDER_ERROR",
            SwapRailError::Database(_) => "DATABASE_ERROR",
            SwapRailError::Messaging(_) => "MESSAGING_ERROR",
            SwapRailError::Configuration(_) => "CONFIGURATION_ERROR",
            SwapRailError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for SwapRail operations.
pub type SwapRailResult<T> = std::result::Result<T, SwapRailError>;
