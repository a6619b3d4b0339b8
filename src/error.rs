use crate::domain::order::OrderId;
use std::fmt;
use thiserror::Error;

/// Error envelope returned by the payment provider.
///
/// `code` carries the HTTP status when the provider answered; transport
/// failures (timeouts, refused connections) leave it unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub code: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Validation failures (`400`) are never retried automatically.
    pub fn is_hard(&self) -> bool {
        self.code == Some(400)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

#[derive(Error, Debug)]
pub enum ReconError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Version conflict while saving order {0}")]
    Conflict(OrderId),
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Checkout error: {0}")]
    Checkout(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("Reconciliation worker is no longer running")]
    ChannelClosed,
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, ReconError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_bad_request_is_hard() {
        assert!(ProviderError::new(Some(400), "bad token").is_hard());
        assert!(!ProviderError::new(Some(500), "boom").is_hard());
        assert!(!ProviderError::new(Some(429), "slow down").is_hard());
        assert!(!ProviderError::new(None, "connection reset").is_hard());
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::new(Some(404), "payment not found");
        assert_eq!(err.to_string(), "[404] payment not found");
        let err = ProviderError::new(None, "timeout");
        assert_eq!(err.to_string(), "timeout");
    }
}
