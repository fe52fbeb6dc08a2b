//! Error types for Holdchain

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ChainError {
    InvalidSignature(String),
    InsufficientFunds { needed: f64, available: f64 },
    ItemAlreadyHeld(String),
    ItemNotHeld(String),
    DuplicateTransaction(String),
    CoinbaseNotAllowed,
    InvalidTransaction(String),
    InvalidBlock(String),
    StaleTemplate,
    ChainRejected(String),
    CryptoError(String),
    SerializationError(String),
    DatabaseError(String),
    IoError(String),
    NetworkError(String),
    ConfigError(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::InvalidSignature(msg) => write!(f, "Invalid signature: {}", msg),
            ChainError::InsufficientFunds { needed, available } => write!(
                f,
                "Insufficient credits: need {:.2}, have {:.2}",
                needed, available
            ),
            ChainError::ItemAlreadyHeld(uid) => write!(f, "Item {} is already held", uid),
            ChainError::ItemNotHeld(uid) => write!(f, "Item {} is not held by the requester", uid),
            ChainError::DuplicateTransaction(msg) => write!(f, "Duplicate pending transaction: {}", msg),
            ChainError::CoinbaseNotAllowed => write!(f, "Coinbase transactions are minted by mining only"),
            ChainError::InvalidTransaction(msg) => write!(f, "Invalid transaction: {}", msg),
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {}", msg),
            ChainError::StaleTemplate => write!(f, "Block template is stale: chain tip moved"),
            ChainError::ChainRejected(msg) => write!(f, "Kept current chain: {}", msg),
            ChainError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            ChainError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            ChainError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
            ChainError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ChainError::ConfigError(msg) => write!(f, "Config error: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

impl From<crate::network::NetworkError> for ChainError {
    fn from(err: crate::network::NetworkError) -> Self {
        ChainError::NetworkError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_message_names_both_amounts() {
        let err = ChainError::InsufficientFunds {
            needed: 10.0,
            available: 3.5,
        };
        assert_eq!(err.to_string(), "Insufficient credits: need 10.00, have 3.50");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ChainError = io.into();
        assert!(matches!(err, ChainError::IoError(_)));
    }
}
