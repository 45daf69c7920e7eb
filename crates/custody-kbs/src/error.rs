//! Error types for the custody broker

use custody_crypto::CryptoError;
use thiserror::Error;

use crate::protocol::ErrorKind;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Permission denied: {0}")]
    Denied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key store error: {0}")]
    KeyStoreLoad(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Error reported by the broker in a response
    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },
}

impl BrokerError {
    /// Wire classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Unreachable(_) | BrokerError::Transport(_) => ErrorKind::Unreachable,
            BrokerError::Denied(_) => ErrorKind::Denied,
            BrokerError::NotFound(_) => ErrorKind::NotFound,
            BrokerError::Crypto(CryptoError::KindMismatch { .. }) => ErrorKind::KindMismatch,
            BrokerError::Crypto(CryptoError::UnsupportedAlgorithm(_)) => {
                ErrorKind::UnsupportedAlgorithm
            }
            BrokerError::Crypto(CryptoError::AlgorithmFailure(_))
            | BrokerError::Crypto(CryptoError::InvalidKey(_)) => ErrorKind::AlgorithmFailure,
            BrokerError::Malformed(_) | BrokerError::Protocol(_) => ErrorKind::Malformed,
            BrokerError::Config(_) | BrokerError::KeyStoreLoad(_) => ErrorKind::AlgorithmFailure,
            BrokerError::Remote { kind, .. } => *kind,
        }
    }
}

impl From<bincode::Error> for BrokerError {
    fn from(err: bincode::Error) -> Self {
        BrokerError::Malformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
