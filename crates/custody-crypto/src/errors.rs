//! Error types for custody primitives

use thiserror::Error;

use crate::material::KeyKind;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key kind mismatch: operation requires {expected} key, set holds {actual} key")]
    KindMismatch { expected: KeyKind, actual: KeyKind },

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Algorithm failure: {0}")]
    AlgorithmFailure(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
