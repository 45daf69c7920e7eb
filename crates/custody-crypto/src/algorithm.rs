//! Algorithm identifiers and the registry that binds them to primitives
//!
//! `AlgorithmId` ordinals travel on the wire. They are append-only: a new
//! algorithm takes the next free ordinal, and an existing ordinal is never
//! reassigned or removed, since deployed clients send raw integers.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{CryptoError, Result};

/// Wire-stable algorithm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum AlgorithmId {
    /// Per-operation default, see [`AlgorithmRegistry`]
    Default = 0,
    Sha1 = 1,
    Sha256 = 2,
    Sha512 = 3,
}

impl AlgorithmId {
    /// Every registered id, in ordinal order.
    pub const ALL: [AlgorithmId; 4] = [
        AlgorithmId::Default,
        AlgorithmId::Sha1,
        AlgorithmId::Sha256,
        AlgorithmId::Sha512,
    ];

    pub fn ordinal(self) -> u32 {
        self as u32
    }

    /// The hash this id names, `None` for `Default`.
    pub fn hash(self) -> Option<HashAlgorithm> {
        match self {
            AlgorithmId::Default => None,
            AlgorithmId::Sha1 => Some(HashAlgorithm::Sha1),
            AlgorithmId::Sha256 => Some(HashAlgorithm::Sha256),
            AlgorithmId::Sha512 => Some(HashAlgorithm::Sha512),
        }
    }
}

impl TryFrom<u32> for AlgorithmId {
    type Error = CryptoError;

    fn try_from(ordinal: u32) -> Result<Self> {
        AlgorithmId::ALL
            .into_iter()
            .find(|id| id.ordinal() == ordinal)
            .ok_or_else(|| {
                CryptoError::UnsupportedAlgorithm(format!("unknown algorithm ordinal {}", ordinal))
            })
    }
}

impl FromStr for AlgorithmId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "default" => Ok(AlgorithmId::Default),
            "sha1" => Ok(AlgorithmId::Sha1),
            "sha256" => Ok(AlgorithmId::Sha256),
            "sha512" => Ok(AlgorithmId::Sha512),
            other => Err(CryptoError::UnsupportedAlgorithm(format!(
                "unknown algorithm name {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmId::Default => write!(f, "default"),
            AlgorithmId::Sha1 => write!(f, "sha1"),
            AlgorithmId::Sha256 => write!(f, "sha256"),
            AlgorithmId::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Operations the engine performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Encrypt,
    Decrypt,
    Hmac,
    Sign,
    Verify,
}

/// Digest functions backing MAC, signature and OAEP primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Digest (and HMAC tag) size in bytes
    pub fn output_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }
}

/// Confidentiality primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    /// AES-GCM on symmetric sets (key length selects AES-128 or AES-256,
    /// random 96-bit nonce prepended to the output); RSA-OAEP with SHA-1
    /// on asymmetric sets.
    Default,
    /// RSA-OAEP with an explicit digest. Asymmetric sets only.
    RsaOaep(HashAlgorithm),
}

/// Signature primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureScheme {
    /// RSASSA-PKCS1-v1_5
    RsaPkcs1v15(HashAlgorithm),
}

/// A concrete primitive, ready for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Cipher(CipherAlgorithm),
    Mac(HashAlgorithm),
    Signature(SignatureScheme),
}

/// Hash used for HMAC when the caller omits an algorithm.
pub const DEFAULT_HMAC_HASH: HashAlgorithm = HashAlgorithm::Sha1;

/// Hash used for RSA signatures when the caller omits an algorithm.
pub const DEFAULT_SIGNATURE_HASH: HashAlgorithm = HashAlgorithm::Sha256;

/// Maps wire ordinals to primitives. Immutable once built.
#[derive(Debug, Clone)]
pub struct AlgorithmRegistry {
    enabled: HashSet<AlgorithmId>,
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AlgorithmRegistry {
    /// Registry with every known algorithm enabled
    pub fn new() -> Self {
        Self {
            enabled: AlgorithmId::ALL.into_iter().collect(),
        }
    }

    /// Registry with the given ids disabled. `Default` always stays enabled.
    pub fn without(disabled: &[AlgorithmId]) -> Self {
        let mut registry = Self::new();
        for id in disabled {
            if *id != AlgorithmId::Default {
                registry.enabled.remove(id);
            }
        }
        registry
    }

    pub fn is_enabled(&self, id: AlgorithmId) -> bool {
        self.enabled.contains(&id)
    }

    /// Resolve an optional ordinal, treating `None` as `Default`.
    pub fn resolve_optional(&self, kind: OperationKind, ordinal: Option<u32>) -> Result<Primitive> {
        self.resolve(kind, ordinal.unwrap_or(AlgorithmId::Default.ordinal()))
    }

    pub fn resolve(&self, kind: OperationKind, ordinal: u32) -> Result<Primitive> {
        let id = AlgorithmId::try_from(ordinal)?;
        if !self.is_enabled(id) {
            return Err(CryptoError::UnsupportedAlgorithm(format!(
                "{} is disabled on this broker",
                id
            )));
        }

        let primitive = match (kind, id.hash()) {
            (OperationKind::Encrypt | OperationKind::Decrypt, None) => {
                Primitive::Cipher(CipherAlgorithm::Default)
            }
            (OperationKind::Encrypt | OperationKind::Decrypt, Some(hash)) => {
                Primitive::Cipher(CipherAlgorithm::RsaOaep(hash))
            }
            (OperationKind::Hmac, hash) => Primitive::Mac(hash.unwrap_or(DEFAULT_HMAC_HASH)),
            (OperationKind::Sign | OperationKind::Verify, hash) => Primitive::Signature(
                SignatureScheme::RsaPkcs1v15(hash.unwrap_or(DEFAULT_SIGNATURE_HASH)),
            ),
        };
        Ok(primitive)
    }
}
