//! Key material held by the broker

use std::fmt;

use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::errors::{CryptoError, Result};

/// Kind of key a set holds. Every version of a set shares one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Symmetric,
    Asymmetric,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Symmetric => write!(f, "symmetric"),
            KeyKind::Asymmetric => write!(f, "asymmetric"),
        }
    }
}

/// Opaque symmetric secret, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {}])", self.0.len())
    }
}

/// RSA key pair. The private half zeroizes itself on drop.
#[derive(Clone)]
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeyPair {
    pub fn from_private_key(private: RsaPrivateKey) -> Result<Self> {
        private
            .validate()
            .map_err(|e| CryptoError::InvalidKey(format!("RSA key failed validation: {}", e)))?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Parse a PKCS#1 DER private key; the public half is derived from it.
    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs1_der(der)
            .map_err(|e| CryptoError::InvalidKey(format!("bad PKCS#1 private key: {}", e)))?;
        Self::from_private_key(private)
    }

    /// Fresh key pair. Provisioning lives outside the broker; this is for
    /// tooling and tests.
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| CryptoError::AlgorithmFailure(format!("RSA key generation: {}", e)))?;
        Self::from_private_key(private)
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Modulus size in bytes
    pub fn size(&self) -> usize {
        self.public.size()
    }

    pub fn public_der(&self) -> Result<Vec<u8>> {
        self.public
            .to_pkcs1_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::InvalidKey(format!("encoding public key: {}", e)))
    }

    pub fn private_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        let doc = self
            .private
            .to_pkcs1_der()
            .map_err(|e| CryptoError::InvalidKey(format!("encoding private key: {}", e)))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("bits", &(self.size() * 8))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Material of a single key version
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    Symmetric(SecretBytes),
    Asymmetric(RsaKeyPair),
}

impl KeyMaterial {
    pub fn symmetric(bytes: impl Into<Vec<u8>>) -> Self {
        KeyMaterial::Symmetric(SecretBytes::new(bytes.into()))
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            KeyMaterial::Symmetric(_) => KeyKind::Symmetric,
            KeyMaterial::Asymmetric(_) => KeyKind::Asymmetric,
        }
    }

    pub(crate) fn require_symmetric(&self) -> Result<&SecretBytes> {
        match self {
            KeyMaterial::Symmetric(secret) => Ok(secret),
            KeyMaterial::Asymmetric(_) => Err(CryptoError::KindMismatch {
                expected: KeyKind::Symmetric,
                actual: KeyKind::Asymmetric,
            }),
        }
    }

    pub(crate) fn require_asymmetric(&self) -> Result<&RsaKeyPair> {
        match self {
            KeyMaterial::Asymmetric(pair) => Ok(pair),
            KeyMaterial::Symmetric(_) => Err(CryptoError::KindMismatch {
                expected: KeyKind::Asymmetric,
                actual: KeyKind::Symmetric,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SecretBytes::new(b"super secret".to_vec());
        let printed = format!("{:?}", secret);
        assert!(!printed.contains("super"));
        assert!(printed.contains("12"));
    }

    #[test]
    fn test_pkcs1_roundtrip() {
        let pair = RsaKeyPair::generate(1024).unwrap();
        let der = pair.private_der().unwrap();
        let parsed = RsaKeyPair::from_pkcs1_der(&der).unwrap();
        assert_eq!(parsed.public_der().unwrap(), pair.public_der().unwrap());
        assert_eq!(parsed.size(), 128);
    }

    #[test]
    fn test_garbage_der_rejected() {
        let err = RsaKeyPair::from_pkcs1_der(b"not a key").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKey(_)));
    }

    #[test]
    fn test_kind() {
        assert_eq!(KeyMaterial::symmetric(vec![0u8; 32]).kind(), KeyKind::Symmetric);
    }
}
