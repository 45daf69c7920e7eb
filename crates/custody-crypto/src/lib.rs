//! # Custody Crypto
//!
//! Primitives behind the custody key broker:
//!
//! - [`AlgorithmRegistry`] maps wire ordinals to concrete primitives, with a
//!   per-operation default for ordinal `0`
//! - [`OperationEngine`] runs encrypt, decrypt, HMAC, sign and verify over a
//!   borrowed [`KeyMaterial`]
//! - [`KeyMaterial`] holds a symmetric secret or an RSA key pair and wipes
//!   itself on drop
//!
//! ## Defaults
//!
//! | Operation        | Symmetric set        | Asymmetric set          |
//! |------------------|----------------------|-------------------------|
//! | encrypt/decrypt  | AES-GCM (128 or 256) | RSA-OAEP, SHA-1         |
//! | hmac             | HMAC-SHA1            | -                       |
//! | sign/verify      | -                    | RSA PKCS#1 v1.5, SHA-256 |
//!
//! ## Example
//!
//! ```
//! use custody_crypto::{AlgorithmRegistry, KeyMaterial, OperationEngine, OperationKind, Outcome};
//!
//! let registry = AlgorithmRegistry::new();
//! let primitive = registry.resolve_optional(OperationKind::Hmac, None).unwrap();
//!
//! let key = KeyMaterial::symmetric(vec![0x42; 32]);
//! let outcome = OperationEngine::new()
//!     .perform(OperationKind::Hmac, primitive, &key, b"Hello World!", None)
//!     .unwrap();
//!
//! assert!(matches!(outcome, Outcome::Bytes(tag) if tag.len() == 20));
//! ```

pub mod algorithm;
pub mod engine;
pub mod errors;
pub mod material;

pub use algorithm::{
    AlgorithmId, AlgorithmRegistry, CipherAlgorithm, HashAlgorithm, OperationKind, Primitive,
    SignatureScheme, DEFAULT_HMAC_HASH, DEFAULT_SIGNATURE_HASH,
};
pub use engine::{OperationEngine, Outcome};
pub use errors::{CryptoError, Result};
pub use material::{KeyKind, KeyMaterial, RsaKeyPair, SecretBytes};
