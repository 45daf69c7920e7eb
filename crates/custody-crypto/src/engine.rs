//! Operation engine
//!
//! Stateless computation over a borrowed [`KeyMaterial`]. Nothing here keeps a
//! reference or a copy of the key past the call.

use aes_gcm::aead::generic_array::typenum::Unsigned;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use hmac::{Hmac, Mac};
use rsa::{Oaep, Pkcs1v15Sign};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::algorithm::{CipherAlgorithm, HashAlgorithm, OperationKind, Primitive, SignatureScheme};
use crate::errors::{CryptoError, Result};
use crate::material::{KeyMaterial, RsaKeyPair, SecretBytes};

/// AES-GCM authentication tag length
const GCM_TAG_LEN: usize = 16;

/// Result of [`OperationEngine::perform`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Bytes(Vec<u8>),
    Verified(bool),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OperationEngine;

impl OperationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Run `kind` with an already resolved primitive.
    ///
    /// `aux` carries the signature for `Verify` and is ignored otherwise.
    pub fn perform(
        &self,
        kind: OperationKind,
        primitive: Primitive,
        key: &KeyMaterial,
        payload: &[u8],
        aux: Option<&[u8]>,
    ) -> Result<Outcome> {
        match (kind, primitive) {
            (OperationKind::Encrypt, Primitive::Cipher(cipher)) => {
                self.encrypt(key, cipher, payload).map(Outcome::Bytes)
            }
            (OperationKind::Decrypt, Primitive::Cipher(cipher)) => {
                self.decrypt(key, cipher, payload).map(Outcome::Bytes)
            }
            (OperationKind::Hmac, Primitive::Mac(hash)) => {
                self.hmac(key, hash, payload).map(Outcome::Bytes)
            }
            (OperationKind::Sign, Primitive::Signature(scheme)) => {
                self.sign(key, scheme, payload).map(Outcome::Bytes)
            }
            (OperationKind::Verify, Primitive::Signature(scheme)) => {
                let signature = aux.unwrap_or_default();
                self.verify(key, scheme, signature, payload)
                    .map(Outcome::Verified)
            }
            (kind, primitive) => Err(CryptoError::UnsupportedAlgorithm(format!(
                "{:?} cannot run {:?}",
                kind, primitive
            ))),
        }
    }

    pub fn encrypt(&self, key: &KeyMaterial, cipher: CipherAlgorithm, plaintext: &[u8]) -> Result<Vec<u8>> {
        match (cipher, key) {
            (CipherAlgorithm::Default, KeyMaterial::Symmetric(secret)) => gcm_seal(secret, plaintext),
            (CipherAlgorithm::Default, KeyMaterial::Asymmetric(pair)) => {
                oaep_encrypt(pair, HashAlgorithm::Sha1, plaintext)
            }
            (CipherAlgorithm::RsaOaep(hash), key) => {
                oaep_encrypt(key.require_asymmetric()?, hash, plaintext)
            }
        }
    }

    pub fn decrypt(&self, key: &KeyMaterial, cipher: CipherAlgorithm, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match (cipher, key) {
            (CipherAlgorithm::Default, KeyMaterial::Symmetric(secret)) => gcm_open(secret, ciphertext),
            (CipherAlgorithm::Default, KeyMaterial::Asymmetric(pair)) => {
                oaep_decrypt(pair, HashAlgorithm::Sha1, ciphertext)
            }
            (CipherAlgorithm::RsaOaep(hash), key) => {
                oaep_decrypt(key.require_asymmetric()?, hash, ciphertext)
            }
        }
    }

    pub fn hmac(&self, key: &KeyMaterial, hash: HashAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
        let secret = key.require_symmetric()?.expose();
        match hash {
            HashAlgorithm::Sha1 => mac_tag::<Hmac<Sha1>>(secret, data),
            HashAlgorithm::Sha256 => mac_tag::<Hmac<Sha256>>(secret, data),
            HashAlgorithm::Sha512 => mac_tag::<Hmac<Sha512>>(secret, data),
        }
    }

    pub fn sign(&self, key: &KeyMaterial, scheme: SignatureScheme, data: &[u8]) -> Result<Vec<u8>> {
        let pair = key.require_asymmetric()?;
        let SignatureScheme::RsaPkcs1v15(hash) = scheme;
        let hashed = digest(hash, data);
        pair.private_key()
            .sign_with_rng(&mut rand::thread_rng(), pkcs1v15(hash), &hashed)
            .map_err(|e| CryptoError::AlgorithmFailure(format!("RSA signing: {}", e)))
    }

    /// `Ok(false)` for any signature that does not match, including
    /// malformed ones. Errors are reserved for a wrong key kind.
    pub fn verify(
        &self,
        key: &KeyMaterial,
        scheme: SignatureScheme,
        signature: &[u8],
        data: &[u8],
    ) -> Result<bool> {
        let pair = key.require_asymmetric()?;
        let SignatureScheme::RsaPkcs1v15(hash) = scheme;
        let hashed = digest(hash, data);
        Ok(pair
            .public_key()
            .verify(pkcs1v15(hash), &hashed, signature)
            .is_ok())
    }
}

fn digest(hash: HashAlgorithm, data: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(match hash {
        HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    })
}

fn pkcs1v15(hash: HashAlgorithm) -> Pkcs1v15Sign {
    match hash {
        HashAlgorithm::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
        HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
        HashAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
    }
}

fn oaep(hash: HashAlgorithm) -> Oaep {
    match hash {
        HashAlgorithm::Sha1 => Oaep::new::<Sha1>(),
        HashAlgorithm::Sha256 => Oaep::new::<Sha256>(),
        HashAlgorithm::Sha512 => Oaep::new::<Sha512>(),
    }
}

fn oaep_encrypt(pair: &RsaKeyPair, hash: HashAlgorithm, plaintext: &[u8]) -> Result<Vec<u8>> {
    pair.public_key()
        .encrypt(&mut rand::thread_rng(), oaep(hash), plaintext)
        .map_err(|e| CryptoError::AlgorithmFailure(format!("RSA-OAEP encryption: {}", e)))
}

fn oaep_decrypt(pair: &RsaKeyPair, hash: HashAlgorithm, ciphertext: &[u8]) -> Result<Vec<u8>> {
    pair.private_key()
        .decrypt(oaep(hash), ciphertext)
        .map_err(|e| CryptoError::AlgorithmFailure(format!("RSA-OAEP decryption: {}", e)))
}

fn mac_tag<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::AlgorithmFailure(format!("HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn gcm_seal(secret: &SecretBytes, plaintext: &[u8]) -> Result<Vec<u8>> {
    match secret.len() {
        16 => seal::<Aes128Gcm>(secret.expose(), plaintext),
        32 => seal::<Aes256Gcm>(secret.expose(), plaintext),
        n => Err(bad_gcm_key(n)),
    }
}

fn gcm_open(secret: &SecretBytes, ciphertext: &[u8]) -> Result<Vec<u8>> {
    match secret.len() {
        16 => open::<Aes128Gcm>(secret.expose(), ciphertext),
        32 => open::<Aes256Gcm>(secret.expose(), ciphertext),
        n => Err(bad_gcm_key(n)),
    }
}

fn bad_gcm_key(len: usize) -> CryptoError {
    CryptoError::AlgorithmFailure(format!(
        "AES-GCM needs a 16 or 32 byte secret, key holds {} bytes",
        len
    ))
}

/// Output layout: nonce || ciphertext || tag
fn seal<C: Aead + AeadCore + KeyInit>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = C::new_from_slice(key)
        .map_err(|e| CryptoError::AlgorithmFailure(format!("AES-GCM key: {}", e)))?;
    let nonce = C::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::AlgorithmFailure("AES-GCM encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(nonce.len() + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open<C: Aead + AeadCore + KeyInit>(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let nonce_len = C::NonceSize::USIZE;
    if ciphertext.len() < nonce_len + GCM_TAG_LEN {
        return Err(CryptoError::AlgorithmFailure(format!(
            "ciphertext too short: {} bytes",
            ciphertext.len()
        )));
    }

    let cipher = C::new_from_slice(key)
        .map_err(|e| CryptoError::AlgorithmFailure(format!("AES-GCM key: {}", e)))?;
    let (nonce, body) = ciphertext.split_at(nonce_len);
    cipher
        .decrypt(GenericArray::from_slice(nonce), body)
        .map_err(|_| CryptoError::AlgorithmFailure("AES-GCM authentication failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::KeyKind;
    use once_cell::sync::Lazy;

    static RSA: Lazy<KeyMaterial> =
        Lazy::new(|| KeyMaterial::Asymmetric(RsaKeyPair::generate(1024).unwrap()));

    fn aes_key() -> KeyMaterial {
        KeyMaterial::symmetric((0u8..32).collect::<Vec<u8>>())
    }

    #[test]
    fn test_gcm_roundtrip() {
        let engine = OperationEngine::new();
        let key = aes_key();
        let ct = engine.encrypt(&key, CipherAlgorithm::Default, b"Hello World!").unwrap();
        assert_eq!(ct.len(), 12 + 12 + GCM_TAG_LEN);
        let pt = engine.decrypt(&key, CipherAlgorithm::Default, &ct).unwrap();
        assert_eq!(pt, b"Hello World!");
    }

    #[test]
    fn test_gcm_128() {
        let engine = OperationEngine::new();
        let key = KeyMaterial::symmetric(vec![7u8; 16]);
        let ct = engine.encrypt(&key, CipherAlgorithm::Default, b"short key").unwrap();
        assert_eq!(engine.decrypt(&key, CipherAlgorithm::Default, &ct).unwrap(), b"short key");
    }

    #[test]
    fn test_gcm_nonce_is_fresh() {
        let engine = OperationEngine::new();
        let key = aes_key();
        let a = engine.encrypt(&key, CipherAlgorithm::Default, b"same").unwrap();
        let b = engine.encrypt(&key, CipherAlgorithm::Default, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_gcm_rejects_tampering() {
        let engine = OperationEngine::new();
        let key = aes_key();
        let mut ct = engine.encrypt(&key, CipherAlgorithm::Default, b"payload").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        let err = engine.decrypt(&key, CipherAlgorithm::Default, &ct).unwrap_err();
        assert!(matches!(err, CryptoError::AlgorithmFailure(_)));

        let err = engine.decrypt(&key, CipherAlgorithm::Default, &[0u8; 5]).unwrap_err();
        assert!(matches!(err, CryptoError::AlgorithmFailure(_)));
    }

    #[test]
    fn test_gcm_bad_key_length() {
        let engine = OperationEngine::new();
        let key = KeyMaterial::symmetric(vec![1u8; 20]);
        let err = engine.encrypt(&key, CipherAlgorithm::Default, b"x").unwrap_err();
        assert!(matches!(err, CryptoError::AlgorithmFailure(_)));
    }

    #[test]
    fn test_hmac_sizes() {
        let engine = OperationEngine::new();
        let key = aes_key();
        for hash in [HashAlgorithm::Sha1, HashAlgorithm::Sha256, HashAlgorithm::Sha512] {
            let tag = engine.hmac(&key, hash, b"Hello World!").unwrap();
            assert_eq!(tag.len(), hash.output_len());
        }
    }

    #[test]
    fn test_hmac_rfc2202_vector() {
        // RFC 2202 test case 2
        let engine = OperationEngine::new();
        let key = KeyMaterial::symmetric(b"Jefe".to_vec());
        let tag = engine
            .hmac(&key, HashAlgorithm::Sha1, b"what do ya want for nothing?")
            .unwrap();
        let expected: [u8; 20] = [
            0xef, 0xfc, 0xdf, 0x6a, 0xe5, 0xeb, 0x2f, 0xa2, 0xd2, 0x74, 0x16, 0xd5, 0xf1, 0x84,
            0xdf, 0x9c, 0x25, 0x9a, 0x7c, 0x79,
        ];
        assert_eq!(tag, expected);
    }

    #[test]
    fn test_kind_mismatch() {
        let engine = OperationEngine::new();
        let err = engine.hmac(&RSA, HashAlgorithm::Sha1, b"data").unwrap_err();
        assert!(matches!(
            err,
            CryptoError::KindMismatch { expected: KeyKind::Symmetric, actual: KeyKind::Asymmetric }
        ));

        let scheme = SignatureScheme::RsaPkcs1v15(HashAlgorithm::Sha256);
        let err = engine.sign(&aes_key(), scheme, b"data").unwrap_err();
        assert!(matches!(err, CryptoError::KindMismatch { .. }));

        let err = engine
            .encrypt(&aes_key(), CipherAlgorithm::RsaOaep(HashAlgorithm::Sha256), b"data")
            .unwrap_err();
        assert!(matches!(err, CryptoError::KindMismatch { .. }));
    }

    #[test]
    fn test_rsa_oaep_roundtrip() {
        let engine = OperationEngine::new();
        for cipher in [
            CipherAlgorithm::Default,
            CipherAlgorithm::RsaOaep(HashAlgorithm::Sha256),
        ] {
            let ct = engine.encrypt(&RSA, cipher, b"Hello World!").unwrap();
            assert_eq!(ct.len(), 128);
            assert_eq!(engine.decrypt(&RSA, cipher, &ct).unwrap(), b"Hello World!");
        }
    }

    #[test]
    fn test_rsa_oaep_oversize_input() {
        let engine = OperationEngine::new();
        let err = engine.encrypt(&RSA, CipherAlgorithm::Default, &[0u8; 200]).unwrap_err();
        assert!(matches!(err, CryptoError::AlgorithmFailure(_)));
    }

    #[test]
    fn test_sign_verify_and_bit_flips() {
        let engine = OperationEngine::new();
        let scheme = SignatureScheme::RsaPkcs1v15(HashAlgorithm::Sha256);
        let data = b"sign me".to_vec();
        let sig = engine.sign(&RSA, scheme, &data).unwrap();
        assert!(engine.verify(&RSA, scheme, &sig, &data).unwrap());

        let mut bad_sig = sig.clone();
        bad_sig[10] ^= 0x80;
        assert!(!engine.verify(&RSA, scheme, &bad_sig, &data).unwrap());

        let mut bad_data = data.clone();
        bad_data[0] ^= 0x01;
        assert!(!engine.verify(&RSA, scheme, &sig, &bad_data).unwrap());

        // Wrong length is a mismatch, not an error
        assert!(!engine.verify(&RSA, scheme, &sig[..20], &data).unwrap());

        let other = SignatureScheme::RsaPkcs1v15(HashAlgorithm::Sha512);
        assert!(!engine.verify(&RSA, other, &sig, &data).unwrap());
    }

    #[test]
    fn test_aes_round_keys_zeroize_on_drop() {
        fn assert_zeroize_on_drop<T: zeroize::ZeroizeOnDrop>() {}
        assert_zeroize_on_drop::<aes::Aes128>();
        assert_zeroize_on_drop::<aes::Aes256>();
    }

    #[test]
    fn test_perform_dispatch() {
        let engine = OperationEngine::new();
        let key = aes_key();
        let out = engine
            .perform(OperationKind::Hmac, Primitive::Mac(HashAlgorithm::Sha1), &key, b"d", None)
            .unwrap();
        assert!(matches!(out, Outcome::Bytes(tag) if tag.len() == 20));

        let err = engine
            .perform(OperationKind::Hmac, Primitive::Cipher(CipherAlgorithm::Default), &key, b"d", None)
            .unwrap_err();
        assert!(matches!(err, CryptoError::UnsupportedAlgorithm(_)));
    }
}
