//! Persisted key store document
//!
//! ```json
//! {
//!   "sets": [
//!     { "name": "org.example.sym", "kind": "symmetric",
//!       "versions": [ { "version": 1, "secret": "<base64>" } ] },
//!     { "name": "org.example.rsa", "kind": "asymmetric",
//!       "versions": [ { "version": 1, "private_key": "<base64 PKCS#1 DER>" } ] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use custody_crypto::{KeyKind, KeyMaterial, RsaKeyPair};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{BrokerError, Result};
use crate::keystore::memory::MemoryKeyStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyStoreDocument {
    pub sets: Vec<SetEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetEntry {
    pub name: String,
    pub kind: KeyKind,
    pub versions: Vec<VersionEntry>,
}

/// Base64 material for one version. Exactly one of the two fields is set,
/// matching the set's kind.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct VersionEntry {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl std::fmt::Debug for VersionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionEntry")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl VersionEntry {
    pub fn symmetric(version: u32, secret: &[u8]) -> Self {
        Self {
            version,
            secret: Some(BASE64.encode(secret)),
            private_key: None,
        }
    }

    pub fn asymmetric(version: u32, pair: &RsaKeyPair) -> Result<Self> {
        let der = pair.private_der()?;
        Ok(Self {
            version,
            secret: None,
            private_key: Some(BASE64.encode(der.as_slice())),
        })
    }

    fn material(&self, set: &SetEntry) -> Result<KeyMaterial> {
        let invalid = |what: &str| {
            BrokerError::KeyStoreLoad(format!("{} v{}: {}", set.name, self.version, what))
        };

        match (set.kind, &self.secret, &self.private_key) {
            (KeyKind::Symmetric, Some(secret), None) => {
                let bytes = BASE64
                    .decode(secret)
                    .map_err(|e| invalid(&format!("secret is not base64: {}", e)))?;
                Ok(KeyMaterial::symmetric(bytes))
            }
            (KeyKind::Asymmetric, None, Some(private_key)) => {
                let der = Zeroizing::new(
                    BASE64
                        .decode(private_key)
                        .map_err(|e| invalid(&format!("private_key is not base64: {}", e)))?,
                );
                let pair = RsaKeyPair::from_pkcs1_der(&der)
                    .map_err(|e| invalid(&e.to_string()))?;
                Ok(KeyMaterial::Asymmetric(pair))
            }
            (KeyKind::Symmetric, _, _) => Err(invalid("symmetric versions need exactly a secret")),
            (KeyKind::Asymmetric, _, _) => {
                Err(invalid("asymmetric versions need exactly a private_key"))
            }
        }
    }
}

impl KeyStoreDocument {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            BrokerError::KeyStoreLoad(format!("reading {}: {}", path.display(), e))
        })?);
        serde_json::from_str(&content)
            .map_err(|e| BrokerError::KeyStoreLoad(format!("parsing {}: {}", path.display(), e)))
    }

    /// Write the document with owner-only permissions
    pub fn save(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::io::Write;

        let content = Zeroizing::new(
            serde_json::to_string_pretty(self)
                .map_err(|e| BrokerError::KeyStoreLoad(format!("encoding key store: {}", e)))?,
        );
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for set in &self.sets {
            if set.name.trim().is_empty() {
                return Err(BrokerError::KeyStoreLoad("key set with an empty name".to_string()));
            }
            if !names.insert(set.name.as_str()) {
                return Err(BrokerError::KeyStoreLoad(format!(
                    "key set {} is defined twice",
                    set.name
                )));
            }

            let mut versions = HashSet::new();
            for entry in &set.versions {
                if entry.version == 0 {
                    return Err(BrokerError::KeyStoreLoad(format!(
                        "{}: versions start at 1",
                        set.name
                    )));
                }
                if !versions.insert(entry.version) {
                    return Err(BrokerError::KeyStoreLoad(format!(
                        "{} v{} is defined twice",
                        set.name, entry.version
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build a key store. Versions are published in ascending order.
    pub fn into_store(self) -> Result<MemoryKeyStore> {
        self.validate()?;

        let store = MemoryKeyStore::new();
        for set in &self.sets {
            let mut entries: Vec<&VersionEntry> = set.versions.iter().collect();
            entries.sort_by_key(|e| e.version);
            for entry in entries {
                store.publish_version(&set.name, entry.version, entry.material(set)?)?;
            }
        }
        Ok(store)
    }
}

/// Load the key store file at `path`
pub fn load_keystore(path: &Path) -> Result<MemoryKeyStore> {
    warn_if_exposed(path);
    let store = KeyStoreDocument::from_file(path)?.into_store()?;
    info!("Loaded {} key set(s) from {}", store.len(), path.display());
    Ok(store)
}

fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                "key store {} is accessible to group or others (mode {:o})",
                path.display(),
                mode & 0o777
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeyStore;
    use once_cell::sync::Lazy;

    static PAIR: Lazy<RsaKeyPair> = Lazy::new(|| RsaKeyPair::generate(1024).unwrap());

    fn document() -> KeyStoreDocument {
        KeyStoreDocument {
            sets: vec![
                SetEntry {
                    name: "org.example.sym".to_string(),
                    kind: KeyKind::Symmetric,
                    versions: vec![
                        VersionEntry::symmetric(2, &[2u8; 32]),
                        VersionEntry::symmetric(1, &[1u8; 16]),
                    ],
                },
                SetEntry {
                    name: "org.example.rsa".to_string(),
                    kind: KeyKind::Asymmetric,
                    versions: vec![VersionEntry::asymmetric(1, &PAIR).unwrap()],
                },
            ],
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        document().save(&path).unwrap();

        let store = load_keystore(&path).unwrap();
        assert_eq!(store.set_names(), vec!["org.example.rsa", "org.example.sym"]);
        assert_eq!(store.latest_version("org.example.sym").unwrap(), 2);
        assert_eq!(store.kind("org.example.rsa").unwrap(), KeyKind::Asymmetric);

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_duplicate_set_rejected() {
        let mut doc = document();
        doc.sets.push(doc.sets[0].clone());
        let err = doc.into_store().err().unwrap();
        assert!(err.to_string().contains("org.example.sym"));
    }

    #[test]
    fn test_version_zero_rejected() {
        let mut doc = document();
        doc.sets[0].versions.push(VersionEntry::symmetric(0, &[0u8; 32]));
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_wrong_field_for_kind() {
        let mut doc = document();
        doc.sets[1].versions = vec![VersionEntry::symmetric(1, &[0u8; 32])];
        let err = doc.into_store().err().unwrap();
        assert!(err.to_string().contains("org.example.rsa v1"));
    }

    #[test]
    fn test_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_keystore(&path), Err(BrokerError::KeyStoreLoad(_))));
    }
}
