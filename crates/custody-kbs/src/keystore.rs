//! Versioned key storage
//!
//! A key set is an immutable snapshot. Provisioning builds a new snapshot and
//! swaps it in whole, so a reader holding an `Arc<KeyVersion>` never observes
//! a partial update.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use custody_crypto::{KeyKind, KeyMaterial};

use crate::error::{BrokerError, Result};

pub mod file;
pub mod memory;

pub use file::{load_keystore, KeyStoreDocument, SetEntry, VersionEntry};
pub use memory::MemoryKeyStore;

/// Version selector as sent on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionSelector {
    Latest,
    Exact(u32),
}

impl From<u32> for VersionSelector {
    fn from(version: u32) -> Self {
        match version {
            0 => VersionSelector::Latest,
            v => VersionSelector::Exact(v),
        }
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSelector::Latest => write!(f, "latest"),
            VersionSelector::Exact(v) => write!(f, "v{}", v),
        }
    }
}

/// One published version of a key set
#[derive(Debug)]
pub struct KeyVersion {
    version: u32,
    material: KeyMaterial,
}

impl KeyVersion {
    pub fn new(version: u32, material: KeyMaterial) -> Self {
        Self { version, material }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    pub fn kind(&self) -> KeyKind {
        self.material.kind()
    }
}

/// Immutable snapshot of a named key set
#[derive(Debug, Clone)]
pub struct KeySet {
    name: String,
    kind: KeyKind,
    versions: BTreeMap<u32, Arc<KeyVersion>>,
}

impl KeySet {
    pub fn new(name: impl Into<String>, kind: KeyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            versions: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// Highest published version, `0` for an empty set
    pub fn latest_version(&self) -> u32 {
        self.versions.keys().next_back().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn get(&self, selector: VersionSelector) -> Option<Arc<KeyVersion>> {
        match selector {
            VersionSelector::Latest => self.versions.values().next_back().cloned(),
            VersionSelector::Exact(v) => self.versions.get(&v).cloned(),
        }
    }

    /// New snapshot with `version` appended. The version must exceed every
    /// existing one and the material must match the set's kind.
    pub fn with_version(&self, version: KeyVersion) -> Result<KeySet> {
        if version.version() == 0 {
            return Err(BrokerError::KeyStoreLoad(format!(
                "{}: version 0 is reserved for the latest selector",
                self.name
            )));
        }
        if version.version() <= self.latest_version() {
            return Err(BrokerError::KeyStoreLoad(format!(
                "{}: version {} does not exceed latest version {}",
                self.name,
                version.version(),
                self.latest_version()
            )));
        }
        if version.kind() != self.kind {
            return Err(BrokerError::KeyStoreLoad(format!(
                "{} v{}: {} material in a {} set",
                self.name,
                version.version(),
                version.kind(),
                self.kind
            )));
        }

        let mut next = self.clone();
        next.versions.insert(version.version(), Arc::new(version));
        Ok(next)
    }
}

/// Read access to key material
pub trait KeyStore: Send + Sync {
    /// Version `0` resolves to the latest version.
    fn get(&self, set: &str, version: u32) -> Result<Arc<KeyVersion>>;

    fn latest_version(&self, set: &str) -> Result<u32>;

    fn kind(&self, set: &str) -> Result<KeyKind>;

    fn set_names(&self) -> Vec<String>;
}

pub(crate) fn unknown_set(set: &str) -> BrokerError {
    BrokerError::NotFound(format!("unknown key set {}", set))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(version: u32) -> KeyVersion {
        KeyVersion::new(version, KeyMaterial::symmetric(vec![version as u8; 32]))
    }

    #[test]
    fn test_selector_from_wire() {
        assert_eq!(VersionSelector::from(0), VersionSelector::Latest);
        assert_eq!(VersionSelector::from(7), VersionSelector::Exact(7));
    }

    #[test]
    fn test_snapshot_is_copy_on_write() {
        let empty = KeySet::new("org.example.sym", KeyKind::Symmetric);
        let one = empty.with_version(sym(1)).unwrap();
        let two = one.with_version(sym(2)).unwrap();

        assert_eq!(empty.len(), 0);
        assert_eq!(one.latest_version(), 1);
        assert_eq!(two.latest_version(), 2);
        assert_eq!(two.get(VersionSelector::Latest).unwrap().version(), 2);
        assert!(one.get(VersionSelector::Exact(2)).is_none());
    }

    #[test]
    fn test_versions_must_grow() {
        let set = KeySet::new("s", KeyKind::Symmetric).with_version(sym(3)).unwrap();
        assert!(set.with_version(sym(3)).is_err());
        assert!(set.with_version(sym(2)).is_err());
        assert!(set.with_version(sym(0)).is_err());
    }

    #[test]
    fn test_set_is_homogeneous() {
        let set = KeySet::new("s", KeyKind::Asymmetric);
        let err = set.with_version(sym(1)).unwrap_err();
        assert!(matches!(err, BrokerError::KeyStoreLoad(_)));
    }
}
