//! In-memory key store

use std::sync::{Arc, Mutex};

use custody_crypto::{KeyKind, KeyMaterial};
use dashmap::DashMap;
use log::info;

use crate::error::{BrokerError, Result};
use crate::keystore::{unknown_set, KeySet, KeyStore, KeyVersion, VersionSelector};

/// Key store backed by a concurrent map of immutable snapshots
#[derive(Default)]
pub struct MemoryKeyStore {
    sets: DashMap<String, Arc<KeySet>>,
    // Serializes writers; readers never take it
    provisioning: Mutex<()>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `material` as the next version of `set`, creating the set if
    /// needed. Returns the new version number.
    pub fn publish(&self, set: &str, material: KeyMaterial) -> Result<u32> {
        let _guard = self.provisioning.lock().unwrap_or_else(|p| p.into_inner());
        let version = self
            .sets
            .get(set)
            .map(|s| s.latest_version())
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| BrokerError::KeyStoreLoad(format!("{}: version space exhausted", set)))?;
        self.swap_in(set, KeyVersion::new(version, material))?;
        Ok(version)
    }

    /// Publish `material` under an explicit version number
    pub fn publish_version(&self, set: &str, version: u32, material: KeyMaterial) -> Result<()> {
        let _guard = self.provisioning.lock().unwrap_or_else(|p| p.into_inner());
        self.swap_in(set, KeyVersion::new(version, material))
    }

    /// Current snapshot of `set`
    pub fn snapshot(&self, set: &str) -> Option<Arc<KeySet>> {
        self.sets.get(set).map(|s| Arc::clone(s.value()))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    // Caller holds the provisioning lock
    fn swap_in(&self, set: &str, version: KeyVersion) -> Result<()> {
        let current = self
            .snapshot(set)
            .unwrap_or_else(|| Arc::new(KeySet::new(set, version.kind())));
        let number = version.version();
        let next = current.with_version(version)?;
        self.sets.insert(set.to_string(), Arc::new(next));

        info!(target: "custody::audit", "published {} v{} ({})", set, number, current.kind());
        Ok(())
    }

    fn set(&self, set: &str) -> Result<Arc<KeySet>> {
        self.snapshot(set).ok_or_else(|| unknown_set(set))
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, set: &str, version: u32) -> Result<Arc<KeyVersion>> {
        let selector = VersionSelector::from(version);
        self.set(set)?.get(selector).ok_or_else(|| {
            BrokerError::NotFound(format!("key set {} has no version {}", set, selector))
        })
    }

    fn latest_version(&self, set: &str) -> Result<u32> {
        Ok(self.set(set)?.latest_version())
    }

    fn kind(&self, set: &str) -> Result<KeyKind> {
        Ok(self.set(set)?.kind())
    }

    fn set_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorKind;

    fn secret(byte: u8) -> KeyMaterial {
        KeyMaterial::symmetric(vec![byte; 32])
    }

    #[test]
    fn test_publish_appends() {
        let store = MemoryKeyStore::new();
        assert_eq!(store.publish("org.example.sym", secret(1)).unwrap(), 1);
        assert_eq!(store.publish("org.example.sym", secret(2)).unwrap(), 2);
        assert_eq!(store.latest_version("org.example.sym").unwrap(), 2);
        assert_eq!(store.kind("org.example.sym").unwrap(), KeyKind::Symmetric);
    }

    #[test]
    fn test_latest_selector() {
        let store = MemoryKeyStore::new();
        store.publish_version("s", 3, secret(3)).unwrap();
        store.publish_version("s", 9, secret(9)).unwrap();

        let latest = store.get("s", 0).unwrap();
        let nine = store.get("s", 9).unwrap();
        assert_eq!(latest.version(), 9);
        assert!(Arc::ptr_eq(&latest, &nine));
    }

    #[test]
    fn test_not_found() {
        let store = MemoryKeyStore::new();
        store.publish("s", secret(1)).unwrap();

        let err = store.get("does.not.exist", 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = store.get("s", 5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(store.latest_version("does.not.exist").is_err());
    }

    #[test]
    fn test_published_versions_are_stable() {
        let store = MemoryKeyStore::new();
        store.publish("s", secret(1)).unwrap();
        let held = store.get("s", 1).unwrap();

        store.publish("s", secret(2)).unwrap();
        assert!(Arc::ptr_eq(&held, &store.get("s", 1).unwrap()));
        assert!(store.publish_version("s", 1, secret(7)).is_err());
    }

    #[test]
    fn test_kind_is_fixed_per_set() {
        let store = MemoryKeyStore::new();
        store.publish("s", secret(1)).unwrap();
        let pair = custody_crypto::RsaKeyPair::generate(1024).unwrap();
        assert!(store.publish("s", KeyMaterial::Asymmetric(pair)).is_err());
        assert_eq!(store.latest_version("s").unwrap(), 1);
    }

    #[test]
    fn test_concurrent_publishers() {
        let store = Arc::new(MemoryKeyStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.publish("shared", secret(i)).unwrap())
            })
            .collect();

        let mut versions: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        versions.sort();
        assert_eq!(versions, (1..=8).collect::<Vec<u32>>());
        assert_eq!(store.set_names(), vec!["shared".to_string()]);
    }
}
