//! Broker configuration
//!
//! ```toml
//! [server]
//! socket_path = "/run/custody/custodyd.sock"
//! socket_mode = 0o660
//! max_frame_bytes = 1048576
//!
//! [keystore]
//! path = "/etc/custody/keys.json"
//!
//! [algorithms]
//! disabled = ["sha1"]
//!
//! [[grants]]
//! entity = "group:100"
//! set = "org.example.*"
//! access = "operate"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use custody_crypto::{AlgorithmId, AlgorithmRegistry};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::permission::{Grant, PolicyGate};
use crate::protocol::constants::{DEFAULT_MAX_FRAME_BYTES, FRAME_HEADER_LEN};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub server: ServerConfig,
    pub keystore: KeyStoreConfig,
    pub algorithms: AlgorithmConfig,
    pub grants: Vec<Grant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file
    pub socket_mode: u32,
    pub max_frame_bytes: usize,
    /// How long to wait for an existing broker to answer at startup
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    /// Algorithm names refused by this broker, e.g. `"sha1"`
    pub disabled: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: 0o660,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            probe_timeout_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            path: dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("/etc"))
                .join("custody")
                .join("keys.json"),
        }
    }
}

/// `$XDG_RUNTIME_DIR/custody/custodyd.sock`, falling back to the temp dir
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("custody")
        .join("custodyd.sock")
}

impl BrokerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("reading {}: {}", path.display(), e)))?;
        let config: BrokerConfig = toml::from_str(&content)
            .map_err(|e| BrokerError::Config(format!("parsing {}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BrokerError::Config(format!("encoding config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.socket_path.as_os_str().is_empty() {
            return Err(BrokerError::Config("server.socket_path is empty".to_string()));
        }
        if self.server.socket_mode > 0o777 {
            return Err(BrokerError::Config(format!(
                "server.socket_mode {:o} is not a permission mode",
                self.server.socket_mode
            )));
        }
        if self.server.max_frame_bytes <= FRAME_HEADER_LEN
            || self.server.max_frame_bytes > u32::MAX as usize
        {
            return Err(BrokerError::Config(format!(
                "server.max_frame_bytes {} is out of range",
                self.server.max_frame_bytes
            )));
        }
        for grant in &self.grants {
            grant.validate()?;
        }
        self.disabled_algorithms()?;
        Ok(())
    }

    fn disabled_algorithms(&self) -> Result<Vec<AlgorithmId>> {
        self.algorithms
            .disabled
            .iter()
            .map(|name| {
                let id: AlgorithmId = name.parse()?;
                if id == AlgorithmId::Default {
                    return Err(BrokerError::Config(
                        "the default algorithm cannot be disabled".to_string(),
                    ));
                }
                Ok(id)
            })
            .collect()
    }

    pub fn registry(&self) -> Result<AlgorithmRegistry> {
        Ok(AlgorithmRegistry::without(&self.disabled_algorithms()?))
    }

    pub fn gate(&self) -> PolicyGate {
        PolicyGate::new(self.grants.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{Capability, Entity};

    #[test]
    fn test_default_config_is_valid() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.socket_mode, 0o660);
        assert!(config.server.socket_path.ends_with("custody/custodyd.sock"));
    }

    #[test]
    fn test_parse_full_config() {
        let config: BrokerConfig = toml::from_str(
            r#"
            [server]
            socket_path = "/tmp/custody-test.sock"
            socket_mode = 0o600

            [keystore]
            path = "/tmp/keys.json"

            [algorithms]
            disabled = ["sha1"]

            [[grants]]
            entity = "user:1000"
            set = "org.example.sym"
            access = "retrieve"

            [[grants]]
            entity = "*"
            set = "org.example.*"
            access = "operate"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.server.socket_mode, 0o600);
        assert_eq!(config.server.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(config.grants.len(), 2);
        assert_eq!(config.grants[0].entity, Entity::User(1000));
        assert_eq!(config.grants[1].access, Capability::Operate);
        assert!(!config.registry().unwrap().is_enabled(AlgorithmId::Sha1));
    }

    #[test]
    fn test_invalid_values() {
        let mut config = BrokerConfig::default();
        config.server.socket_mode = 0o4777;
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.algorithms.disabled = vec!["default".to_string()];
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.algorithms.disabled = vec!["md5".to_string()];
        assert!(config.registry().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custody.toml");

        let mut config = BrokerConfig::default();
        config.grants.push(Grant::new(Entity::Group(100), "org.*", Capability::Operate));
        config.save(&path).unwrap();

        let loaded = BrokerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.grants, config.grants);
        assert_eq!(loaded.server.socket_path, config.server.socket_path);
    }
}
