use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Which key-value backend holds the shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store. State is lost on exit and not shared between instances.
    Memory,
    /// An etcd v3 cluster (requires the `etcd` feature).
    Etcd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: BackendKind,
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Upper bound on every store round trip.
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpdConfig {
    pub listen: Ipv4Addr,
    pub port: u16,
    /// Interface to bind the DHCP socket to (Linux only).
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub dhcpd: DhcpdConfig,
    pub lease_duration_seconds: u32,
    pub sweep_interval_seconds: u64,
    pub allocation_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            endpoints: vec!["127.0.0.1:2379".to_string()],
            timeout_seconds: 3,
        }
    }
}

impl Default for DhcpdConfig {
    fn default() -> Self {
        Self {
            listen: Ipv4Addr::UNSPECIFIED,
            port: 67,
            interface: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            dhcpd: DhcpdConfig::default(),
            lease_duration_seconds: 4 * 60 * 60,
            sweep_interval_seconds: 60,
            allocation_retries: 3,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "sweep_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.store.timeout_seconds == 0 {
            return Err(Error::InvalidConfig(
                "store.timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.store.backend == BackendKind::Etcd && self.store.endpoints.is_empty() {
            return Err(Error::InvalidConfig(
                "store.endpoints must not be empty for the etcd backend".to_string(),
            ));
        }

        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_duration_seconds))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease_duration(), Duration::from_secs(14400));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_lease_duration() {
        let config = Config {
            lease_duration_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_sweep_interval() {
        let config = Config {
            sweep_interval_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_etcd_without_endpoints() {
        let config = Config {
            store: StoreConfig {
                backend: BackendKind::Etcd,
                endpoints: vec![],
                timeout_seconds: 3,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let path = "test_config_create.json".to_string();
        let _guard = TestGuard(path.clone());

        let created = Config::load_or_create(&path).unwrap();
        assert!(Path::new(&path).exists());

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.lease_duration_seconds, created.lease_duration_seconds);
        assert_eq!(loaded.store.backend, BackendKind::Memory);
        assert_eq!(loaded.dhcpd.port, 67);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let path = "test_config_invalid.json".to_string();
        let _guard = TestGuard(path.clone());

        let config = Config {
            store: StoreConfig {
                timeout_seconds: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        config.save(&path).unwrap();

        assert!(matches!(
            Config::load_or_create(&path),
            Err(Error::InvalidConfig(_))
        ));
    }
}
