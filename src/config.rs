//! Configuration for the FVP server
//!
//! The persisted state is a single YAML file: two server scalars and the
//! list of provisioned clients with their hex-encoded keys.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::crypto;
use crate::error::{Error, Result};

/// Default configuration file name, resolved in the working directory.
pub const CONFIG_FILE: &str = "server.yaml";

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSection,

    /// Provisioned clients
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
}

/// The `server:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// UDP port to listen on, kept as a numeric string
    pub port: String,

    /// Inactivity timeout after which a live peer is evicted
    pub timeout_minutes: u64,

    /// Accept anonymous (`id=0`) authentication with a server-generated key
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub allow_anonymous: bool,
}

/// One provisioned client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    /// Client id, 1..=255
    pub id: u8,

    /// 32-byte key, 64 hex characters
    pub key: String,
}

fn default_true() -> bool {
    true
}

fn is_true(v: &bool) -> bool {
    *v
}

impl ServerConfig {
    /// Create a fresh configuration at `path`. Refuses to overwrite an
    /// existing file.
    pub fn create(path: &Path, port: &str, timeout_minutes: u64) -> Result<ServerConfig> {
        if path.exists() {
            return Err(Error::ConfigExists);
        }
        let config = ServerConfig {
            server: ServerSection {
                port: port.to_string(),
                timeout_minutes,
                allow_anonymous: true,
            },
            clients: Vec::new(),
        };
        config.validate()?;
        config.save(path)?;
        Ok(config)
    }

    /// Load and validate the configuration file.
    pub fn load(path: &Path) -> Result<ServerConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the configuration.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Startup-time validation; any violation aborts with a non-zero exit.
    pub fn validate(&self) -> Result<()> {
        if self.server.port.parse::<u16>().is_err() {
            return Err(Error::Config(format!("invalid port: {:?}", self.server.port)));
        }
        if self.server.timeout_minutes == 0 {
            return Err(Error::Config("timeout_minutes must be positive".into()));
        }
        let mut seen = HashSet::new();
        for client in &self.clients {
            if client.id == 0 {
                return Err(Error::Config("client id 0 is reserved".into()));
            }
            if !seen.insert(client.id) {
                return Err(Error::DuplicateClientId(client.id));
            }
            crypto::decode_key_hex(&client.key)?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_minutes * 60)
    }

    /// Smallest client id in 1..=255 absent from the provisioned list.
    pub fn next_free_id(&self) -> Option<u8> {
        let used: HashSet<u8> = self.clients.iter().map(|c| c.id).collect();
        (1..=255).find(|id| !used.contains(id))
    }
}

/// The inner IP a provisioned id maps to when it connects in order; used
/// for display before the peer is live.
pub fn provisioned_ip(id: u8) -> String {
    format!("10.0.0.{}", id as u16 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        ServerConfig::create(&path, "1194", 30).unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.server.port, "1194");
        assert_eq!(config.server.timeout_minutes, 30);
        assert!(config.server.allow_anonymous);
        assert!(config.clients.is_empty());
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        ServerConfig::create(&path, "1194", 30).unwrap();
        assert!(matches!(
            ServerConfig::create(&path, "1194", 30),
            Err(Error::ConfigExists)
        ));
    }

    #[test]
    fn load_rejects_bad_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let yaml = "server:\n  port: \"1194\"\n  timeout_minutes: 30\nclients:\n- id: 1\n  key: \"nothex\"\n";
        std::fs::write(&path, yaml).unwrap();
        assert!(matches!(ServerConfig::load(&path), Err(Error::InvalidHexKey(_))));

        let yaml = format!(
            "server:\n  port: \"1194\"\n  timeout_minutes: 30\nclients:\n- id: 1\n  key: \"{}\"\n",
            "ab".repeat(8)
        );
        std::fs::write(&path, yaml).unwrap();
        assert!(matches!(ServerConfig::load(&path), Err(Error::InvalidKeyLength(8))));
    }

    #[test]
    fn load_rejects_duplicate_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let key = "ab".repeat(32);

        let yaml = format!(
            "server:\n  port: \"1194\"\n  timeout_minutes: 30\nclients:\n- id: 3\n  key: \"{key}\"\n- id: 3\n  key: \"{key}\"\n"
        );
        std::fs::write(&path, yaml).unwrap();
        assert!(matches!(ServerConfig::load(&path), Err(Error::DuplicateClientId(3))));
    }

    #[test]
    fn load_rejects_zero_timeout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "server:\n  port: \"1194\"\n  timeout_minutes: 0\n").unwrap();
        assert!(matches!(ServerConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn next_free_id_scans_ascending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = ServerConfig::create(&path, "1194", 30).unwrap();
        assert_eq!(config.next_free_id(), Some(1));

        let key = "cd".repeat(32);
        for id in [1u8, 2, 4] {
            config.clients.push(ClientEntry { id, key: key.clone() });
        }
        assert_eq!(config.next_free_id(), Some(3));
    }

    #[test]
    fn provisioned_ip_offsets_by_one() {
        assert_eq!(provisioned_ip(1), "10.0.0.2");
        assert_eq!(provisioned_ip(254), "10.0.0.255");
    }
}
