//! Key registry
//!
//! Maps provisioned client ids to their 32-byte keys. Backed by the YAML
//! configuration file; administrative mutations persist the file while the
//! exclusive lock is held. The datapath only ever reads.

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use tracing::info;

use crate::config::{ClientEntry, ServerConfig};
use crate::crypto::{self, Key};
use crate::error::{Error, Result};

pub struct KeyRegistry {
    path: PathBuf,
    inner: RwLock<ServerConfig>,
}

impl KeyRegistry {
    /// Load the registry from a configuration file. Key decoding is strict;
    /// any malformed entry aborts the load.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = ServerConfig::load(&path)?;
        info!(clients = config.clients.len(), "loaded key registry");
        Ok(Self { path, inner: RwLock::new(config) })
    }

    /// Wrap an in-memory configuration; mutations persist to `path`.
    pub fn from_config(path: impl Into<PathBuf>, config: ServerConfig) -> Self {
        Self { path: path.into(), inner: RwLock::new(config) }
    }

    pub fn lookup(&self, id: u8) -> Option<Key> {
        let config = self.inner.read().unwrap();
        config
            .clients
            .iter()
            .find(|c| c.id == id)
            .and_then(|c| crypto::decode_key_hex(&c.key).ok())
    }

    pub fn has(&self, id: u8) -> bool {
        self.inner.read().unwrap().clients.iter().any(|c| c.id == id)
    }

    /// Append a client entry and persist. Fails on a duplicate id.
    pub fn add(&self, id: u8, key: &Key) -> Result<()> {
        let mut config = self.inner.write().unwrap();
        if config.clients.iter().any(|c| c.id == id) {
            return Err(Error::DuplicateClientId(id));
        }
        config.clients.push(ClientEntry { id, key: crypto::encode_key_hex(key) });
        config.save(&self.path)?;
        info!(id, "added client to registry");
        Ok(())
    }

    /// Remove a client entry and persist. Fails when the id is absent.
    pub fn remove(&self, id: u8) -> Result<()> {
        let mut config = self.inner.write().unwrap();
        let before = config.clients.len();
        config.clients.retain(|c| c.id != id);
        if config.clients.len() == before {
            return Err(Error::ClientNotFound(id));
        }
        config.save(&self.path)?;
        info!(id, "removed client from registry");
        Ok(())
    }

    /// Smallest unprovisioned id in 1..=255.
    pub fn next_free_id(&self) -> Option<u8> {
        self.inner.read().unwrap().next_free_id()
    }

    /// Provisioned ids in ascending order.
    pub fn ids(&self) -> Vec<u8> {
        let config = self.inner.read().unwrap();
        let mut ids: Vec<u8> = config.clients.iter().map(|c| c.id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn port(&self) -> String {
        self.inner.read().unwrap().server.port.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.read().unwrap().timeout()
    }

    pub fn allow_anonymous(&self) -> bool {
        self.inner.read().unwrap().server.allow_anonymous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE;
    use tempfile::tempdir;

    fn registry() -> (tempfile::TempDir, KeyRegistry) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        ServerConfig::create(&path, "1194", 30).unwrap();
        let registry = KeyRegistry::load(&path).unwrap();
        (dir, registry)
    }

    #[test]
    fn add_lookup_remove() {
        let (_dir, registry) = registry();
        let key = crypto::generate_key();

        assert!(!registry.has(1));
        registry.add(1, &key).unwrap();
        assert!(registry.has(1));
        assert_eq!(registry.lookup(1), Some(key));

        registry.remove(1).unwrap();
        assert!(!registry.has(1));
        assert_eq!(registry.lookup(1), None);
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let (_dir, registry) = registry();
        let key = crypto::generate_key();
        registry.add(2, &key).unwrap();
        assert!(matches!(registry.add(2, &key), Err(Error::DuplicateClientId(2))));
    }

    #[test]
    fn remove_unknown_id_fails() {
        let (_dir, registry) = registry();
        assert!(matches!(registry.remove(9), Err(Error::ClientNotFound(9))));
    }

    #[test]
    fn mutations_persist_to_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        ServerConfig::create(&path, "1194", 30).unwrap();

        let key = crypto::generate_key();
        {
            let registry = KeyRegistry::load(&path).unwrap();
            registry.add(1, &key).unwrap();
            registry.add(2, &crypto::generate_key()).unwrap();
            registry.remove(2).unwrap();
        }

        let reloaded = KeyRegistry::load(&path).unwrap();
        assert_eq!(reloaded.ids(), vec![1]);
        assert_eq!(reloaded.lookup(1), Some(key));
    }

    #[test]
    fn next_free_id_skips_provisioned() {
        let (_dir, registry) = registry();
        assert_eq!(registry.next_free_id(), Some(1));
        registry.add(1, &crypto::generate_key()).unwrap();
        registry.add(3, &crypto::generate_key()).unwrap();
        assert_eq!(registry.next_free_id(), Some(2));
    }
}
