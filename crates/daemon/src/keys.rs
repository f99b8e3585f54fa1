//! File-backed key store for server and device key material.
//!
//! Layout under the data directory:
//!
//! ```text
//! keys/
//!   server.pem         # PKCS#8 RSA private key
//!   server.pub.pem     # matching public key
//!   devices/
//!     <device-id>.pub.pem
//! ```
//!
//! Device ids are lowercase hex; anything else is rejected before it can
//! reach the filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use protocol::crypto::DeviceKey;
use protocol::{ProtocolError, Result};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Modulus size for generated server keys.
const SERVER_KEY_BITS: usize = 2048;

/// Short fingerprint of key material for logs: the first 8 bytes of its
/// SHA-256, as hex.
pub fn key_fingerprint(material: &[u8]) -> String {
    let digest = Sha256::digest(material);
    hex::encode(&digest[..8])
}

/// Persistent storage for the server keypair and per-device public keys.
#[derive(Debug, Clone)]
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    /// Creates a store rooted at `<data_dir>/keys`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("keys"),
        }
    }

    fn server_private_path(&self) -> PathBuf {
        self.root.join("server.pem")
    }

    fn server_public_path(&self) -> PathBuf {
        self.root.join("server.pub.pem")
    }

    fn device_path(&self, device_id: &str) -> Result<PathBuf> {
        if device_id.is_empty()
            || !device_id
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(ProtocolError::KeyStore(format!(
                "invalid device id {:?}",
                device_id
            )));
        }
        Ok(self.root.join("devices").join(format!("{}.pub.pem", device_id)))
    }

    /// Loads the stored public key for a device, or `None` when the
    /// device has never presented one.
    pub fn get_device_key(&self, device_id: &str) -> Result<Option<DeviceKey>> {
        let path = self.device_path(device_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let pem = fs::read(&path)
            .map_err(|e| ProtocolError::KeyStore(format!("read {}: {}", path.display(), e)))?;
        match DeviceKey::parse(&pem) {
            Ok(key) => Ok(Some(key)),
            Err(e) => {
                // A corrupt file is treated as no key; the device can
                // re-present one on its next handshake.
                warn!(device_id, error = %e, "stored device key failed to parse");
                Ok(None)
            }
        }
    }

    /// Persists a device's public key.
    pub fn store_device_key(&self, device_id: &str, key: &DeviceKey) -> Result<()> {
        let path = self.device_path(device_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProtocolError::KeyStore(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        let pem = key.to_pem()?;
        let fingerprint = key_fingerprint(pem.as_bytes());
        fs::write(&path, pem)
            .map_err(|e| ProtocolError::KeyStore(format!("write {}: {}", path.display(), e)))?;
        info!(device_id, fingerprint, "stored device public key");
        Ok(())
    }

    /// Loads the server private key, or `None` when none exists yet.
    pub fn get_server_private_key(&self) -> Result<Option<RsaPrivateKey>> {
        let path = self.server_private_path();
        if !path.exists() {
            return Ok(None);
        }
        let pem = fs::read_to_string(&path)
            .map_err(|e| ProtocolError::KeyStore(format!("read {}: {}", path.display(), e)))?;
        RsaPrivateKey::from_pkcs8_pem(&pem)
            .map(Some)
            .map_err(|e| ProtocolError::KeyStore(format!("parse server key: {}", e)))
    }

    /// Persists a server keypair.
    pub fn create_server_keys(
        &self,
        private: &RsaPrivateKey,
        public: &RsaPublicKey,
    ) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| ProtocolError::KeyStore(format!("mkdir {}: {}", self.root.display(), e)))?;

        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ProtocolError::KeyStore(format!("encode server key: {}", e)))?;
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ProtocolError::KeyStore(format!("encode server public key: {}", e)))?;

        fs::write(self.server_private_path(), private_pem.as_bytes())
            .map_err(|e| ProtocolError::KeyStore(format!("write server key: {}", e)))?;
        fs::write(self.server_public_path(), public_pem.as_bytes())
            .map_err(|e| ProtocolError::KeyStore(format!("write server public key: {}", e)))?;
        info!(
            fingerprint = key_fingerprint(public_pem.as_bytes()),
            "server keypair persisted"
        );
        Ok(())
    }

    /// Loads the server private key, generating and persisting a fresh
    /// keypair on first run.
    pub fn load_or_create_server_keys(&self) -> Result<RsaPrivateKey> {
        if let Some(key) = self.get_server_private_key()? {
            return Ok(key);
        }

        info!(bits = SERVER_KEY_BITS, "generating server keypair");
        let private = RsaPrivateKey::new(&mut OsRng, SERVER_KEY_BITS)
            .map_err(|e| ProtocolError::KeyStore(format!("generate server key: {}", e)))?;
        let public = RsaPublicKey::from(&private);
        self.create_server_keys(&private, &public)?;
        Ok(private)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device_key() -> (RsaPrivateKey, DeviceKey) {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        (private, DeviceKey::Rsa(public))
    }

    #[test]
    fn test_missing_device_key_is_none() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path());
        assert!(store.get_device_key("aabbccdd").unwrap().is_none());
    }

    #[test]
    fn test_store_and_load_device_key() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path());
        let (_, key) = device_key();

        store.store_device_key("00112233445566778899aabb", &key).unwrap();
        let loaded = store.get_device_key("00112233445566778899aabb").unwrap();
        assert!(loaded.is_some());
        let DeviceKey::Rsa(loaded) = loaded.unwrap() else {
            panic!("expected RSA key");
        };
        let DeviceKey::Rsa(original) = key else {
            panic!("expected RSA key");
        };
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_invalid_device_id_rejected() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path());
        let (_, key) = device_key();

        assert!(store.store_device_key("../escape", &key).is_err());
        assert!(store.store_device_key("", &key).is_err());
        assert!(store.store_device_key("AABB", &key).is_err());
        assert!(store.get_device_key("not hex!").is_err());
    }

    #[test]
    fn test_corrupt_device_key_treated_as_missing() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path());

        let path = dir.path().join("keys").join("devices");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("deadbeef.pub.pem"), b"not a key").unwrap();

        assert!(store.get_device_key("deadbeef").unwrap().is_none());
    }

    #[test]
    fn test_server_keys_created_once() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path());

        assert!(store.get_server_private_key().unwrap().is_none());

        let first = store.load_or_create_server_keys().unwrap();
        let second = store.load_or_create_server_keys().unwrap();
        assert_eq!(first, second);
        assert!(dir.path().join("keys").join("server.pem").exists());
        assert!(dir.path().join("keys").join("server.pub.pem").exists());
    }

    #[test]
    fn test_create_server_keys_explicit() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new(dir.path());

        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        store.create_server_keys(&private, &public).unwrap();

        let loaded = store.get_server_private_key().unwrap().unwrap();
        assert_eq!(loaded, private);
    }
}
