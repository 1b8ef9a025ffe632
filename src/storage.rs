//! Persistent key and certificate storage.
//!
//! The platform keystore sits behind [SecureStore]. [Credentials] lays the
//! private key and certificate bundle out under the storage keys named in
//! the [Config](crate::config::Config). Private keys are read back only for
//! the operation that needs them and every intermediate buffer holding key
//! bytes is zeroized.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::cbor;
use crate::config::Config;
use crate::definitions::{Certificate, Curve, EccKeyPair};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("nothing stored under '{0}'")]
    Missing(String),
    #[error("stored value under '{0}' is corrupt: {1}")]
    Corrupt(String, String),
    #[error("secure store failure: {0}")]
    Backend(String),
}

/// A platform keystore: opaque bytes under string keys.
pub trait SecureStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Process-local store. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore(Arc<Mutex<HashMap<String, Vec<u8>>>>);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> T,
    ) -> Result<T, StorageError> {
        let mut entries = self
            .0
            .lock()
            .map_err(|_| StorageError::Backend("store lock poisoned".to_string()))?;
        Ok(f(&mut entries))
    }
}

impl SecureStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.with(|entries| entries.get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.with(|entries| {
            if let Some(mut old) = entries.insert(key.to_string(), bytes.to_vec()) {
                old.zeroize();
            }
        })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.with(|entries| {
            if let Some(mut old) = entries.remove(key) {
                old.zeroize();
            }
        })
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredKey {
    #[zeroize(skip)]
    curve: Curve,
    #[serde(with = "serde_bytes")]
    secret: Vec<u8>,
}

/// The user's certificate with everything needed to present it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateBundle {
    pub user: Certificate,
    /// The vehicle this key opens.
    pub vehicle: Certificate,
    /// Intermediates between `user` and a trust anchor, if any.
    #[serde(default)]
    pub chain: Vec<Certificate>,
}

pub struct Credentials<S> {
    store: S,
    key_storage_key: String,
    certificate_storage_key: String,
}

impl<S: SecureStore> Credentials<S> {
    pub fn new(store: S, config: &Config) -> Self {
        Self {
            store,
            key_storage_key: config.key_storage_key.clone(),
            certificate_storage_key: config.certificate_storage_key.clone(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn save_key_pair(&self, key_pair: &EccKeyPair) -> Result<(), StorageError> {
        let stored = StoredKey {
            curve: key_pair.curve(),
            secret: key_pair.to_secret_bytes().to_vec(),
        };
        let bytes = Zeroizing::new(
            cbor::to_vec(&stored).map_err(|e| StorageError::Backend(e.to_string()))?,
        );
        self.store.save(&self.key_storage_key, &bytes)
    }

    /// Load the private key. Callers drop it as soon as the operation that
    /// needed it is done.
    pub fn load_key_pair(&self) -> Result<EccKeyPair, StorageError> {
        let bytes = Zeroizing::new(
            self.store
                .load(&self.key_storage_key)?
                .ok_or_else(|| StorageError::Missing(self.key_storage_key.clone()))?,
        );
        let corrupt = |reason: String| StorageError::Corrupt(self.key_storage_key.clone(), reason);
        let stored: StoredKey = cbor::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        EccKeyPair::from_secret_bytes(stored.curve, &stored.secret).map_err(|e| corrupt(e.to_string()))
    }

    pub fn save_certificates(&self, bundle: &CertificateBundle) -> Result<(), StorageError> {
        let bytes = cbor::to_vec(bundle).map_err(|e| StorageError::Backend(e.to_string()))?;
        self.store.save(&self.certificate_storage_key, &bytes)
    }

    pub fn load_certificates(&self) -> Result<CertificateBundle, StorageError> {
        let bytes = self
            .store
            .load(&self.certificate_storage_key)?
            .ok_or_else(|| StorageError::Missing(self.certificate_storage_key.clone()))?;
        cbor::from_slice(&bytes)
            .map_err(|e| StorageError::Corrupt(self.certificate_storage_key.clone(), e.to_string()))
    }

    /// Remove the key and certificates, e.g. when the key is revoked.
    pub fn forget(&self) -> Result<(), StorageError> {
        self.store.delete(&self.key_storage_key)?;
        self.store.delete(&self.certificate_storage_key)
    }
}
