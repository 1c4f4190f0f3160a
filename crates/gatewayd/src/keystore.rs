//! Persistent WireGuard identity
//!
//! The key pair is generated once and then only ever read back. Replacing
//! it invalidates every peer's configuration, so that happens only through
//! [`KeyStore::regenerate`], which the operator asks for explicitly.

use crate::storage::{Storage, StorageError, StoredIdentity};
use crate::unix_now;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use wg_gateway_core::{LocalIdentity, PrivateKey, WgKey};

/// Identity errors. Fatal to the pass that hits them.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("identity storage failed: {0}")]
    Storage(#[from] StorageError),
}

/// Owner of this gateway's key pair
pub struct KeyStore {
    storage: Arc<Storage>,
    cached: Option<PrivateKey>,
}

impl KeyStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cached: None,
        }
    }

    /// Load the persisted identity, generating and persisting one on
    /// first use. An existing key is never replaced here.
    pub fn ensure_identity(&mut self, listen_port: u16) -> Result<LocalIdentity, KeyStoreError> {
        if let Some(key) = &self.cached {
            return Ok(LocalIdentity::from_private_key(key.clone(), listen_port));
        }

        let key = match self.storage.get_identity()? {
            Some(stored) => PrivateKey::from_bytes(stored.private_key),
            None => {
                let key = PrivateKey::generate();
                self.storage.put_identity(&StoredIdentity {
                    private_key: key.to_bytes(),
                    created_at: unix_now(),
                })?;
                info!("Generated WireGuard identity {}", key.public_key().short());
                key
            }
        };

        self.cached = Some(key.clone());
        Ok(LocalIdentity::from_private_key(key, listen_port))
    }

    /// Public half of the loaded identity
    pub fn public_key(&self) -> Option<WgKey> {
        self.cached.as_ref().map(PrivateKey::public_key)
    }

    /// Replace the key pair. Every peer must pick up the new public key.
    pub fn regenerate(&mut self, listen_port: u16) -> Result<LocalIdentity, KeyStoreError> {
        let key = PrivateKey::generate();
        self.storage.put_identity(&StoredIdentity {
            private_key: key.to_bytes(),
            created_at: unix_now(),
        })?;
        warn!(
            "Regenerated WireGuard identity, new public key {}",
            key.public_key()
        );
        self.cached = Some(key.clone());
        Ok(LocalIdentity::from_private_key(key, listen_port))
    }
}
