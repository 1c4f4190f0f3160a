//! Persistent storage using sled

use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Key of the local identity record
const IDENTITY_KEY: &str = "local";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Persisted key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub private_key: [u8; 32],
    /// Unix seconds
    pub created_at: u64,
}

/// Storage backend for gatewayd
pub struct Storage {
    db: Db,
    /// Identity tree: "local" -> StoredIdentity
    identity: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let identity = db.open_tree("identity")?;
        Ok(Self { db, identity })
    }

    /// Load the persisted identity, if any
    pub fn get_identity(&self) -> Result<Option<StoredIdentity>, StorageError> {
        match self.identity.get(IDENTITY_KEY)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist the identity and flush before returning
    pub fn put_identity(&self, stored: &StoredIdentity) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(stored)?;
        self.identity.insert(IDENTITY_KEY, value)?;
        self.flush()
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
