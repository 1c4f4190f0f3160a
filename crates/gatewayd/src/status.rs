//! Outward publication
//!
//! After every pass the daemon hands the relation layer its advertisement
//! (what peers need to reach us) and the status sink a structured status.
//! Both are plain JSON files the collaborators pick up.

use crate::subsystem::write_atomic;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use wg_gateway_core::{GatewayStatus, LocalAdvertisement};

pub const ADVERTISEMENT_FILE: &str = "advertisement.json";
pub const STATUS_FILE: &str = "status.json";

/// Publication errors
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sink for the per-pass outputs
pub trait Publisher: Send {
    /// `advertisement` is absent when the pass had no identity
    fn publish(
        &mut self,
        advertisement: Option<&LocalAdvertisement>,
        status: &GatewayStatus,
    ) -> Result<(), PublishError>;
}

/// Writes `advertisement.json` and `status.json` into a directory
pub struct FilePublisher {
    dir: PathBuf,
}

impl FilePublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PublishError> {
        let mut bytes = serde_json::to_vec_pretty(value)?;
        bytes.push(b'\n');
        write_atomic(&self.dir.join(name), &bytes, 0o644)?;
        Ok(())
    }
}

impl Publisher for FilePublisher {
    fn publish(
        &mut self,
        advertisement: Option<&LocalAdvertisement>,
        status: &GatewayStatus,
    ) -> Result<(), PublishError> {
        if let Some(advertisement) = advertisement {
            self.write_json(ADVERTISEMENT_FILE, advertisement)?;
        }
        self.write_json(STATUS_FILE, status)
    }
}
