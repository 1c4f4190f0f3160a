//! Relation snapshot source
//!
//! The transport collaborator drops the current set of relation records
//! into a JSON file (an array of kebab-case records). Each poll diffs the
//! file against the previous snapshot and turns the difference into
//! joined/changed/broken triggers.

use crate::queue::Trigger;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;
use wg_gateway_core::{PeerId, PeerUpdate};

/// Relation source errors
#[derive(Debug, Error)]
pub enum RelationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed relation snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

/// Polls a relation snapshot file
pub struct PeerFileSource {
    path: PathBuf,
    last: BTreeMap<String, PeerUpdate>,
}

/// In a full snapshot an absent field means the peer no longer sets it
fn normalize(mut update: PeerUpdate) -> PeerUpdate {
    update.peer_id = update.peer_id.trim().to_string();
    for field in [
        &mut update.public_key,
        &mut update.endpoint,
        &mut update.tunnel_address,
        &mut update.advertise_prefixes,
    ] {
        field.get_or_insert_with(String::new);
    }
    update
}

impl PeerFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: BTreeMap::new(),
        }
    }

    /// Triggers for everything that changed since the last poll.
    ///
    /// A missing file is an empty snapshot. A malformed file is an error
    /// and leaves the previous snapshot in place, so a torn write never
    /// looks like every relation breaking at once.
    pub fn poll(&mut self) -> Result<Vec<Trigger>, RelationError> {
        let records: Vec<PeerUpdate> = match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut current = BTreeMap::new();
        for record in records.into_iter().map(normalize) {
            if current.contains_key(&record.peer_id) {
                warn!("Duplicate relation record for {}, keeping the first", record.peer_id);
                continue;
            }
            current.insert(record.peer_id.clone(), record);
        }

        let mut triggers = Vec::new();
        for id in self.last.keys().filter(|id| !current.contains_key(*id)) {
            match PeerId::new(id.as_str()) {
                Ok(peer_id) => triggers.push(Trigger::PeerRemove(peer_id)),
                Err(e) => warn!("Ignoring broken relation: {}", e),
            }
        }
        for (id, record) in &current {
            if self.last.get(id) != Some(record) {
                triggers.push(Trigger::PeerUpsert(record.clone()));
            }
        }

        self.last = current;
        Ok(triggers)
    }
}
