//! Coalescing trigger queue
//!
//! Producers push triggers at any time. The driver takes everything that
//! piled up in one batch, so N triggers arriving during a pass cause
//! exactly one following pass.

use parking_lot::Mutex;
use std::fmt;
use tokio::sync::Notify;
use wg_gateway_core::{LocalConfig, PeerId, PeerUpdate};

/// Why a reconciliation pass runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    ConfigChanged(Box<LocalConfig>),
    /// Relation joined or changed
    PeerUpsert(PeerUpdate),
    /// Relation broken
    PeerRemove(PeerId),
    Tick,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Startup => write!(f, "startup"),
            Trigger::ConfigChanged(_) => write!(f, "config-changed"),
            Trigger::PeerUpsert(update) => write!(f, "peer-changed({})", update.peer_id),
            Trigger::PeerRemove(peer_id) => write!(f, "peer-broken({})", peer_id),
            Trigger::Tick => write!(f, "tick"),
        }
    }
}

/// Pending triggers plus a wakeup for the driver
#[derive(Debug, Default)]
pub struct TriggerQueue {
    pending: Mutex<Vec<Trigger>>,
    notify: Notify,
}

impl TriggerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, trigger: Trigger) {
        self.pending.lock().push(trigger);
        self.notify.notify_one();
    }

    pub fn extend(&self, triggers: impl IntoIterator<Item = Trigger>) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.extend(triggers);
        if pending.len() > before {
            drop(pending);
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Wait until something is pending, then take all of it in arrival order
    pub async fn next_batch(&self) -> Vec<Trigger> {
        loop {
            {
                let mut pending = self.pending.lock();
                if !pending.is_empty() {
                    return std::mem::take(&mut *pending);
                }
            }
            self.notify.notified().await;
        }
    }
}
