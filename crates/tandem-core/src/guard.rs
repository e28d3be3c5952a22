//! Cross-session occupancy guard
//!
//! Each registry holds an [`OccupancyGuard`] pointing at its peer and asks it
//! "is resumable identity X active over there?" before resuming X itself.
//! The answer is a point-in-time read of the peer's session map, not a held
//! lock: two registries can both pass the check before either has resumed.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::pty::PtyRegistry;
use crate::session::AgentRegistry;

/// Answers whether a resumable conversation identity is in use
pub trait OccupancyProbe: Send + Sync {
    fn is_resumable_identity_active(&self, resume_id: &str) -> bool;
}

/// Read-only reference from one registry into its peer.
///
/// Holds the peer weakly so the two registries do not keep each other alive.
#[derive(Clone, Default)]
pub struct OccupancyGuard {
    peer: Arc<RwLock<Option<Weak<dyn OccupancyProbe>>>>,
}

impl OccupancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point this guard at `peer`, replacing any previous peer
    pub fn attach(&self, peer: Weak<dyn OccupancyProbe>) {
        *self.peer.write() = Some(peer);
    }

    pub fn detach(&self) {
        *self.peer.write() = None;
    }

    /// Whether the peer currently reports `resume_id` as active.
    ///
    /// With no peer attached (or a peer already dropped) nothing is occupied.
    pub fn is_active_elsewhere(&self, resume_id: &str) -> bool {
        let peer = self.peer.read().as_ref().and_then(Weak::upgrade);
        match peer {
            Some(peer) => {
                let active = peer.is_resumable_identity_active(resume_id);
                debug!("Occupancy check for {}: active={}", resume_id, active);
                active
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for OccupancyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OccupancyGuard")
            .field("attached", &self.peer.read().is_some())
            .finish()
    }
}

/// Wire the PTY and agent registries to guard each other
pub fn link(pty: &Arc<PtyRegistry>, agent: &Arc<AgentRegistry>) {
    let agent_probe: Weak<dyn OccupancyProbe> = Arc::downgrade(agent) as Weak<dyn OccupancyProbe>;
    let pty_probe: Weak<dyn OccupancyProbe> = Arc::downgrade(pty) as Weak<dyn OccupancyProbe>;
    pty.guard().attach(agent_probe);
    agent.guard().attach(pty_probe);
}
