use std::{fmt, sync::Arc};

use super::{PeerDescriptor, Roster};

/// A notification from the locator service.
#[derive(Debug, Clone)]
pub enum LocatorEvent {
    Added(PeerDescriptor),
    Changed(PeerDescriptor),
    Removed(String),
    Heartbeat(String),
}

/// A change to the roster, delivered in the same dispatch turn it was applied.
#[derive(Debug, Clone)]
pub enum RosterEvent {
    Added(PeerDescriptor),
    Updated {
        old: PeerDescriptor,
        new: PeerDescriptor,
    },
    Removed(PeerDescriptor),
    /// Last event a listener receives.
    Disposed,
}

impl RosterEvent {
    pub fn peer(&self) -> Option<&PeerDescriptor> {
        match self {
            Self::Added(peer) | Self::Removed(peer) => Some(peer),
            Self::Updated { new, .. } => Some(new),
            Self::Disposed => None,
        }
    }
}

/// Observes roster changes. Called on the dispatch thread with the roster
/// already consistent, so lookups from inside the callback see the change.
pub trait RosterListener: Send + Sync {
    fn roster_changed(&self, roster: &Roster, event: &RosterEvent);
}

impl<F> RosterListener for F
where
    F: Fn(&Roster, &RosterEvent) + Send + Sync,
{
    fn roster_changed(&self, roster: &Roster, event: &RosterEvent) {
        self(roster, event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

pub(crate) struct Registered {
    pub(crate) id: ListenerId,
    pub(crate) listener: Arc<dyn RosterListener>,
}

impl fmt::Debug for Registered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Registered").field(&self.id).finish()
    }
}
