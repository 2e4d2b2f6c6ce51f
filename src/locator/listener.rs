use chrono::Utc;
use tracing::{debug, trace};

use super::{loopback_alias, LocatorEvent, PeerDescriptor, Roster, RosterConfig};

/// Whether a discovered peer may become known at all.
fn accepts(config: &RosterConfig, peer: &PeerDescriptor) -> bool {
    if peer.is_value_add() || peer.is_cli_relay() {
        return false;
    }
    match peer.host() {
        Some(host) if config.drop_local_non_loopback => {
            config.is_loopback(host) || !config.is_local_host(host)
        }
        _ => true,
    }
}

/// Locator event intake. All of these must run on the dispatch thread, and
/// are ignored once the roster is disposed.
impl Roster {
    pub fn handle(&self, event: LocatorEvent) {
        match event {
            LocatorEvent::Added(peer) => self.peer_added(peer),
            LocatorEvent::Changed(peer) => self.peer_changed(peer),
            LocatorEvent::Removed(id) => self.peer_removed(&id),
            LocatorEvent::Heartbeat(id) => self.peer_heartbeat(&id),
        }
    }

    /// A peer was discovered. A peer that is already known (by id, alias or
    /// client id) is updated instead; one that matches a static peer is
    /// merged into it.
    pub fn peer_added(&self, peer: PeerDescriptor) {
        if self.is_disposed() {
            return;
        }
        if !accepts(&self.inner.config, &peer) {
            debug!(peer = %peer.id, name = %peer.name, "filtered peer");
            return;
        }
        let events = self.inner.state.with(|state| match state.known_key(&peer) {
            None => {
                let matches = state.matching_static(&peer);
                if matches.is_empty() {
                    state.insert(peer).into_iter().collect()
                } else {
                    matches
                        .iter()
                        .filter_map(|key| state.merge(key, &peer))
                        .collect()
                }
            }
            Some(key) if state.peers[&key].is_static => {
                state.merge(&key, &peer).into_iter().collect()
            }
            Some(key) => state.replace(&key, peer).into_iter().collect(),
        });
        self.notify(events);
    }

    /// A known peer changed. Unknown peers are ignored, and so is a change
    /// event for a peer whose previous change is still being delivered.
    pub fn peer_changed(&self, peer: PeerDescriptor) {
        if self.is_disposed() {
            return;
        }
        let id = peer.id.clone();
        if !self.inner.state.with(|state| state.changing.insert(id.clone())) {
            trace!(peer = %id, "ignoring re-entrant change");
            return;
        }

        let events = self.inner.state.with(|state| match state.known_key(&peer) {
            None => {
                debug!(peer = %peer.id, "change for an unknown peer");
                Vec::new()
            }
            Some(key) if state.peers[&key].is_static => {
                state.merge(&key, &peer).into_iter().collect()
            }
            Some(key) => state.replace(&key, peer).into_iter().collect(),
        });
        self.notify(events);

        self.inner.state.with(|state| state.changing.remove(&id));
    }

    /// A peer went away. Removal notices for agents on this host may name a
    /// local address other than the loopback one the peer is known by.
    /// Static peers only lose what was merged into them.
    pub fn peer_removed(&self, id: &str) {
        if self.is_disposed() {
            return;
        }
        let config = &self.inner.config;
        let events = self.inner.state.with(|state| {
            let key = state
                .key_of(id)
                .or_else(|| loopback_alias(id, config).and_then(|alias| state.key_of(&alias)));
            let Some(key) = key else {
                debug!(peer = %id, "removal for an unknown peer");
                return Vec::new();
            };
            if state.peers[&key].is_static {
                state.strip(&key).into_iter().collect()
            } else {
                state.take(&key).into_iter().collect()
            }
        });
        self.notify(events);
    }

    /// Refreshes liveness only. Never notifies.
    pub fn peer_heartbeat(&self, id: &str) {
        if self.is_disposed() {
            return;
        }
        let config = &self.inner.config;
        self.inner.state.with(|state| {
            let key = state
                .key_of(id)
                .or_else(|| loopback_alias(id, config).and_then(|alias| state.key_of(&alias)));
            match key.and_then(|key| state.peers.get_mut(&key)) {
                Some(peer) => peer.last_heartbeat = Utc::now(),
                None => trace!(peer = %id, "heartbeat for an unknown peer"),
            }
        });
    }
}
