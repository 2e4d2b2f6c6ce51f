use std::{
    mem,
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use hashbrown::HashMap;
use tracing::{debug, trace};

use super::{PeerDescriptor, Roster, RosterError, RosterEvent, RosterInner};
use crate::{dispatch::DispatchError, task::TaskError};

/// The locator service's current view of the network.
pub trait PeerSource: Send + Sync {
    /// Current peers by id. Called on the dispatch thread.
    fn peers(&self) -> HashMap<String, PeerDescriptor>;
}

impl<F> PeerSource for F
where
    F: Fn() -> HashMap<String, PeerDescriptor> + Send + Sync,
{
    fn peers(&self) -> HashMap<String, PeerDescriptor> {
        self()
    }
}

impl Roster {
    /// Reconciles the roster with the peer source: unknown peers are added,
    /// dynamic peers the source no longer reports are removed, and static
    /// peers whose discovered twin vanished lose the merged attributes.
    pub fn refresh(&self) -> Result<(), RosterError> {
        self.on_queue(|roster| {
            if roster.is_disposed() {
                return Err(RosterError::Disposed);
            }
            roster.reconcile();
            Ok(())
        })
    }

    /// Schedules a refresh after the debounce delay. Requests made while one
    /// is pending are folded into it.
    pub fn request_refresh(&self) -> Result<(), RosterError> {
        self.on_queue(|roster| {
            if roster.live(|state| mem::replace(&mut state.refresh_pending, true))? {
                trace!("refresh already pending");
                return Ok(());
            }
            let weak = Arc::downgrade(&roster.inner);
            let scheduled = roster
                .inner
                .queue
                .schedule_after(roster.inner.config.refresh_debounce, move || {
                    let Some(roster) = upgrade(&weak) else {
                        return;
                    };
                    roster.inner.state.with(|state| state.refresh_pending = false);
                    roster.reconcile();
                });
            if let Err(e) = scheduled {
                roster.inner.state.with(|state| state.refresh_pending = false);
                return Err(TaskError::from(e).into());
            }
            Ok(())
        })
    }

    /// Refreshes every `refresh_interval` until the roster is disposed or the
    /// queue shuts down. Starting it twice has no further effect.
    pub fn start_periodic_refresh(&self) -> Result<(), RosterError> {
        self.on_queue(|roster| {
            if roster.live(|state| mem::replace(&mut state.periodic, true))? {
                return Ok(());
            }
            debug!(interval = ?roster.inner.config.refresh_interval, "periodic refresh started");
            schedule_tick(&roster.inner).map_err(|e| TaskError::from(e).into())
        })
    }

    /// Removes dynamic peers not heard from for longer than `max_age`.
    pub fn evict_stale(&self, max_age: Duration) -> Result<Vec<PeerDescriptor>, RosterError> {
        self.on_queue(move |roster| {
            let now = Utc::now();
            let events = roster.live(|state| {
                let mut stale: Vec<_> = state
                    .peers
                    .values()
                    .filter(|peer| {
                        !peer.is_static
                            && (now - peer.last_heartbeat)
                                .to_std()
                                .is_ok_and(|age| age > max_age)
                    })
                    .map(|peer| peer.id.clone())
                    .collect();
                stale.sort();
                stale
                    .iter()
                    .filter_map(|key| state.take(key))
                    .collect::<Vec<_>>()
            })?;
            if !events.is_empty() {
                debug!(evicted = events.len(), "evicted stale peers");
            }
            let evicted = events
                .iter()
                .filter_map(|event| event.peer().cloned())
                .collect();
            roster.notify(events);
            Ok(evicted)
        })
    }

    fn reconcile(&self) {
        if self.is_disposed() {
            return;
        }
        let Some(source) = self.inner.source.clone() else {
            trace!("no peer source, nothing to refresh");
            return;
        };
        let current = source.peers();

        let mut ids: Vec<_> = current.keys().cloned().collect();
        ids.sort();
        for id in &ids {
            if let Some(peer) = current.get(id) {
                self.peer_added(peer.clone());
            }
        }

        let events: Vec<RosterEvent> = self.inner.state.with(|state| {
            let mut gone: Vec<_> = state
                .peers
                .values()
                .filter(|peer| match (peer.is_static, peer.remote_id()) {
                    (false, _) => !current.contains_key(&peer.id),
                    (true, Some(remote)) => !current.contains_key(remote),
                    (true, None) => false,
                })
                .map(|peer| (peer.id.clone(), peer.is_static))
                .collect();
            gone.sort();
            gone.iter()
                .filter_map(|(key, is_static)| {
                    if *is_static {
                        state.strip(key)
                    } else {
                        state.take(key)
                    }
                })
                .collect()
        });
        trace!(known = current.len(), changes = events.len(), "roster refreshed");
        self.notify(events);
    }
}

fn upgrade(weak: &Weak<RosterInner>) -> Option<Roster> {
    weak.upgrade().map(|inner| Roster { inner })
}

fn schedule_tick(inner: &Arc<RosterInner>) -> Result<(), DispatchError> {
    let weak = Arc::downgrade(inner);
    inner
        .queue
        .schedule_after(inner.config.refresh_interval, move || {
            let Some(roster) = upgrade(&weak) else {
                return;
            };
            if roster.is_disposed() {
                return;
            }
            roster.reconcile();
            if let Err(e) = schedule_tick(&roster.inner) {
                debug!("periodic refresh stopped: {e}");
            }
        })
}
