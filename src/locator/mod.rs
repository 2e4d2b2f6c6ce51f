//! Roster of remote agents announced by the locator service.
//!
//! The roster is dispatch-confined. Locator events are fed in on the dispatch
//! thread; every mutation and the listener notification it causes complete
//! within that same turn. Lookups and updates may be called from any thread:
//! off the dispatch thread they are carried over by a [`Task`] and block until
//! it resolves.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use hashbrown::{HashMap, HashSet};
use tracing::{debug, error, trace};

use crate::{
    dispatch::{panic_message, Confined, DispatchQueue},
    task::Task,
};

mod address;
mod config;
mod error;
mod event;
mod listener;
mod peer;
mod refresh;

pub use address::loopback_alias;
pub use config::RosterConfig;
pub use error::RosterError;
pub use event::{ListenerId, LocatorEvent, RosterEvent, RosterListener};
pub use peer::{attr, PeerDescriptor};
pub use refresh::PeerSource;

use event::Registered;

#[derive(Default)]
struct RosterState {
    peers: HashMap<String, PeerDescriptor>,
    /// Attribute keys copied into a static peer from its discovered twin.
    merged: HashMap<String, Vec<String>>,
    /// Peers reachable through a proxy, by proxy id.
    children: HashMap<String, Vec<PeerDescriptor>>,
    listeners: Vec<Registered>,
    next_listener: u64,
    /// Peers whose change event is being processed.
    changing: HashSet<String>,
    refresh_pending: bool,
    periodic: bool,
}

impl RosterState {
    /// Key of the peer answering to `id`, directly or as a merged alias.
    fn key_of(&self, id: &str) -> Option<String> {
        if self.peers.contains_key(id) {
            return Some(id.to_owned());
        }
        self.peers
            .values()
            .find(|peer| peer.answers_to(id))
            .map(|peer| peer.id.clone())
    }

    /// Like [`key_of`](Self::key_of), falling back to the peer's client id.
    fn known_key(&self, peer: &PeerDescriptor) -> Option<String> {
        self.key_of(&peer.id)
            .or_else(|| peer.client_id().and_then(|client| self.key_of(client)))
    }

    fn matching_static(&self, peer: &PeerDescriptor) -> Vec<String> {
        let mut keys: Vec<_> = self
            .peers
            .values()
            .filter(|candidate| {
                candidate.is_static && candidate.id != peer.id && candidate.same_endpoint(peer)
            })
            .map(|candidate| candidate.id.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Stores `peer` under its id. A user-configured peer stays static when
    /// it is overwritten.
    fn insert(&mut self, mut peer: PeerDescriptor) -> Option<RosterEvent> {
        if self.peers.get(&peer.id).is_some_and(|old| old.is_static) {
            peer.is_static = true;
        }
        match self.peers.insert(peer.id.clone(), peer.clone()) {
            None => Some(RosterEvent::Added(peer)),
            Some(old) if old.same_content(&peer) => {
                trace!(peer = %peer.id, "duplicate add suppressed");
                None
            }
            Some(old) => Some(RosterEvent::Updated { old, new: peer }),
        }
    }

    /// Replaces the dynamic peer stored under `key`, re-keying it if the
    /// replacement carries a new id.
    fn replace(&mut self, key: &str, mut peer: PeerDescriptor) -> Option<RosterEvent> {
        let old = self.peers.remove(key)?;
        peer.is_static = old.is_static;
        if old.same_content(&peer) {
            trace!(peer = %peer.id, "duplicate announcement suppressed");
            self.peers.insert(key.to_owned(), peer);
            return None;
        }
        if key != peer.id {
            if let Some(children) = self.children.remove(key) {
                self.children.insert(peer.id.clone(), children);
            }
        }
        self.peers.insert(peer.id.clone(), peer.clone());
        Some(RosterEvent::Updated { old, new: peer })
    }

    /// Copies the attributes of a discovered peer into the static peer under
    /// `key`. User-configured values win; copied keys are remembered.
    fn merge(&mut self, key: &str, discovered: &PeerDescriptor) -> Option<RosterEvent> {
        let peer = self.peers.get_mut(key)?;
        let merged = self.merged.entry(key.to_owned()).or_default();
        let old = peer.clone();

        for (name, value) in &discovered.attributes {
            if name == attr::ID {
                continue;
            }
            let ours = merged.contains(name);
            if ours || !peer.attributes.contains_key(name) {
                if !ours {
                    merged.push(name.clone());
                }
                peer.attributes.insert(name.clone(), value.clone());
            }
        }
        if discovered.id != peer.id {
            if !merged.iter().any(|name| name == attr::REMOTE_ID) {
                merged.push(attr::REMOTE_ID.to_owned());
            }
            peer.attributes
                .insert(attr::REMOTE_ID.to_owned(), discovered.id.clone());
        }
        peer.last_heartbeat = discovered.last_heartbeat;

        if old.same_content(peer) {
            None
        } else {
            Some(RosterEvent::Updated {
                old,
                new: peer.clone(),
            })
        }
    }

    /// Undoes [`merge`](Self::merge) once the discovered twin went away.
    fn strip(&mut self, key: &str) -> Option<RosterEvent> {
        self.children.remove(key);
        let keys = self.merged.remove(key)?;
        let peer = self.peers.get_mut(key)?;
        let old = peer.clone();
        for name in &keys {
            peer.attributes.remove(name);
        }
        if old.same_content(peer) {
            None
        } else {
            Some(RosterEvent::Updated {
                old,
                new: peer.clone(),
            })
        }
    }

    fn take(&mut self, key: &str) -> Option<RosterEvent> {
        let peer = self.peers.remove(key)?;
        self.children.remove(key);
        self.merged.remove(key);
        Some(RosterEvent::Removed(peer))
    }
}

struct RosterInner {
    config: RosterConfig,
    queue: DispatchQueue,
    source: Option<Arc<dyn PeerSource>>,
    disposed: AtomicBool,
    state: Confined<RosterState>,
}

/// Live registry of discovered and user-configured peers. Cheap to clone.
#[derive(Clone)]
pub struct Roster {
    inner: Arc<RosterInner>,
}

impl fmt::Debug for Roster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Roster")
            .field("queue", &self.inner.queue.name())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Roster {
    pub fn new(queue: &DispatchQueue, config: RosterConfig) -> Self {
        Self::build(queue, config, None)
    }

    /// A roster that reconciles against `source` on [`refresh`](Self::refresh).
    pub fn with_source(
        queue: &DispatchQueue,
        config: RosterConfig,
        source: impl PeerSource + 'static,
    ) -> Self {
        Self::build(queue, config, Some(Arc::new(source)))
    }

    fn build(
        queue: &DispatchQueue,
        config: RosterConfig,
        source: Option<Arc<dyn PeerSource>>,
    ) -> Self {
        Self {
            inner: Arc::new(RosterInner {
                config,
                queue: queue.clone(),
                source,
                disposed: AtomicBool::new(false),
                state: Confined::new(queue, RosterState::default()),
            }),
        }
    }

    pub fn config(&self) -> &RosterConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.inner.queue
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Adds or replaces a peer as is, without filtering or static matching.
    pub fn add(&self, peer: PeerDescriptor) -> Result<(), RosterError> {
        self.on_queue(move |roster| {
            let event = roster.live(|state| state.insert(peer))?;
            roster.notify(event.into_iter().collect());
            Ok(())
        })
    }

    /// Registers a user-configured peer. Static peers survive removal of the
    /// discovered peers merged into them.
    pub fn add_static(&self, mut peer: PeerDescriptor) -> Result<(), RosterError> {
        peer.is_static = true;
        self.add(peer)
    }

    pub fn remove(&self, id: impl Into<String>) -> Result<Option<PeerDescriptor>, RosterError> {
        let id = id.into();
        self.on_queue(move |roster| {
            let event = roster.live(|state| {
                let key = state.key_of(&id)?;
                state.take(&key)
            })?;
            let removed = event.as_ref().and_then(RosterEvent::peer).cloned();
            roster.notify(event.into_iter().collect());
            Ok(removed)
        })
    }

    /// Replaces the peer known as `old_id` with `new`. A changed id is
    /// reported as a removal followed by an addition.
    pub fn update(
        &self,
        old_id: impl Into<String>,
        new: PeerDescriptor,
    ) -> Result<(), RosterError> {
        let old_id = old_id.into();
        self.on_queue(move |roster| {
            let events = roster.live(|state| match state.key_of(&old_id) {
                Some(key) if key == new.id => state.insert(new).into_iter().collect(),
                Some(key) => {
                    let mut events: Vec<_> = state.take(&key).into_iter().collect();
                    events.extend(state.insert(new));
                    events
                }
                None => state.insert(new).into_iter().collect(),
            })?;
            roster.notify(events);
            Ok(())
        })
    }

    pub fn lookup_by_id(
        &self,
        id: impl Into<String>,
    ) -> Result<Option<PeerDescriptor>, RosterError> {
        let id = id.into();
        self.on_queue(move |roster| {
            roster.live(|state| state.key_of(&id).and_then(|key| state.peers.get(&key).cloned()))
        })
    }

    pub fn lookup_by_agent_id(
        &self,
        agent_id: impl Into<String>,
    ) -> Result<Vec<PeerDescriptor>, RosterError> {
        let agent_id = agent_id.into();
        self.select(move |peer| peer.agent_id() == Some(agent_id.as_str()))
    }

    pub fn lookup_by_name(
        &self,
        name: impl Into<String>,
    ) -> Result<Vec<PeerDescriptor>, RosterError> {
        let name = name.into();
        self.select(move |peer| peer.name == name)
    }

    /// Static peers that reach the same agent as `peer`.
    pub fn lookup_matching_static(
        &self,
        peer: PeerDescriptor,
    ) -> Result<Vec<PeerDescriptor>, RosterError> {
        self.on_queue(move |roster| {
            roster.live(|state| {
                state
                    .matching_static(&peer)
                    .iter()
                    .filter_map(|key| state.peers.get(key).cloned())
                    .collect()
            })
        })
    }

    /// Every peer, ordered by id.
    pub fn all(&self) -> Result<Vec<PeerDescriptor>, RosterError> {
        self.select(|_| true)
    }

    pub fn len(&self) -> Result<usize, RosterError> {
        self.on_queue(|roster| roster.live(|state| state.peers.len()))
    }

    pub fn is_empty(&self) -> Result<bool, RosterError> {
        self.len().map(|len| len == 0)
    }

    pub fn children(&self, parent: impl Into<String>) -> Result<Vec<PeerDescriptor>, RosterError> {
        let parent = parent.into();
        self.on_queue(move |roster| {
            roster.live(|state| state.children.get(&parent).cloned().unwrap_or_default())
        })
    }

    /// Stores the peers proxied by `parent`. An empty list clears them.
    pub fn set_children(
        &self,
        parent: impl Into<String>,
        children: Vec<PeerDescriptor>,
    ) -> Result<(), RosterError> {
        let parent = parent.into();
        self.on_queue(move |roster| {
            roster.live(|state| {
                if children.is_empty() {
                    state.children.remove(&parent);
                } else {
                    state.children.insert(parent, children);
                }
            })
        })
    }

    pub fn add_listener(
        &self,
        listener: impl RosterListener + 'static,
    ) -> Result<ListenerId, RosterError> {
        let listener: Arc<dyn RosterListener> = Arc::new(listener);
        self.on_queue(move |roster| {
            roster.live(|state| {
                state.next_listener += 1;
                let id = ListenerId(state.next_listener);
                state.listeners.push(Registered { id, listener });
                id
            })
        })
    }

    pub fn remove_listener(&self, id: ListenerId) -> Result<bool, RosterError> {
        self.on_queue(move |roster| {
            roster.live(|state| {
                let before = state.listeners.len();
                state.listeners.retain(|registered| registered.id != id);
                state.listeners.len() != before
            })
        })
    }

    /// Notifies every listener with [`RosterEvent::Disposed`], then drops all
    /// peers and listeners. Later calls fail with [`RosterError::Disposed`];
    /// disposing again is a no-op.
    pub fn dispose(&self) -> Result<(), RosterError> {
        self.on_queue(|roster| {
            if roster.inner.disposed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let listeners = roster.inner.state.with(|state| {
                state.peers.clear();
                state.merged.clear();
                state.children.clear();
                state.changing.clear();
                std::mem::take(&mut state.listeners)
            });
            debug!(listeners = listeners.len(), "roster disposed");
            for registered in &listeners {
                deliver(roster, registered.listener.as_ref(), &RosterEvent::Disposed);
            }
            Ok(())
        })
    }

    fn select<P>(&self, predicate: P) -> Result<Vec<PeerDescriptor>, RosterError>
    where
        P: Fn(&PeerDescriptor) -> bool + Send + 'static,
    {
        self.on_queue(move |roster| {
            roster.live(|state| {
                let mut peers: Vec<_> = state
                    .peers
                    .values()
                    .filter(|peer| predicate(peer))
                    .cloned()
                    .collect();
                peers.sort_by(|a, b| a.id.cmp(&b.id));
                peers
            })
        })
    }

    /// Runs `f` on the dispatch thread, in place when already there.
    fn on_queue<R, F>(&self, f: F) -> Result<R, RosterError>
    where
        R: Clone + Send + 'static,
        F: FnOnce(&Roster) -> Result<R, RosterError> + Send + 'static,
    {
        if self.inner.queue.is_dispatch_thread() {
            return f(self);
        }
        let roster = self.clone();
        let mut f = Some(f);
        let task = Task::spawn(&self.inner.queue, move |ctx| {
            if let Some(f) = f.take() {
                ctx.done(f(&roster));
            }
        });
        task.get()?
    }

    fn live<R>(&self, f: impl FnOnce(&mut RosterState) -> R) -> Result<R, RosterError> {
        if self.is_disposed() {
            return Err(RosterError::Disposed);
        }
        Ok(self.inner.state.with(f))
    }

    /// Delivers `events` in order to a snapshot of the listeners. The state
    /// lock is released first so listeners can look the roster up.
    fn notify(&self, events: Vec<RosterEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<_> = self.inner.state.with(|state| {
            state
                .listeners
                .iter()
                .map(|registered| registered.listener.clone())
                .collect()
        });
        for event in &events {
            trace!(?event, "roster changed");
            for listener in &listeners {
                deliver(self, listener.as_ref(), event);
            }
        }
    }
}

fn deliver(roster: &Roster, listener: &dyn RosterListener, event: &RosterEvent) {
    if let Err(panic) =
        panic::catch_unwind(AssertUnwindSafe(|| listener.roster_changed(roster, event)))
    {
        error!("roster listener panicked: {}", panic_message(panic.as_ref()));
    }
}
