// A single channel to a remote agent exposes many services, and every one of
// them is asynchronous. All protocol state lives on one dispatch thread: the
// transport delivers responses there, caches change state there, and roster
// events are applied there. Nothing on that thread ever blocks.
//
// The rest of an application is multi-threaded and usually wants the remote
// value "now". Caches give every remote value a single owner that knows
// whether it is valid, being fetched, or gone, and tasks let a foreign thread
// park until a computation on the dispatch thread (possibly touching several
// caches) has finished.
//
// The locator roster is the main consumer of both: discovery events arrive on
// the dispatch thread and are applied atomically, while lookups from other
// threads are answered through the task bridge.

pub mod cache;
pub mod dispatch;
#[cfg(feature = "locator")]
pub mod locator;
pub mod task;

pub use cache::{CacheError, CacheOutcome, DataCache, FetchToken, Wake};
pub use dispatch::{Confined, DispatchConfig, DispatchError, DispatchQueue, ShutdownPolicy};
#[cfg(feature = "locator")]
pub use locator::{
    attr, ListenerId, LocatorEvent, PeerDescriptor, PeerSource, Roster, RosterConfig,
    RosterError, RosterEvent, RosterListener,
};
pub use task::{mark_interactive_thread, Task, TaskCompleter, TaskContext, TaskError};
