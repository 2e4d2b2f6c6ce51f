#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex, Once},
    thread,
    time::{Duration, Instant},
};

use agentlink::{
    DataCache, DispatchConfig, DispatchQueue, FetchToken, Roster, RosterEvent,
};

static LOGGING: Once = Once::new();

/// Routes `tracing` output through the test harness. Honours `RUST_LOG`.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn queue(name: &str) -> DispatchQueue {
    init_logging();
    DispatchQueue::new(DispatchConfig::builder().name(name).build()).unwrap()
}

/// A fetcher that parks every token until the test answers it.
#[derive(Clone)]
pub struct ManualFetcher<T: Send + 'static> {
    tokens: Arc<Mutex<Vec<FetchToken<T>>>>,
}

impl<T: Clone + Send + 'static> ManualFetcher<T> {
    pub fn cache(queue: &DispatchQueue, name: &str) -> (DataCache<T>, Self) {
        let fetcher = Self {
            tokens: Arc::default(),
        };
        let tokens = fetcher.tokens.clone();
        let cache = DataCache::new(queue, name, move |token| tokens.lock().unwrap().push(token));
        (cache, fetcher)
    }

    pub fn issued(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    /// Waits for the next fetch to be issued and hands out its token.
    pub fn next(&self) -> FetchToken<T> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(token) = self.tokens.lock().unwrap().pop() {
                return token;
            }
            assert!(Instant::now() < deadline, "no fetch was issued");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Records every roster event, and what a lookup by id returned at the
/// moment the listener was called.
#[derive(Clone, Default)]
pub struct Recorder {
    pub events: Arc<Mutex<Vec<RosterEvent>>>,
    pub visible: Arc<Mutex<Vec<bool>>>,
}

impl Recorder {
    pub fn attach(roster: &Roster) -> Self {
        let recorder = Self::default();
        let sink = recorder.clone();
        roster
            .add_listener(move |roster: &Roster, event: &RosterEvent| {
                if let Some(peer) = event.peer() {
                    let found = roster.lookup_by_id(peer.id.clone()).unwrap().is_some();
                    sink.visible.lock().unwrap().push(found);
                }
                sink.events.lock().unwrap().push(event.clone());
            })
            .unwrap();
        recorder
    }

    pub fn events(&self) -> Vec<RosterEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn visible(&self) -> Vec<bool> {
        self.visible.lock().unwrap().clone()
    }
}
