use std::{
    fmt, mem,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
};

use tracing::{debug, error, trace};

use crate::dispatch::{panic_message, Confined, DispatchQueue};

mod error;

pub use error::CacheError;

/// A continuation parked on a cache until its pending fetch resolves.
pub type Waiter = Box<dyn FnOnce(Wake) + Send + 'static>;

type Fetcher<T> = Box<dyn Fn(FetchToken<T>) + Send + Sync + 'static>;

/// How a cache left the fetching state, as seen by its waiters.
#[derive(Debug, Clone)]
pub enum Wake {
    Valid,
    Failed(CacheError),
    /// The cache was reset while fetching; the in-flight result will be dropped.
    Invalidated,
    Disposed,
}

/// A snapshot of a cache, readable without triggering a fetch.
#[derive(Debug, Clone)]
pub enum CacheOutcome<T> {
    /// Not fetched yet, or a fetch is in flight.
    Pending,
    Valid(T),
    /// The last fetch failed; the next `validate()` retries.
    Failed(CacheError),
    Disposed,
}

enum Status<T> {
    Invalid { error: Option<CacheError> },
    Fetching,
    Valid(T),
    Disposed,
}

struct CacheState<T> {
    status: Status<T>,
    generation: u64,
    waiters: Vec<Waiter>,
}

struct CacheInner<T: Send + 'static> {
    name: String,
    state: Confined<CacheState<T>>,
    fetch: Fetcher<T>,
}

/// One remote value that is fetched lazily and may become stale.
///
/// All operations must run on the dispatch thread of the queue the cache was
/// created with. At most one fetch is in flight at any time; every caller that
/// validates while it is in flight shares its result.
pub struct DataCache<T: Send + 'static> {
    inner: Arc<CacheInner<T>>,
}

impl<T: Send + 'static> Clone for DataCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for DataCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCache")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

enum Validation<T: Send + 'static> {
    Ready,
    Pending,
    Fetch(FetchToken<T>),
}

impl<T: Clone + Send + 'static> DataCache<T> {
    /// Creates an invalid cache. `fetch` is called on the dispatch thread each
    /// time a fetch has to be issued, and must eventually complete the token.
    pub fn new<F>(queue: &DispatchQueue, name: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(FetchToken<T>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(CacheInner {
                name: name.into(),
                state: Confined::new(
                    queue,
                    CacheState {
                        status: Status::Invalid { error: None },
                        generation: 0,
                        waiters: Vec::new(),
                    },
                ),
                fetch: Box::new(fetch),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns true if the cache holds its final answer (valid or disposed).
    /// Otherwise makes sure a fetch is in flight and returns false.
    pub fn validate(&self) -> bool {
        self.validate_inner(None)
    }

    /// Like [`validate`](Self::validate), but when it returns false `waiter`
    /// runs exactly once, on the dispatch thread, as soon as the pending fetch
    /// resolves, is invalidated, or the cache is disposed.
    pub fn validate_with<W>(&self, waiter: W) -> bool
    where
        W: FnOnce(Wake) + Send + 'static,
    {
        self.validate_inner(Some(Box::new(waiter)))
    }

    fn validate_inner(&self, waiter: Option<Waiter>) -> bool {
        let next = self.inner.state.with(|state| match state.status {
            Status::Valid(_) | Status::Disposed => Validation::Ready,
            Status::Fetching => {
                state.waiters.extend(waiter);
                Validation::Pending
            }
            Status::Invalid { .. } => {
                state.generation += 1;
                state.status = Status::Fetching;
                state.waiters.extend(waiter);
                Validation::Fetch(FetchToken::new(&self.inner, state.generation))
            }
        });

        match next {
            Validation::Ready => true,
            Validation::Pending => false,
            Validation::Fetch(token) => {
                trace!(cache = %self.inner.name, generation = token.generation, "issuing fetch");
                // the fetcher runs outside the state lock so it may read other caches
                (self.inner.fetch)(token);
                false
            }
        }
    }

    /// The cached value. `None` once the cache is disposed.
    ///
    /// Panics if the cache is invalid or fetching: guard with `validate()`.
    pub fn data(&self) -> Option<T> {
        self.inner.state.with(|state| match &state.status {
            Status::Valid(value) => Some(value.clone()),
            Status::Disposed => None,
            Status::Invalid { .. } | Status::Fetching => {
                panic!("cache `{}` read before it was validated", self.inner.name)
            }
        })
    }

    pub fn outcome(&self) -> CacheOutcome<T> {
        self.inner.state.with(|state| match &state.status {
            Status::Valid(value) => CacheOutcome::Valid(value.clone()),
            Status::Disposed => CacheOutcome::Disposed,
            Status::Invalid { error: Some(error) } => CacheOutcome::Failed(error.clone()),
            Status::Invalid { error: None } | Status::Fetching => CacheOutcome::Pending,
        })
    }

    /// The error of the last failed fetch, until the next fetch starts.
    pub fn error(&self) -> Option<CacheError> {
        self.inner.state.with(|state| match &state.status {
            Status::Invalid { error } => error.clone(),
            _ => None,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.inner
            .state
            .with(|state| matches!(state.status, Status::Valid(_)))
    }

    pub fn is_disposed(&self) -> bool {
        self.inner
            .state
            .with(|state| matches!(state.status, Status::Disposed))
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.with(|state| state.generation)
    }

    /// Marks the value stale. A fetch already in flight is superseded: its
    /// waiters are released with [`Wake::Invalidated`] and its result is
    /// discarded when it lands.
    pub fn reset(&self) {
        let released = self.inner.state.with(|state| {
            if matches!(state.status, Status::Disposed) {
                return Vec::new();
            }
            state.generation += 1;
            state.status = Status::Invalid { error: None };
            mem::take(&mut state.waiters)
        });
        trace!(cache = %self.inner.name, "reset");
        release(&self.inner.name, released, Wake::Invalidated);
    }

    /// Stores a value obtained outside the fetch path, e.g. carried by an
    /// event. Supersedes any fetch in flight.
    pub fn set_data(&self, value: T) {
        let released = self.inner.state.with(|state| {
            if matches!(state.status, Status::Disposed) {
                return None;
            }
            state.generation += 1;
            state.status = Status::Valid(value);
            Some(mem::take(&mut state.waiters))
        });
        match released {
            Some(waiters) => release(&self.inner.name, waiters, Wake::Valid),
            None => debug!(cache = %self.inner.name, "ignoring data for a disposed cache"),
        }
    }

    /// Terminal. Every pending waiter is released with [`Wake::Disposed`] and
    /// the cache never changes state again.
    pub fn dispose(&self) {
        let released = self.inner.state.with(|state| {
            if matches!(state.status, Status::Disposed) {
                return None;
            }
            state.generation += 1;
            state.status = Status::Disposed;
            Some(mem::take(&mut state.waiters))
        });
        if let Some(waiters) = released {
            debug!(cache = %self.inner.name, waiters = waiters.len(), "disposed");
            release(&self.inner.name, waiters, Wake::Disposed);
        }
    }
}

/// The pending answer to one fetch.
///
/// The transport completes it exactly once, from any thread; the result is
/// applied on a later turn of the dispatch queue. If the cache was reset or
/// disposed since the fetch started, the result is dropped. A token dropped
/// without completion completes the fetch with [`CacheError::Abandoned`].
pub struct FetchToken<T: Send + 'static> {
    cache: Weak<CacheInner<T>>,
    generation: u64,
    completed: bool,
}

impl<T: Send + 'static> FetchToken<T> {
    fn new(cache: &Arc<CacheInner<T>>, generation: u64) -> Self {
        Self {
            cache: Arc::downgrade(cache),
            generation,
            completed: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn complete(mut self, result: Result<T, CacheError>) {
        self.completed = true;
        deliver(&self.cache, self.generation, result);
    }

    pub fn done(self, value: T) {
        self.complete(Ok(value))
    }

    pub fn fail(self, error: CacheError) {
        self.complete(Err(error))
    }
}

impl<T: Send + 'static> Drop for FetchToken<T> {
    fn drop(&mut self) {
        if !self.completed {
            deliver(&self.cache, self.generation, Err(CacheError::Abandoned));
        }
    }
}

impl<T: Send + 'static> fmt::Debug for FetchToken<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchToken")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

fn deliver<T: Send + 'static>(
    cache: &Weak<CacheInner<T>>,
    generation: u64,
    result: Result<T, CacheError>,
) {
    let Some(inner) = cache.upgrade() else {
        trace!(generation, "fetch completed after its cache was dropped");
        return;
    };
    let queue = inner.state.queue().clone();
    if queue.is_closed() && queue.is_dispatch_thread() {
        // last turns of a closing queue cannot schedule any more
        apply(&inner, generation, result);
        return;
    }
    // waiters are parked on this result, so it is settled even on a closed queue
    queue.settle(move || apply(&inner, generation, result));
}

fn apply<T: Send + 'static>(inner: &CacheInner<T>, generation: u64, result: Result<T, CacheError>) {
    let released = inner.state.with(|state| {
        if !matches!(state.status, Status::Fetching) || state.generation != generation {
            return None;
        }
        let wake = match result {
            Ok(value) => {
                state.status = Status::Valid(value);
                Wake::Valid
            }
            Err(error) => {
                state.status = Status::Invalid {
                    error: Some(error.clone()),
                };
                Wake::Failed(error)
            }
        };
        Some((mem::take(&mut state.waiters), wake))
    });

    match released {
        Some((waiters, wake)) => {
            trace!(cache = %inner.name, generation, ?wake, "fetch resolved");
            release(&inner.name, waiters, wake);
        }
        None => trace!(cache = %inner.name, generation, "discarding stale fetch response"),
    }
}

fn release(name: &str, waiters: Vec<Waiter>, wake: Wake) {
    for waiter in waiters {
        let wake = wake.clone();
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || waiter(wake))) {
            error!(cache = %name, "cache waiter panicked: {}", panic_message(panic.as_ref()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;
    use crate::dispatch::DispatchConfig;

    type Tokens<T> = Arc<Mutex<Vec<FetchToken<T>>>>;

    fn manual_cache(queue: &DispatchQueue) -> (DataCache<u32>, Tokens<u32>) {
        let tokens: Tokens<u32> = Arc::default();
        let t = tokens.clone();
        let cache = DataCache::new(queue, "value", move |token| t.lock().unwrap().push(token));
        (cache, tokens)
    }

    fn take_token(tokens: &Tokens<u32>) -> FetchToken<u32> {
        tokens.lock().unwrap().remove(0)
    }

    fn on<R: Send + 'static>(queue: &DispatchQueue, f: impl FnOnce() -> R + Send + 'static) -> R {
        queue.schedule_and_wait(f).unwrap()
    }

    #[test]
    fn fresh_cache_fetches_once_then_serves_the_value() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let (cache, tokens) = manual_cache(&queue);

        let c = cache.clone();
        assert!(!on(&queue, move || c.validate()));
        assert_eq!(tokens.lock().unwrap().len(), 1);

        take_token(&tokens).done(42);

        let c = cache.clone();
        assert_eq!(on(&queue, move || (c.validate(), c.data())), (true, Some(42)));
        assert!(tokens.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_validation_issues_a_single_fetch() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let (cache, tokens) = manual_cache(&queue);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (q, c) = (queue.clone(), cache.clone());
                std::thread::spawn(move || q.schedule_and_wait(move || c.validate()).unwrap())
            })
            .collect();
        for handle in handles {
            assert!(!handle.join().unwrap());
        }
        assert_eq!(tokens.lock().unwrap().len(), 1);
    }

    #[test]
    fn synchronous_completion_lands_on_a_later_turn() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let cache = DataCache::new(&queue, "sync", |token: FetchToken<u32>| token.done(7));
        let c = cache.clone();
        assert!(!on(&queue, move || c.validate()));
        let c = cache.clone();
        assert_eq!(on(&queue, move || (c.validate(), c.data())), (true, Some(7)));
    }

    #[test]
    fn disposal_releases_every_waiter() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let (cache, tokens) = manual_cache(&queue);
        let disposed = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let (c, d) = (cache.clone(), disposed.clone());
            on(&queue, move || {
                c.validate_with(move |wake| {
                    if matches!(wake, Wake::Disposed) {
                        d.fetch_add(1, Ordering::SeqCst);
                    }
                })
            });
        }
        let c = cache.clone();
        on(&queue, move || c.dispose());
        assert_eq!(disposed.load(Ordering::SeqCst), 3);

        // the late answer is ignored and the cache stays disposed
        take_token(&tokens).done(1);
        let c = cache.clone();
        let (valid, data, disposed) = on(&queue, move || (c.validate(), c.data(), c.is_disposed()));
        assert!(valid);
        assert_eq!(data, None);
        assert!(disposed);
    }

    #[test]
    fn superseded_response_does_not_corrupt_the_new_generation() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let (cache, tokens) = manual_cache(&queue);

        let c = cache.clone();
        on(&queue, move || {
            c.validate();
            c.reset();
            c.validate();
        });
        let old = take_token(&tokens);
        let new = take_token(&tokens);
        assert!(new.generation() > old.generation());

        new.done(2);
        old.done(1);
        let c = cache.clone();
        assert_eq!(on(&queue, move || c.data()), Some(2));
    }

    #[test]
    fn stale_response_arriving_first_is_dropped() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let (cache, tokens) = manual_cache(&queue);

        let c = cache.clone();
        on(&queue, move || {
            c.validate();
            c.reset();
            c.validate();
        });
        take_token(&tokens).done(1);
        let c = cache.clone();
        assert!(!on(&queue, move || c.validate()));

        take_token(&tokens).done(2);
        let c = cache.clone();
        assert_eq!(on(&queue, move || c.data()), Some(2));
    }

    #[test]
    fn failed_fetch_is_retried_on_next_validate() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let (cache, tokens) = manual_cache(&queue);
        let wakes = Arc::new(Mutex::new(Vec::new()));

        let (c, w) = (cache.clone(), wakes.clone());
        on(&queue, move || c.validate_with(move |wake| w.lock().unwrap().push(wake)));
        take_token(&tokens).fail(CacheError::transport("no such context"));

        let c = cache.clone();
        let (outcome, error) = on(&queue, move || (c.outcome(), c.error()));
        assert!(matches!(outcome, CacheOutcome::Failed(CacheError::Transport(_))));
        assert!(error.is_some());
        assert!(matches!(wakes.lock().unwrap()[..], [Wake::Failed(_)]));

        let c = cache.clone();
        assert!(!on(&queue, move || c.validate()));
        assert_eq!(tokens.lock().unwrap().len(), 1);
    }

    #[test]
    fn dropped_token_abandons_the_fetch() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let (cache, tokens) = manual_cache(&queue);
        let c = cache.clone();
        on(&queue, move || c.validate());
        drop(take_token(&tokens));

        let c = cache.clone();
        assert!(matches!(
            on(&queue, move || c.outcome()),
            CacheOutcome::Failed(CacheError::Abandoned)
        ));
    }

    #[test]
    fn reset_while_fetching_wakes_waiters_as_invalidated() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let (cache, _tokens) = manual_cache(&queue);
        let wakes = Arc::new(Mutex::new(Vec::new()));

        let (c, w) = (cache.clone(), wakes.clone());
        on(&queue, move || {
            c.validate_with(move |wake| w.lock().unwrap().push(wake));
            c.reset();
        });
        assert!(matches!(wakes.lock().unwrap()[..], [Wake::Invalidated]));
    }

    #[test]
    fn set_data_supersedes_the_fetch_in_flight() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let (cache, tokens) = manual_cache(&queue);

        let c = cache.clone();
        on(&queue, move || {
            c.validate();
            c.set_data(9);
        });
        take_token(&tokens).done(1);
        let c = cache.clone();
        assert_eq!(on(&queue, move || (c.validate(), c.data())), (true, Some(9)));
    }

    #[test]
    #[should_panic(expected = "illegal thread access")]
    fn validation_off_the_dispatch_thread_panics() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let (cache, _tokens) = manual_cache(&queue);
        cache.validate();
    }
}
