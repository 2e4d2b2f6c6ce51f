//! Blocking bridge from foreign threads to work on the dispatch queue.
//!
//! A [`Task`] body runs on the dispatch thread and may run many times: each
//! run validates the caches it depends on and returns early when one of them
//! is still fetching. The task parks itself on that cache and runs the body
//! again from the top once the cache resolves. Bodies must therefore be
//! idempotent up to the point where they complete.

use std::{
    cell::Cell,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use tracing::{trace, warn};

use crate::{
    cache::{DataCache, Wake},
    dispatch::{panic_message, Confined, DispatchError, DispatchQueue},
};

mod error;
mod outcome;

pub use error::TaskError;
use outcome::OutcomeSlot;

type Body<T> = Box<dyn FnMut(&mut TaskContext<T>) + Send + 'static>;

thread_local! {
    static INTERACTIVE: Cell<bool> = Cell::new(false);
}

/// Marks the current thread as interactive (a UI or event thread).
/// [`Task::get_io`] refuses to block such threads.
pub fn mark_interactive_thread() {
    INTERACTIVE.with(|flag| flag.set(true));
}

pub fn is_interactive_thread() -> bool {
    INTERACTIVE.with(Cell::get)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// A run of the body is scheduled or in progress.
    CheckDeps,
    /// The last run found a dependency fetching and parked on it.
    Waiting,
    /// All dependencies were valid; the result is owed by a completer.
    Compute,
    Done,
}

struct RunState<T: Send + 'static> {
    body: Option<Body<T>>,
    step: Step,
    run_id: u64,
    /// A dependency resolved while the body was running.
    rerun: bool,
}

struct TaskShared<T: Send + 'static> {
    queue: DispatchQueue,
    slot: OutcomeSlot<T>,
    run: Confined<RunState<T>>,
}

impl<T: Clone + Send + 'static> TaskShared<T> {
    /// Resolves the task on the dispatch thread and releases the body.
    fn finish(&self, outcome: Result<T, TaskError>) -> bool {
        if !self.slot.set(outcome) {
            return false;
        }
        self.release_body();
        true
    }

    fn release_body(&self) {
        let body = self.run.with(|run| {
            run.step = Step::Done;
            run.body.take()
        });
        drop(body);
    }
}

/// A result computed on the dispatch queue that any other thread can wait for.
pub struct Task<T: Send + 'static> {
    shared: Arc<TaskShared<T>>,
}

impl<T: Send + 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("queue", &self.shared.queue.name())
            .field("done", &self.shared.slot.is_set())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Schedules the first run of `body` on `queue`.
    ///
    /// If the queue refuses the work the task resolves immediately with
    /// [`TaskError::Dispatch`].
    pub fn spawn<F>(queue: &DispatchQueue, body: F) -> Self
    where
        F: FnMut(&mut TaskContext<T>) + Send + 'static,
    {
        let shared = Arc::new(TaskShared {
            queue: queue.clone(),
            slot: OutcomeSlot::new(),
            run: Confined::new(
                queue,
                RunState {
                    body: Some(Box::new(body)),
                    step: Step::CheckDeps,
                    run_id: 0,
                    rerun: false,
                },
            ),
        });
        schedule_step(&shared);
        Self { shared }
    }

    /// Blocks until the task resolves. Reading a resolved task again returns
    /// the same outcome.
    pub fn get(&self) -> Result<T, TaskError> {
        if self.shared.queue.is_dispatch_thread() {
            return Err(TaskError::DispatchThread);
        }
        self.shared.slot.wait()
    }

    /// Like [`get`](Self::get) but gives up after `timeout`. The body is not
    /// stopped: whatever it does afterwards still happens, and a later `get`
    /// observes its result.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        if self.shared.queue.is_dispatch_thread() {
            return Err(TaskError::DispatchThread);
        }
        self.shared
            .slot
            .wait_timeout(timeout)
            .unwrap_or(Err(TaskError::TimedOut(timeout)))
    }

    /// Like [`get`](Self::get), for callers that must never block an
    /// interactive thread.
    pub fn get_io(&self) -> Result<T, TaskError> {
        if is_interactive_thread() {
            return Err(TaskError::InteractiveThread);
        }
        self.get()
    }

    pub fn try_get(&self) -> Option<Result<T, TaskError>> {
        self.shared.slot.peek()
    }

    pub fn is_done(&self) -> bool {
        self.shared.slot.is_set()
    }

    /// Resolves the task with [`TaskError::Cancelled`] unless it already has
    /// an outcome. A body that completes later has its result discarded.
    ///
    /// The outcome is assigned on the dispatch thread, so a foreign caller
    /// blocks for one turn of the queue. Once the queue no longer runs work
    /// the outcome is assigned directly.
    pub fn cancel(&self) -> bool {
        let shared = self.shared.clone();
        if self.shared.queue.is_dispatch_thread() {
            return shared.finish(Err(TaskError::Cancelled));
        }
        match self
            .shared
            .queue
            .schedule_and_wait(move || shared.finish(Err(TaskError::Cancelled)))
        {
            Ok(cancelled) => cancelled,
            Err(e) => {
                trace!("cancelling without the dispatch queue: {e}");
                self.shared.slot.set(Err(TaskError::Cancelled))
            }
        }
    }
}

/// Handed to every run of a task body.
pub struct TaskContext<T: Send + 'static> {
    shared: Arc<TaskShared<T>>,
    run_id: u64,
    waiting: bool,
}

impl<T: Clone + Send + 'static> TaskContext<T> {
    /// Validates a dependency. When this returns false the body should return;
    /// it runs again once `cache` resolves. If the pending fetch fails, the
    /// task resolves with [`TaskError::Dependency`] instead.
    pub fn validate<U>(&mut self, cache: &DataCache<U>) -> bool
    where
        U: Clone + Send + 'static,
    {
        let shared = self.shared.clone();
        let run_id = self.run_id;
        let name = cache.name().to_owned();
        let valid = cache.validate_with(move |wake| on_wake(&shared, run_id, name, wake));
        if !valid {
            self.waiting = true;
        }
        valid
    }

    pub fn done(&mut self, value: T) {
        self.finish(Ok(value));
    }

    pub fn error(&mut self, error: TaskError) {
        self.finish(Err(error));
    }

    /// A handle that resolves the task later, from a callback on any thread.
    pub fn completer(&self) -> TaskCompleter<T> {
        TaskCompleter {
            shared: self.shared.clone(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.shared.slot.is_set()
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.shared.queue
    }

    fn finish(&mut self, outcome: Result<T, TaskError>) {
        // the body is checked out for this run; `run_step` drops it afterwards
        if !self.shared.slot.set(outcome) {
            trace!("task already resolved, result discarded");
        }
    }
}

/// Resolves a task from outside its body. Cloneable; the first completion wins.
pub struct TaskCompleter<T: Send + 'static> {
    shared: Arc<TaskShared<T>>,
}

impl<T: Send + 'static> Clone for TaskCompleter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> TaskCompleter<T> {
    pub fn done(&self, value: T) {
        self.complete(Ok(value))
    }

    pub fn error(&self, error: TaskError) {
        self.complete(Err(error))
    }

    /// Applies `outcome` on the dispatch thread, marshalling there if needed.
    pub fn complete(&self, outcome: Result<T, TaskError>) {
        if self.shared.queue.is_dispatch_thread() {
            self.shared.finish(outcome);
            return;
        }
        let shared = self.shared.clone();
        if let Err(e) = self.shared.queue.schedule(move || {
            shared.finish(outcome);
        }) {
            self.shared.slot.set(Err(e.into()));
        }
    }
}

fn on_wake<T: Clone + Send + 'static>(
    shared: &Arc<TaskShared<T>>,
    run_id: u64,
    cache: String,
    wake: Wake,
) {
    if shared.slot.is_set() {
        return;
    }
    if let Wake::Failed(source) = wake {
        trace!(%cache, "task dependency failed");
        shared.finish(Err(TaskError::Dependency { cache, source }));
        return;
    }
    let resume = shared.run.with(|run| {
        if run.run_id != run_id {
            return false;
        }
        match run.step {
            Step::Waiting => {
                run.step = Step::CheckDeps;
                true
            }
            Step::CheckDeps => {
                run.rerun = true;
                false
            }
            Step::Compute | Step::Done => false,
        }
    });
    if resume {
        schedule_step(shared);
    }
}

/// A scheduled run. If the queue drops it unrun, the task resolves with the
/// reason instead of leaving its callers parked.
struct Resume<T: Clone + Send + 'static> {
    shared: Option<Arc<TaskShared<T>>>,
}

impl<T: Clone + Send + 'static> Resume<T> {
    fn run(mut self) {
        if let Some(shared) = self.shared.take() {
            run_step(&shared);
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Resume<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let error = if shared.queue.is_closed() {
                DispatchError::QueueClosed(shared.queue.name().to_owned())
            } else {
                DispatchError::WorkAbandoned
            };
            shared.slot.set(Err(error.into()));
        }
    }
}

fn schedule_step<T: Clone + Send + 'static>(shared: &Arc<TaskShared<T>>) {
    let resume = Resume {
        shared: Some(shared.clone()),
    };
    if let Err(e) = shared.queue.schedule(move || resume.run()) {
        warn!("task could not be scheduled: {e}");
    }
}

fn run_step<T: Clone + Send + 'static>(shared: &Arc<TaskShared<T>>) {
    if shared.slot.is_set() {
        shared.release_body();
        return;
    }
    let checked_out = shared.run.with(|run| {
        run.run_id += 1;
        run.rerun = false;
        run.step = Step::CheckDeps;
        run.body.take().map(|body| (body, run.run_id))
    });
    let Some((mut body, run_id)) = checked_out else {
        return;
    };

    let mut ctx = TaskContext {
        shared: shared.clone(),
        run_id,
        waiting: false,
    };
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| body(&mut ctx))) {
        let message = panic_message(panic.as_ref());
        warn!("task body panicked: {message}");
        shared.slot.set(Err(TaskError::Panicked(message)));
    }

    if shared.slot.is_set() {
        shared.run.with(|run| run.step = Step::Done);
        drop(body);
        return;
    }
    let waiting = ctx.waiting;
    let again = shared.run.with(move |run| {
        run.body = Some(body);
        if !waiting {
            run.step = Step::Compute;
            false
        } else if run.rerun {
            run.step = Step::CheckDeps;
            true
        } else {
            run.step = Step::Waiting;
            false
        }
    });
    if again {
        schedule_step(shared);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        thread,
    };

    use super::*;
    use crate::{
        cache::{CacheError, FetchToken},
        dispatch::DispatchConfig,
    };

    type Tokens = Arc<Mutex<Vec<FetchToken<u32>>>>;

    fn queue() -> DispatchQueue {
        DispatchQueue::new(DispatchConfig::default()).unwrap()
    }

    fn manual_cache(queue: &DispatchQueue, name: &str) -> (DataCache<u32>, Tokens) {
        let tokens: Tokens = Arc::default();
        let t = tokens.clone();
        let cache = DataCache::new(queue, name, move |token| t.lock().unwrap().push(token));
        (cache, tokens)
    }

    fn wait_for_fetch(tokens: &Tokens) -> FetchToken<u32> {
        loop {
            if let Some(token) = tokens.lock().unwrap().pop() {
                return token;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn immediate_result_is_read_repeatedly() {
        let queue = queue();
        let task = Task::spawn(&queue, |ctx| ctx.done(5));
        assert_eq!(task.get().unwrap(), 5);
        assert_eq!(task.get().unwrap(), 5);
        assert!(task.is_done());
        assert!(matches!(task.try_get(), Some(Ok(5))));
    }

    #[test]
    fn body_reruns_once_its_dependency_resolves() {
        let queue = queue();
        let (cache, tokens) = manual_cache(&queue, "state");
        let runs = Arc::new(AtomicUsize::new(0));

        let (c, r) = (cache.clone(), runs.clone());
        let task = Task::spawn(&queue, move |ctx| {
            r.fetch_add(1, Ordering::SeqCst);
            if !ctx.validate(&c) {
                return;
            }
            ctx.done(c.data().unwrap_or_default() * 2);
        });

        wait_for_fetch(&tokens).done(21);
        assert_eq!(task.get().unwrap(), 42);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn chained_dependencies_are_fetched_in_turn() {
        let queue = queue();
        let (first, first_tokens) = manual_cache(&queue, "first");
        let (second, second_tokens) = manual_cache(&queue, "second");

        let (a, b) = (first.clone(), second.clone());
        let task = Task::spawn(&queue, move |ctx| {
            if !ctx.validate(&a) || !ctx.validate(&b) {
                return;
            }
            ctx.done(a.data().unwrap_or_default() + b.data().unwrap_or_default());
        });

        wait_for_fetch(&first_tokens).done(1);
        wait_for_fetch(&second_tokens).done(2);
        assert_eq!(task.get().unwrap(), 3);
    }

    #[test]
    fn failed_dependency_fails_the_task() {
        let queue = queue();
        let (cache, tokens) = manual_cache(&queue, "registers");
        let c = cache.clone();
        let task: Task<u32> = Task::spawn(&queue, move |ctx| {
            if ctx.validate(&c) {
                ctx.done(0);
            }
        });

        wait_for_fetch(&tokens).fail(CacheError::ChannelClosed);
        match task.get() {
            Err(TaskError::Dependency { cache, source }) => {
                assert_eq!(cache, "registers");
                assert!(matches!(source, CacheError::ChannelClosed));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn panicking_body_surfaces_as_error() {
        let queue = queue();
        let task: Task<()> = Task::spawn(&queue, |_| panic!("bad state"));
        match task.get() {
            Err(TaskError::Panicked(message)) => assert_eq!(message, "bad state"),
            other => panic!("unexpected outcome {other:?}"),
        }
        // the worker survived
        assert_eq!(queue.schedule_and_wait(|| 1).unwrap(), 1);
    }

    #[test]
    fn get_on_the_dispatch_thread_fails_fast() {
        let queue = queue();
        let task = Task::spawn(&queue, |ctx| ctx.done(1));
        let t = task.clone();
        let result = queue.schedule_and_wait(move || t.get()).unwrap();
        assert!(matches!(result, Err(TaskError::DispatchThread)));
    }

    #[test]
    fn timed_out_wait_leaves_the_body_running() {
        let queue = queue();
        let (cache, tokens) = manual_cache(&queue, "slow");
        let c = cache.clone();
        let task = Task::spawn(&queue, move |ctx| {
            if ctx.validate(&c) {
                ctx.done(c.data().unwrap_or_default());
            }
        });

        assert!(matches!(
            task.get_timeout(Duration::from_millis(20)),
            Err(TaskError::TimedOut(_))
        ));
        assert!(!task.is_done());

        wait_for_fetch(&tokens).done(8);
        assert_eq!(task.get_timeout(Duration::from_secs(5)).unwrap(), 8);
    }

    #[test]
    fn cancel_discards_a_later_result() {
        let queue = queue();
        let (cache, tokens) = manual_cache(&queue, "never");
        let c = cache.clone();
        let task = Task::spawn(&queue, move |ctx| {
            if ctx.validate(&c) {
                ctx.done(1);
            }
        });
        let token = wait_for_fetch(&tokens);

        assert!(task.cancel());
        assert!(!task.cancel());
        token.done(1);
        queue.schedule_and_wait(|| ()).unwrap();
        assert!(matches!(task.get(), Err(TaskError::Cancelled)));
    }

    #[test]
    fn cancel_releases_the_body_before_returning() {
        let queue = queue();
        let (cache, tokens) = manual_cache(&queue, "parked");
        let held = Arc::new(());
        let (c, h) = (cache.clone(), held.clone());
        let task = Task::spawn(&queue, move |ctx| {
            let _held = &h;
            if ctx.validate(&c) {
                ctx.done(1);
            }
        });
        let _token = wait_for_fetch(&tokens);

        assert!(task.cancel());
        assert_eq!(Arc::strong_count(&held), 1);
        assert!(matches!(task.try_get(), Some(Err(TaskError::Cancelled))));
    }

    #[test]
    fn cancel_after_shutdown_still_resolves() {
        let queue = queue();
        let (cache, tokens) = manual_cache(&queue, "orphaned");
        let c = cache.clone();
        let task = Task::spawn(&queue, move |ctx| {
            if ctx.validate(&c) {
                ctx.done(1);
            }
        });
        let _token = wait_for_fetch(&tokens);
        queue.shutdown();
        queue.join();

        assert!(task.cancel());
        assert!(!task.cancel());
        assert!(matches!(task.get(), Err(TaskError::Cancelled)));
    }

    #[test]
    fn get_io_refuses_interactive_threads() {
        let queue = queue();
        let task = Task::spawn(&queue, |ctx| ctx.done(3));
        let t = task.clone();
        let refused = thread::spawn(move || {
            mark_interactive_thread();
            t.get_io()
        })
        .join()
        .unwrap();
        assert!(matches!(refused, Err(TaskError::InteractiveThread)));
        assert_eq!(task.get_io().unwrap(), 3);
    }

    #[test]
    fn completer_resolves_from_another_thread() {
        let queue = queue();
        let task = Task::spawn(&queue, |ctx| {
            let completer = ctx.completer();
            thread::spawn(move || completer.done("remote"));
        });
        assert_eq!(task.get().unwrap(), "remote");
    }

    #[test]
    fn closed_queue_resolves_new_tasks() {
        let queue = queue();
        queue.shutdown();
        queue.join();
        let task = Task::spawn(&queue, |ctx| ctx.done(()));
        assert!(matches!(
            task.get(),
            Err(TaskError::Dispatch(DispatchError::QueueClosed(_)))
        ));
    }
}
