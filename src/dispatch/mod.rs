use std::{
    any::Any,
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use futures::channel::oneshot;
use tokio::sync::mpsc;
use tracing::{debug, debug_span, error, trace, warn};
use typed_builder::TypedBuilder;

mod confined;
mod error;

pub use confined::Confined;
pub use error::DispatchError;

type Work = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Work),
    RunAfter(Duration, Work),
    Shutdown,
}

/// What happens to work scheduled after [`DispatchQueue::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// `schedule` fails with [`DispatchError::QueueClosed`].
    #[default]
    Reject,
    /// `schedule` succeeds but the work is dropped without running.
    Discard,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct DispatchConfig {
    /// Name of the worker thread, also used in log output.
    #[builder(default = String::from("dispatch"), setter(into))]
    pub name: String,
    #[builder(default)]
    pub shutdown_policy: ShutdownPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The single serialized execution context that owns all protocol state.
///
/// Work runs strictly in the order it was scheduled, one unit at a time, on
/// one dedicated thread. The queue is a cheap handle and can be cloned into
/// every component that needs to marshal onto the dispatch thread.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    policy: ShutdownPolicy,
    tx: mpsc::UnboundedSender<Command>,
    thread: ThreadId,
    closed: AtomicBool,
    leftovers: Arc<Mutex<Leftovers>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Work settled after the channel stopped accepting it.
#[derive(Default)]
struct Leftovers {
    work: Vec<Work>,
    stopped: bool,
}

impl DispatchQueue {
    /// Starts the dispatch worker.
    ///
    /// The worker owns a current-thread tokio runtime, which only drives
    /// delayed work; everything else is plain closures drained in FIFO order.
    pub fn new(config: DispatchConfig) -> Result<Self, DispatchError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let timer_tx = tx.clone();
        let name = config.name.clone();
        let leftovers = Arc::new(Mutex::new(Leftovers::default()));
        let pending = leftovers.clone();
        let worker = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                let span = debug_span!("dispatch", queue = %name);
                let _guard = span.enter();
                runtime.block_on(drain(rx, timer_tx));
                run_leftovers(&pending);
                debug!("dispatch worker stopped");
            })?;

        Ok(Self {
            inner: Arc::new(Inner {
                name: config.name,
                policy: config.shutdown_policy,
                tx,
                thread: worker.thread().id(),
                closed: AtomicBool::new(false),
                leftovers,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    /// Panics unless called on this queue's dispatch thread.
    #[track_caller]
    pub fn assert_dispatch_thread(&self) {
        assert!(
            self.is_dispatch_thread(),
            "illegal thread access: thread `{}` is not the dispatch thread of queue `{}`",
            thread::current().name().unwrap_or("<unnamed>"),
            self.inner.name,
        );
    }

    /// Appends `work` to the queue.
    pub fn schedule<F>(&self, work: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Command::Run(Box::new(work)))
    }

    /// Appends `work` to the queue once `delay` has elapsed.
    pub fn schedule_after<F>(&self, delay: Duration, work: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Command::RunAfter(delay, Box::new(work)))
    }

    /// Runs `work` on the dispatch thread and blocks until it has finished.
    ///
    /// On the dispatch thread itself `work` runs immediately, in place.
    pub fn schedule_and_wait<F, R>(&self, work: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_dispatch_thread() {
            return Ok(work());
        }
        let (tx, rx) = oneshot::channel();
        self.schedule(move || {
            let _ = tx.send(work());
        })?;
        futures::executor::block_on(rx).map_err(|_| DispatchError::WorkAbandoned)
    }

    /// Closes the queue. Work accepted before this call still runs.
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(queue = %self.inner.name, "shutting down dispatch queue");
            let _ = self.inner.tx.send(Command::Shutdown);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// True once the worker has run its last unit of work and exited.
    pub fn is_stopped(&self) -> bool {
        self.inner
            .leftovers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stopped
    }

    /// Runs `work` on the dispatch thread, regardless of the shutdown policy.
    ///
    /// For completions that release parked waiters and therefore must never
    /// be dropped. On a closed queue the work runs before the worker exits;
    /// once the worker is gone it runs right here, and dispatch-confined
    /// state is handed to the calling thread for the duration.
    pub(crate) fn settle<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut work: Work = Box::new(work);
        if !self.is_closed() {
            match self.inner.tx.send(Command::Run(work)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(Command::Run(returned))) => work = returned,
                Err(_) => return,
            }
        }
        let mut leftovers = self
            .inner
            .leftovers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !leftovers.stopped {
            leftovers.work.push(work);
            return;
        }
        drop(leftovers);
        trace!(queue = %self.inner.name, "settling work after the worker stopped");
        run(work);
    }

    /// Waits for the worker thread to exit after [`shutdown`](Self::shutdown).
    pub fn join(&self) {
        if self.is_dispatch_thread() {
            warn!(queue = %self.inner.name, "dispatch thread cannot join itself");
            return;
        }
        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!(queue = %self.inner.name, "dispatch worker terminated abnormally");
            }
        }
    }

    fn submit(&self, command: Command) -> Result<(), DispatchError> {
        if self.is_closed() {
            return self.refuse();
        }
        match self.inner.tx.send(command) {
            Ok(()) => Ok(()),
            Err(_) => self.refuse(),
        }
    }

    fn refuse(&self) -> Result<(), DispatchError> {
        match self.inner.policy {
            ShutdownPolicy::Reject => {
                warn!(queue = %self.inner.name, "rejected work scheduled on a closed queue");
                Err(DispatchError::QueueClosed(self.inner.name.clone()))
            }
            ShutdownPolicy::Discard => {
                trace!(queue = %self.inner.name, "discarded work scheduled on a closed queue");
                Ok(())
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.tx.send(Command::Shutdown);
        }
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<Command>, tx: mpsc::UnboundedSender<Command>) {
    debug!("dispatch worker started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::Run(work) => run(work),
            Command::RunAfter(delay, work) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(Command::Run(work)).is_err() {
                        trace!("delayed work dropped, queue already stopped");
                    }
                });
            }
            Command::Shutdown => break,
        }
    }

    // anything that raced the shutdown command was accepted and still runs
    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let Command::Run(work) = command {
            run(work);
        }
    }
}

fn run_leftovers(leftovers: &Mutex<Leftovers>) {
    loop {
        let batch = {
            let mut leftovers = leftovers.lock().unwrap_or_else(PoisonError::into_inner);
            if leftovers.work.is_empty() {
                leftovers.stopped = true;
                return;
            }
            mem::take(&mut leftovers.work)
        };
        trace!(count = batch.len(), "settling leftover work");
        batch.into_iter().for_each(run);
    }
}

fn run(work: Work) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(work)) {
        error!("dispatched work panicked: {}", panic_message(panic.as_ref()));
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}
