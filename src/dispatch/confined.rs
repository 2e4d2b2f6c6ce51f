use std::sync::{Mutex, PoisonError, TryLockError};

use super::DispatchQueue;

/// State that may only be touched on the dispatch thread.
///
/// The mutex is never contended: only the dispatch worker ever takes it. It
/// exists so the owner can be shared with foreign threads as a handle. Access
/// from any other thread, or re-entrant access from inside [`Confined::with`],
/// is a programming error and panics instead of deadlocking.
///
/// Once the worker has stopped there is no dispatch thread left, and the state
/// passes to whichever thread settles the queue's last completions.
pub struct Confined<T> {
    queue: DispatchQueue,
    state: Mutex<T>,
}

impl<T> Confined<T> {
    pub fn new(queue: &DispatchQueue, value: T) -> Self {
        Self {
            queue: queue.clone(),
            state: Mutex::new(value),
        }
    }

    /// Runs `f` with exclusive access to the state.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        if !self.queue.is_dispatch_thread() && self.queue.is_stopped() {
            let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            return f(&mut guard);
        }
        self.queue.assert_dispatch_thread();
        let mut guard = match self.state.try_lock() {
            Ok(guard) => guard,
            // a panic in an earlier turn was already reported by the worker
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                panic!("re-entrant access to dispatch-confined state")
            }
        };
        f(&mut guard)
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchConfig;

    #[test]
    fn access_on_dispatch_thread() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let confined = std::sync::Arc::new(Confined::new(&queue, 1u32));
        let c = confined.clone();
        let value = queue
            .schedule_and_wait(move || {
                c.with(|v| *v += 1);
                c.with(|v| *v)
            })
            .unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    #[should_panic(expected = "illegal thread access")]
    fn access_off_dispatch_thread_panics() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let confined = Confined::new(&queue, ());
        confined.with(|_| ());
    }

    #[test]
    fn stopped_queue_hands_state_to_the_caller() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let confined = Confined::new(&queue, 1u32);
        queue.shutdown();
        queue.join();
        assert!(queue.is_stopped());
        assert_eq!(confined.with(|v| *v + 1), 2);
    }

    #[test]
    fn reentrant_access_is_reported() {
        let queue = DispatchQueue::new(DispatchConfig::default()).unwrap();
        let confined = std::sync::Arc::new(Confined::new(&queue, 0u32));
        let c = confined.clone();
        let result = queue.schedule_and_wait(move || c.with(|_| c.with(|v| *v)));
        // the panic is caught by the worker and the waiter is released
        assert!(matches!(result, Err(crate::DispatchError::WorkAbandoned)));
    }
}
