use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::{cache::CacheError, dispatch::DispatchError};

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Reported by the body itself through `TaskContext::error`.
    #[error("{0}")]
    Body(Arc<str>),
    #[error("dependency `{cache}` failed: {source}")]
    Dependency {
        cache: String,
        #[source]
        source: CacheError,
    },
    #[error("task body panicked: {0}")]
    Panicked(String),
    #[error("task was cancelled")]
    Cancelled,
    /// Only the wait was abandoned; the body keeps running on the queue.
    #[error("no result after {0:?}")]
    TimedOut(Duration),
    #[error("blocking on a task from its own dispatch thread would deadlock")]
    DispatchThread,
    #[error("blocking on a task from an interactive thread")]
    InteractiveThread,
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl TaskError {
    pub fn body(message: impl AsRef<str>) -> Self {
        Self::Body(Arc::from(message.as_ref()))
    }
}
