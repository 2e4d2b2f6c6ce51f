use std::{io, sync::Arc};

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The queue was shut down and rejects new work.
    #[error("dispatch queue `{0}` is closed")]
    QueueClosed(String),
    /// Work accepted by the queue never produced a value, because it panicked
    /// or the worker stopped before reaching it.
    #[error("scheduled work was abandoned before it completed")]
    WorkAbandoned,
    #[error("could not start the dispatch worker: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for DispatchError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}
