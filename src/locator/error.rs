use thiserror::Error;

use crate::task::TaskError;

#[derive(Debug, Clone, Error)]
pub enum RosterError {
    #[error("roster has been disposed")]
    Disposed,
    /// The call could not be carried over to the dispatch thread.
    #[error(transparent)]
    Task(#[from] TaskError),
}
