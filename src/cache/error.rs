use std::sync::Arc;

use thiserror::Error;

/// Why a fetch did not produce a value.
///
/// A failed fetch leaves the cache invalid; the next `validate()` tries again.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The remote side answered with an error, or the I/O failed.
    #[error("transport error: {0}")]
    Transport(Arc<str>),
    #[error("channel closed")]
    ChannelClosed,
    /// The fetch token was dropped without being completed.
    #[error("fetch abandoned before it completed")]
    Abandoned,
}

impl CacheError {
    pub fn transport(message: impl AsRef<str>) -> Self {
        Self::Transport(Arc::from(message.as_ref()))
    }
}
