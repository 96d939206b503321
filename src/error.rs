use crate::{
    flush::{FlushError, ShutdownFlushError},
    store::StoreError,
};

#[derive(Debug)]
pub enum AdapterError {
    /// `initialize` has not completed yet.
    NotInitialized,
    /// `shutdown` has begun; no new records are accepted.
    ShuttingDown,
    /// Identity bootstrap failed during `initialize`.
    NotReady(StoreError),
    Flush(FlushError),
    ShutdownFlush(ShutdownFlushError),
    /// The flush task is gone.
    Closed,
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "adapter not initialized"),
            Self::ShuttingDown => write!(f, "adapter is shutting down: not accepting new records"),
            Self::NotReady(e) => write!(f, "adapter not ready: {e}"),
            Self::Flush(e) => write!(f, "{e}"),
            Self::ShutdownFlush(e) => write!(f, "{e}"),
            Self::Closed => write!(f, "flush task stopped unexpectedly"),
        }
    }
}

impl std::error::Error for AdapterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NotReady(e) => Some(e),
            Self::Flush(e) => Some(e),
            Self::ShutdownFlush(e) => Some(e),
            Self::NotInitialized | Self::ShuttingDown | Self::Closed => None,
        }
    }
}

impl From<FlushError> for AdapterError {
    fn from(value: FlushError) -> Self {
        Self::Flush(value)
    }
}

impl From<ShutdownFlushError> for AdapterError {
    fn from(value: ShutdownFlushError) -> Self {
        Self::ShutdownFlush(value)
    }
}
