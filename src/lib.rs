pub mod adapter;
pub mod backoff;
pub mod batch;
mod batcher;
pub mod config;
pub mod eigenda;
pub mod error;
pub mod flush;
pub mod id;
pub mod record;
pub mod store;
pub mod version;

pub use adapter::DaLogger;
pub use error::AdapterError;
pub use flush::{FlushOptions, FlushStats};
pub use record::{LogCompletion, LogEntry, LogLevel, LogOptions};
pub use store::{BatchHandle, BlobStatus, RemoteStore};
