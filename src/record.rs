use std::{
    collections::{BTreeMap, BTreeSet},
    future::IntoFuture,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    id::new_record_id,
    store::{BatchHandle, BlobStatus, BoxFuture},
};

#[derive(
    clap::ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogOptions {
    pub level: Option<LogLevel>,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl LogOptions {
    pub fn level(level: LogLevel) -> Self {
        Self {
            level: Some(level),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Local correlation id. Not durable; the batch handle is.
    pub id: String,
    pub level: LogLevel,
    pub content: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(content: Value, options: LogOptions) -> Self {
        Self {
            id: new_record_id(),
            level: options.level.unwrap_or_default(),
            content,
            metadata: options.metadata,
            tags: options.tags,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusData {
    pub handle: BatchHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStatus {
    #[serde(rename = "type")]
    pub kind: BlobStatus,
    pub data: StatusData,
    pub timestamp: DateTime<Utc>,
}

impl EntryStatus {
    pub fn handle(&self) -> &BatchHandle {
        &self.data.handle
    }
}

/// What a caller's completion resolves to: the record's content addressed by
/// the handle of the batch that carried it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: BatchHandle,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// Dropped after exhausting `max_retries` submit attempts.
    Undeliverable { attempts: u32 },
    /// The store accepted the batch but later reported it failed.
    BatchFailed { handle: BatchHandle },
    ConfirmationTimeout { handle: BatchHandle },
    /// The final flush during shutdown failed.
    ShutdownFlushFailed,
    /// The adapter went away without resolving this record.
    Closed,
}

impl std::fmt::Display for CompletionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undeliverable { attempts } => {
                write!(f, "record undeliverable after {attempts} submit attempts")
            }
            Self::BatchFailed { handle } => write!(f, "batch {handle} reported failed"),
            Self::ConfirmationTimeout { handle } => {
                write!(f, "batch {handle} was not confirmed in time")
            }
            Self::ShutdownFlushFailed => write!(f, "final flush during shutdown failed"),
            Self::Closed => write!(f, "adapter closed before the record was delivered"),
        }
    }
}

impl std::error::Error for CompletionError {}

pub(crate) type CompletionResult = Result<LogEntry, CompletionError>;
pub(crate) type CompletionSender = oneshot::Sender<CompletionResult>;

/// One-shot handle returned by `DaLogger::log`.
///
/// Resolves once the batch carrying the record has been accepted by the
/// remote store. If submits keep failing, no `max_retries` is configured and
/// `shutdown` is never called, this never resolves.
#[derive(Debug)]
pub struct LogCompletion {
    record_id: String,
    rx: oneshot::Receiver<CompletionResult>,
}

impl LogCompletion {
    pub(crate) fn channel(record_id: impl Into<String>) -> (CompletionSender, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                record_id: record_id.into(),
                rx,
            },
        )
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    /// Non-blocking check; `None` while the record is still in flight.
    pub fn try_result(&mut self) -> Option<Result<LogEntry, CompletionError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CompletionError::Closed)),
        }
    }

    pub async fn wait(self) -> Result<LogEntry, CompletionError> {
        self.rx.await.unwrap_or(Err(CompletionError::Closed))
    }
}

impl IntoFuture for LogCompletion {
    type Output = Result<LogEntry, CompletionError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
