use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell, mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::{
    batch::{BatchDocument, entry_for},
    batcher::Pending,
    error::AdapterError,
    flush::{Control, FlushOptions, FlushStats, ShutdownFlushError, spawn_flush_task},
    record::{EntryStatus, LogCompletion, LogEntry, LogLevel, LogOptions, LogRecord},
    store::{BatchHandle, BlobStatus, Identity, RemoteStore},
};

struct Running {
    identity: Identity,
    closing: AtomicBool,
    records: mpsc::UnboundedSender<Pending>,
    control: mpsc::UnboundedSender<Control>,
    stats: watch::Receiver<FlushStats>,
    task: Mutex<Option<tokio::task::JoinHandle<Result<(), ShutdownFlushError>>>>,
}

/// Logging façade over a data-availability store.
///
/// Records are buffered and submitted in batches by a background task, either
/// when `max_buffer_size` records are pending or every `flush_interval`.
/// Failed submits are retried on the next interval. Call `shutdown` to flush
/// what is left and learn whether it made it.
pub struct DaLogger {
    store: Arc<dyn RemoteStore>,
    options: FlushOptions,
    running: OnceCell<Running>,
}

impl DaLogger {
    pub fn new(store: Arc<dyn RemoteStore>, options: FlushOptions) -> Self {
        Self {
            store,
            options,
            running: OnceCell::new(),
        }
    }

    /// Bootstraps the submitter identity and starts the flush task.
    /// Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<(), AdapterError> {
        self.running
            .get_or_try_init(|| async {
                let identity = self
                    .store
                    .ensure_identity()
                    .await
                    .map_err(AdapterError::NotReady)?;
                info!(identity = %identity, "adapter initialized");
                let handle =
                    spawn_flush_task(self.store.clone(), identity.clone(), self.options.clone());
                Ok::<_, AdapterError>(Running {
                    identity,
                    closing: AtomicBool::new(false),
                    records: handle.records,
                    control: handle.control,
                    stats: handle.stats,
                    task: Mutex::new(Some(handle.task)),
                })
            })
            .await?;
        Ok(())
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.running.get().map(|r| &r.identity)
    }

    fn running(&self) -> Result<&Running, AdapterError> {
        self.running.get().ok_or(AdapterError::NotInitialized)
    }

    /// Buffers one record and returns its completion without waiting for
    /// the flush. Only fails on local preconditions.
    pub fn log(
        &self,
        content: impl Into<Value>,
        options: LogOptions,
    ) -> Result<LogCompletion, AdapterError> {
        let running = self.running()?;
        if running.closing.load(Ordering::SeqCst) {
            return Err(AdapterError::ShuttingDown);
        }

        let record = LogRecord::new(content.into(), options);
        let (tx, completion) = LogCompletion::channel(record.id.clone());
        running
            .records
            .send(Pending::new(record, tx))
            .map_err(|_| AdapterError::ShuttingDown)?;
        Ok(completion)
    }

    fn log_at(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<LogCompletion, AdapterError> {
        let options = LogOptions {
            level: Some(level),
            metadata: metadata.unwrap_or_default(),
            ..Default::default()
        };
        self.log(Value::String(message.into()), options)
    }

    pub fn info(
        &self,
        message: impl Into<String>,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<LogCompletion, AdapterError> {
        self.log_at(LogLevel::Info, message, metadata)
    }

    pub fn warn(
        &self,
        message: impl Into<String>,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<LogCompletion, AdapterError> {
        self.log_at(LogLevel::Warn, message, metadata)
    }

    pub fn error(
        &self,
        message: impl Into<String>,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<LogCompletion, AdapterError> {
        self.log_at(LogLevel::Error, message, metadata)
    }

    pub fn debug(
        &self,
        message: impl Into<String>,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<LogCompletion, AdapterError> {
        self.log_at(LogLevel::Debug, message, metadata)
    }

    /// Flushes now, ignoring any pending retry wait. Returns how many
    /// records were submitted.
    pub async fn flush(&self) -> Result<usize, AdapterError> {
        let running = self.running()?;
        let (reply, rx) = oneshot::channel();
        running
            .control
            .send(Control::Flush { reply })
            .map_err(|_| AdapterError::Closed)?;
        let submitted = rx.await.map_err(|_| AdapterError::Closed)??;
        Ok(submitted)
    }

    /// Polls the store once for the batch behind `status`.
    pub async fn check_availability(&self, status: &EntryStatus) -> bool {
        match self.store.get_status(status.handle()).await {
            Ok(current) => current == BlobStatus::Confirmed,
            Err(err) => {
                warn!(%err, handle = %status.handle(), "availability check failed");
                false
            }
        }
    }

    /// Reads a batch straight from the store, bypassing the buffer.
    ///
    /// The entry's content is the batch's records in delivery order. Missing,
    /// unreadable and corrupt batches all come back as `None`.
    pub async fn get_log_entry(&self, id: &str) -> Result<Option<LogEntry>, AdapterError> {
        self.running()?;
        let handle = BatchHandle::new(id);

        let bytes = match self.store.retrieve(&handle).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(%err, handle = %handle, "retrieve failed");
                return Ok(None);
            }
        };
        let doc = match BatchDocument::decode(&bytes) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%err, handle = %handle, "stored batch is unreadable");
                return Ok(None);
            }
        };

        let status = match self.store.get_status(&handle).await {
            Ok(status) => status,
            Err(err) => {
                warn!(%err, handle = %handle, "status lookup failed");
                BlobStatus::Pending
            }
        };
        let now = Utc::now();
        let timestamp = doc.records.first().map_or(now, |r| r.enqueued_at);
        let content = match serde_json::to_value(&doc.records) {
            Ok(content) => content,
            Err(err) => {
                warn!(%err, handle = %handle, "stored records do not convert to json");
                return Ok(None);
            }
        };
        Ok(Some(entry_for(&handle, status, content, timestamp, now)))
    }

    pub fn stats(&self) -> FlushStats {
        self.running
            .get()
            .map(|r| r.stats.borrow().clone())
            .unwrap_or_default()
    }

    /// Stops accepting records, performs one final flush and stops the timer.
    ///
    /// Errors only if that final flush fails; the error names the records
    /// that were not delivered. Later calls return `Ok(())`.
    pub async fn shutdown(&self) -> Result<(), AdapterError> {
        let Some(running) = self.running.get() else {
            return Ok(());
        };
        running.closing.store(true, Ordering::SeqCst);

        let Some(task) = running.task.lock().await.take() else {
            return Ok(());
        };
        let _ = running.control.send(Control::Shutdown);
        match task.await {
            Ok(result) => {
                result?;
                info!("adapter shut down");
                Ok(())
            }
            Err(err) => {
                warn!(%err, "flush task ended abnormally");
                Err(AdapterError::Closed)
            }
        }
    }
}
