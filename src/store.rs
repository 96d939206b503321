use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opaque reference the remote store hands back for a submitted batch
/// (a job id / upload id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchHandle(String);

impl BatchHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Submitter identity on the data-availability network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobStatus {
    Pending,
    Confirmed,
    Failed,
}

impl BlobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    Http(reqwest::Error),
    Status { status: u16, body: String },
    Decode(String),
    Timeout(Duration),
    Rejected(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(err) => write!(f, "http error: {err}"),
            Self::Status { status, body } => write!(f, "unexpected status {status}: {body}"),
            Self::Decode(msg) => write!(f, "decode error: {msg}"),
            Self::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

/// Capability the batching core needs from the data-availability client.
///
/// Implementations own their connection and session lifecycle. The core
/// shares one instance across all flushes and never mutates it.
pub trait RemoteStore: Send + Sync + 'static {
    /// Acquires (or returns the cached) submitter identity. Idempotent.
    fn ensure_identity(&self) -> BoxFuture<'_, Result<Identity, StoreError>>;

    fn submit(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<BatchHandle, StoreError>>;

    fn get_status<'a>(
        &'a self,
        handle: &'a BatchHandle,
    ) -> BoxFuture<'a, Result<BlobStatus, StoreError>>;

    /// `Ok(None)` means the store has no batch under this handle.
    fn retrieve<'a>(
        &'a self,
        handle: &'a BatchHandle,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAttempt {
    pub payload: Vec<u8>,
    pub accepted: bool,
}

#[derive(Debug)]
struct MemoryInner {
    identity: Identity,
    identity_calls: u32,
    fail_identity: bool,
    fail_next_submits: u32,
    submit_delay: Option<Duration>,
    initial_status: BlobStatus,
    next_job: u64,
    attempts: Vec<SubmitAttempt>,
    blobs: BTreeMap<BatchHandle, (Vec<u8>, BlobStatus)>,
}

/// In-process store used for dry runs and tests. Supports failure injection.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                identity: Identity::new("memory"),
                identity_calls: 0,
                fail_identity: false,
                fail_next_submits: 0,
                submit_delay: None,
                initial_status: BlobStatus::Pending,
                next_job: 1,
                attempts: Vec::new(),
                blobs: BTreeMap::new(),
            }),
        }
    }

    /// Makes the next `n` submits fail. `u32::MAX` fails them all.
    pub async fn fail_next_submits(&self, n: u32) {
        self.inner.lock().await.fail_next_submits = n;
    }

    pub async fn fail_identity(&self, fail: bool) {
        self.inner.lock().await.fail_identity = fail;
    }

    pub async fn set_submit_delay(&self, delay: Option<Duration>) {
        self.inner.lock().await.submit_delay = delay;
    }

    pub async fn set_initial_status(&self, status: BlobStatus) {
        self.inner.lock().await.initial_status = status;
    }

    pub async fn set_status(&self, handle: &BatchHandle, status: BlobStatus) {
        if let Some(entry) = self.inner.lock().await.blobs.get_mut(handle) {
            entry.1 = status;
        }
    }

    pub async fn identity_calls(&self) -> u32 {
        self.inner.lock().await.identity_calls
    }

    pub async fn submit_attempts(&self) -> Vec<SubmitAttempt> {
        self.inner.lock().await.attempts.clone()
    }

    pub async fn handles(&self) -> Vec<BatchHandle> {
        self.inner.lock().await.blobs.keys().cloned().collect()
    }

    /// Overwrites the stored bytes for a handle.
    pub async fn corrupt(&self, handle: &BatchHandle, payload: Vec<u8>) {
        if let Some(entry) = self.inner.lock().await.blobs.get_mut(handle) {
            entry.0 = payload;
        }
    }
}

impl RemoteStore for MemoryStore {
    fn ensure_identity(&self) -> BoxFuture<'_, Result<Identity, StoreError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            inner.identity_calls = inner.identity_calls.saturating_add(1);
            if inner.fail_identity {
                return Err(StoreError::Rejected("identity bootstrap disabled".to_string()));
            }
            Ok(inner.identity.clone())
        })
    }

    fn submit(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<BatchHandle, StoreError>> {
        Box::pin(async move {
            let delay = self.inner.lock().await.submit_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut inner = self.inner.lock().await;
            if inner.fail_next_submits > 0 {
                if inner.fail_next_submits != u32::MAX {
                    inner.fail_next_submits -= 1;
                }
                inner.attempts.push(SubmitAttempt {
                    payload,
                    accepted: false,
                });
                return Err(StoreError::Status {
                    status: 503,
                    body: "injected failure".to_string(),
                });
            }

            let handle = BatchHandle::new(format!("job-{}", inner.next_job));
            inner.next_job += 1;
            inner.attempts.push(SubmitAttempt {
                payload: payload.clone(),
                accepted: true,
            });
            let status = inner.initial_status;
            inner.blobs.insert(handle.clone(), (payload, status));
            Ok(handle)
        })
    }

    fn get_status<'a>(
        &'a self,
        handle: &'a BatchHandle,
    ) -> BoxFuture<'a, Result<BlobStatus, StoreError>> {
        Box::pin(async move {
            self.inner
                .lock()
                .await
                .blobs
                .get(handle)
                .map(|(_, status)| *status)
                .ok_or_else(|| StoreError::Status {
                    status: 404,
                    body: format!("unknown handle {handle}"),
                })
        })
    }

    fn retrieve<'a>(
        &'a self,
        handle: &'a BatchHandle,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .await
                .blobs
                .get(handle)
                .map(|(payload, _)| payload.clone()))
        })
    }
}
