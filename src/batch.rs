use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{
    record::{EntryStatus, LogEntry, LogRecord, StatusData},
    store::{BatchHandle, BlobStatus, Identity},
};

pub const BATCH_DOCUMENT_VERSION: u32 = 1;

/// Wire payload for one flush: every record drained from the buffer, in
/// enqueue order, plus a checksum over them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDocument {
    pub version: u32,
    pub identity: Identity,
    pub checksum: String,
    pub records: Vec<LogRecord>,
}

#[derive(Debug)]
pub enum BatchDecodeError {
    SerdeJson(serde_json::Error),
    UnsupportedVersion(u32),
    ChecksumMismatch { expected: String, got: String },
}

impl std::fmt::Display for BatchDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported batch version {v}"),
            Self::ChecksumMismatch { expected, got } => {
                write!(f, "checksum mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for BatchDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SerdeJson(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for BatchDecodeError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

fn records_checksum(records: &[LogRecord]) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(records)?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(hex::encode(hasher.finalize()))
}

impl BatchDocument {
    pub fn new(identity: Identity, records: Vec<LogRecord>) -> Result<Self, serde_json::Error> {
        let checksum = records_checksum(&records)?;
        Ok(Self {
            version: BATCH_DOCUMENT_VERSION,
            identity,
            checksum,
            records,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BatchDecodeError> {
        let doc: Self = serde_json::from_slice(bytes)?;
        if doc.version != BATCH_DOCUMENT_VERSION {
            return Err(BatchDecodeError::UnsupportedVersion(doc.version));
        }
        let got = records_checksum(&doc.records)?;
        if got != doc.checksum {
            return Err(BatchDecodeError::ChecksumMismatch {
                expected: doc.checksum,
                got,
            });
        }
        Ok(doc)
    }
}

/// A batch the store accepted. `records` are the ones that went out in the
/// payload, in delivery order.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub handle: BatchHandle,
    pub records: Vec<LogRecord>,
    pub status: BlobStatus,
}

impl BatchResult {
    pub fn accepted(handle: BatchHandle, records: Vec<LogRecord>) -> Self {
        Self {
            handle,
            records,
            status: BlobStatus::Pending,
        }
    }

    /// One entry per record, stamped with the batch's current status.
    pub fn into_entries(self, now: DateTime<Utc>) -> impl Iterator<Item = LogEntry> {
        let Self {
            handle,
            records,
            status,
        } = self;
        records
            .into_iter()
            .map(move |r| entry_for(&handle, status, r.content, r.enqueued_at, now))
    }
}

pub(crate) fn entry_for(
    handle: &BatchHandle,
    status: BlobStatus,
    content: serde_json::Value,
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
) -> LogEntry {
    LogEntry {
        id: handle.clone(),
        content,
        timestamp,
        status: EntryStatus {
            kind: status,
            data: StatusData {
                handle: handle.clone(),
            },
            timestamp: now,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogLevel, LogOptions};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_records() -> Vec<LogRecord> {
        vec![
            LogRecord::new(json!("a"), LogOptions::default()),
            LogRecord::new(
                json!({ "step": 2, "ok": true }),
                LogOptions::level(LogLevel::Error)
                    .with_tag("agent")
                    .with_metadata("run", "r-1"),
            ),
        ]
    }

    #[test]
    fn decode_accepts_what_encode_produced() {
        let doc = BatchDocument::new(Identity::new("id-1"), sample_records()).unwrap();
        let bytes = doc.encode().unwrap();
        assert_eq!(BatchDocument::decode(&bytes).unwrap(), doc);
    }

    #[test]
    fn decode_rejects_tampered_records() {
        let doc = BatchDocument::new(Identity::new("id-1"), sample_records()).unwrap();
        let mut value = serde_json::to_value(&doc).unwrap();
        value["records"][0]["content"] = json!("b");
        let bytes = serde_json::to_vec(&value).unwrap();

        assert!(matches!(
            BatchDocument::decode(&bytes),
            Err(BatchDecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_unknown_versions() {
        let mut doc = BatchDocument::new(Identity::new("id-1"), Vec::new()).unwrap();
        doc.version = 9;
        let bytes = doc.encode().unwrap();
        assert!(matches!(
            BatchDocument::decode(&bytes),
            Err(BatchDecodeError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn entries_carry_handle_and_enqueue_time() {
        let records = sample_records();
        let mut batch = BatchResult::accepted(BatchHandle::new("job-1"), records.clone());
        batch.status = BlobStatus::Confirmed;
        let now = Utc::now();
        let entries: Vec<LogEntry> = batch.into_entries(now).collect();

        assert_eq!(entries.len(), 2);
        let entry = &entries[1];
        assert_eq!(entry.id, BatchHandle::new("job-1"));
        assert_eq!(entry.content, records[1].content);
        assert_eq!(entry.timestamp, records[1].enqueued_at);
        assert_eq!(entry.status.kind, BlobStatus::Confirmed);
        assert_eq!(entry.status.handle(), &BatchHandle::new("job-1"));
        assert_eq!(entry.status.timestamp, now);
    }

    #[test]
    fn float_content_survives_decode() {
        let records: Vec<LogRecord> = [0.10200000000000001, 0.1 + 0.2, 1.0 / 3.0, 2f64.sqrt()]
            .into_iter()
            .map(|v| {
                LogRecord::new(
                    json!({ "latency": v }),
                    LogOptions::default().with_metadata("ratio", v * 7.3),
                )
            })
            .collect();
        let doc = BatchDocument::new(Identity::new("id-1"), records).unwrap();

        let decoded = BatchDocument::decode(&doc.encode().unwrap()).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(decoded.records[0].content["latency"], json!(0.10200000000000001));
    }
}
