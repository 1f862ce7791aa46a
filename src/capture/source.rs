//! Capture sources
//!
//! A [`TrafficSource`] hands out `TrafficStream` records one at a time and
//! accepts a commit, keyed by an opaque per-record key, once a record's data
//! has been fully replayed or explicitly expired. The commit contract is
//! what lets a partitioned-log upstream advance its durable read position;
//! file-backed sources simply count commits.

use crate::capture::{codec, TrafficStream};
use crate::error::{ReplayError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Opaque identity of one upstream capture record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Which source produced the record (file path, partition name, ...).
    pub source: String,
    /// Position of the record within that source.
    pub offset: u64,
}

impl RecordKey {
    pub fn new(source: impl Into<String>, offset: u64) -> Self {
        Self {
            source: source.into(),
            offset,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.source, self.offset)
    }
}

/// A source of captured traffic records.
///
/// `read_next` has a single logical caller (the ingest loop); `commit` may be
/// invoked concurrently from replay completion paths.
#[async_trait]
pub trait TrafficSource: Send + Sync {
    /// Read the next record, or `None` when the capture is exhausted.
    async fn read_next(&self) -> Result<Option<TrafficStream>>;

    /// Release one record after its data has been fully replayed or expired.
    async fn commit(&self, key: &RecordKey) -> Result<()>;

    /// Number of records committed so far.
    fn committed_count(&self) -> u64;
}

/// Reads length-delimited records from any byte stream (file, stdin, ...).
pub struct FileTrafficSource {
    name: String,
    reader: Mutex<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
    next_offset: AtomicU64,
    committed: AtomicU64,
}

impl FileTrafficSource {
    pub fn new(name: impl Into<String>, reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            name: name.into(),
            reader: Mutex::new(BufReader::new(reader)),
            next_offset: AtomicU64::new(0),
            committed: AtomicU64::new(0),
        }
    }

    /// Open a capture file on disk.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            ReplayError::Source(format!("failed to open capture {}: {e}", path.display()))
        })?;
        Ok(Self::new(path.display().to_string(), Box::new(file)))
    }
}

#[async_trait]
impl TrafficSource for FileTrafficSource {
    async fn read_next(&self) -> Result<Option<TrafficStream>> {
        let mut reader = self.reader.lock().await;
        match codec::read_frame(&mut *reader).await? {
            Some(stream) => {
                let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);
                Ok(Some(
                    stream.with_record_key(RecordKey::new(self.name.clone(), offset)),
                ))
            }
            None => Ok(None),
        }
    }

    async fn commit(&self, key: &RecordKey) -> Result<()> {
        self.committed.fetch_add(1, Ordering::Relaxed);
        debug!(record = %key, "Committed capture record");
        Ok(())
    }

    fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }
}

/// In-memory source fed through a channel. Used by tests and embeddings;
/// commits are recorded so callers can observe release ordering.
pub struct ChannelTrafficSource {
    rx: Mutex<mpsc::Receiver<TrafficStream>>,
    next_offset: AtomicU64,
    committed: AtomicU64,
    committed_keys: parking_lot::Mutex<Vec<RecordKey>>,
}

impl ChannelTrafficSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<TrafficStream>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                rx: Mutex::new(rx),
                next_offset: AtomicU64::new(0),
                committed: AtomicU64::new(0),
                committed_keys: parking_lot::Mutex::new(Vec::new()),
            },
        )
    }

    /// Keys committed so far, in commit order.
    pub fn committed_keys(&self) -> Vec<RecordKey> {
        self.committed_keys.lock().clone()
    }
}

#[async_trait]
impl TrafficSource for ChannelTrafficSource {
    async fn read_next(&self) -> Result<Option<TrafficStream>> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(stream) => {
                let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);
                let key = stream
                    .record_key
                    .clone()
                    .unwrap_or_else(|| RecordKey::new("channel", offset));
                let mut stream = stream;
                stream.record_key = Some(key);
                Ok(Some(stream))
            }
            None => Ok(None),
        }
    }

    async fn commit(&self, key: &RecordKey) -> Result<()> {
        self.committed.fetch_add(1, Ordering::Relaxed);
        self.committed_keys.lock().push(key.clone());
        Ok(())
    }

    fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }
}
