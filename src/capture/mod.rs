//! Captured traffic data model
//!
//! A capture is a sequence of `TrafficStream` records, each carrying the
//! timestamped read/write/control observations recorded on one source
//! connection. Records from many concurrent connections arrive interleaved
//! and possibly out of order; reconstruction into HTTP transactions happens
//! downstream in the accumulator.

pub mod codec;
pub mod gate;
pub mod source;

pub use gate::BlockingTrafficSource;
pub use source::{ChannelTrafficSource, FileTrafficSource, RecordKey, TrafficSource};

use bytes::Bytes;
use std::fmt;

/// Identity of one captured source connection: the node (or partition) the
/// capture was taken on plus the connection id within that node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub node_id: String,
    pub connection_id: String,
}

impl ConnectionKey {
    pub fn new(node_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            connection_id: connection_id.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id, self.connection_id)
    }
}

/// One timestamped event observed on a source connection.
///
/// `Read` is data the source service received (a request fragment), `Write`
/// is data it sent back (a response fragment). The segment variants mark
/// fragments that were captured before a logical message boundary could be
/// established; they are recognized but reassembly is not implemented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationKind {
    Read(Bytes),
    Write(Bytes),
    ReadSegment(Bytes),
    WriteSegment(Bytes),
    EndOfMessage,
    ConnectionException(String),
}

/// A single observation: what happened and when (ms since epoch, capture clock).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub timestamp_ms: i64,
    pub kind: ObservationKind,
}

impl Observation {
    pub fn read(timestamp_ms: i64, data: impl Into<Bytes>) -> Self {
        Self {
            timestamp_ms,
            kind: ObservationKind::Read(data.into()),
        }
    }

    pub fn write(timestamp_ms: i64, data: impl Into<Bytes>) -> Self {
        Self {
            timestamp_ms,
            kind: ObservationKind::Write(data.into()),
        }
    }

    pub fn end_of_message(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            kind: ObservationKind::EndOfMessage,
        }
    }

    pub fn connection_exception(timestamp_ms: i64, message: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            kind: ObservationKind::ConnectionException(message.into()),
        }
    }
}

/// One capture record: an ordered run of observations for one connection.
///
/// `record_key` is present when the record came from a source that requires
/// an explicit commit once the record's data has been fully replayed or
/// expired; plain file sources leave it set as well so commit bookkeeping is
/// uniform.
#[derive(Debug, Clone)]
pub struct TrafficStream {
    pub node_id: String,
    pub connection_id: String,
    pub observations: Vec<Observation>,
    pub record_key: Option<RecordKey>,
}

impl TrafficStream {
    pub fn new(
        node_id: impl Into<String>,
        connection_id: impl Into<String>,
        observations: Vec<Observation>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            connection_id: connection_id.into(),
            observations,
            record_key: None,
        }
    }

    pub fn with_record_key(mut self, key: RecordKey) -> Self {
        self.record_key = Some(key);
        self
    }

    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey::new(self.node_id.clone(), self.connection_id.clone())
    }

    /// Largest observation timestamp in this record, if any.
    pub fn max_timestamp_ms(&self) -> Option<i64> {
        self.observations.iter().map(|o| o.timestamp_ms).max()
    }
}
