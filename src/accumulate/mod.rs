//! Transaction reconstruction
//!
//! Turns the stream of timestamped observations for each connection into
//! discrete request/response pairs. The accumulator owns one mutable
//! [`Accumulation`] per live connection; the expiry registry bounds how long
//! a stalled connection may keep one alive.

pub mod accumulator;
pub mod expiry;

pub use accumulator::{
    AccumulatorCallbacks, AccumulatorStats, AccumulatorStatsSnapshot, ReconstructedRequest,
    TrafficAccumulator,
};
pub use expiry::{BehavioralPolicy, DefaultBehavioralPolicy, ExpiringStreamMap, TouchOutcome};

use crate::capture::source::RecordKey;
use crate::capture::ConnectionKey;
use bytes::{Bytes, BytesMut};
use serde::Serialize;

/// How a reconstructed transaction (or its connection) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// Response completed with an explicit end-of-message boundary, or the
    /// boundary was implied by the next pipelined request.
    ClosedNormally,
    /// The connection closed (exception, shutdown flush) with the
    /// transaction still open.
    ClosedPrematurely,
    /// The connection's session was reassigned mid-flight.
    Reassigned,
    /// The connection fell behind the processing window and was evicted.
    Expired,
}

/// Per-connection assembly state.
///
/// Read observations are legal only in `NothingSent`, Write only in
/// `RequestSent`; the walk is monotonic and the record is recycled after
/// finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationState {
    NothingSent,
    RequestSent,
    ResponseSent,
}

/// Mutable per-connection record assembling one request and its response.
///
/// Owned exclusively by the accumulator while keyed in its registry; its
/// finalized form is handed off (moved, not shared) as a
/// [`RequestResponsePair`].
#[derive(Debug)]
pub struct Accumulation {
    pub state: AccumulationState,
    /// Request fragments in arrival order; packet boundaries preserved.
    pub request_chunks: Vec<Bytes>,
    pub request_first_ts: Option<i64>,
    pub request_last_ts: Option<i64>,
    pub response_buffer: BytesMut,
    pub response_first_ts: Option<i64>,
    pub response_last_ts: Option<i64>,
    /// Connection-relative sequence number of this unit of work.
    pub interaction_index: u64,
    /// Capture records contributing observations to this accumulation.
    pub record_keys: Vec<RecordKey>,
}

impl Accumulation {
    pub fn new(interaction_index: u64) -> Self {
        Self {
            state: AccumulationState::NothingSent,
            request_chunks: Vec::new(),
            request_first_ts: None,
            request_last_ts: None,
            response_buffer: BytesMut::new(),
            response_first_ts: None,
            response_last_ts: None,
            interaction_index,
            record_keys: Vec::new(),
        }
    }

    pub fn push_request_chunk(&mut self, ts: i64, data: Bytes) {
        self.request_first_ts.get_or_insert(ts);
        self.request_last_ts = Some(ts);
        self.request_chunks.push(data);
    }

    pub fn push_response_chunk(&mut self, ts: i64, data: &[u8]) {
        self.response_first_ts.get_or_insert(ts);
        self.response_last_ts = Some(ts);
        self.response_buffer.extend_from_slice(data);
    }

    pub fn attach_record(&mut self, key: &RecordKey) -> bool {
        if self.record_keys.contains(key) {
            return false;
        }
        self.record_keys.push(key.clone());
        true
    }

    pub fn has_request_data(&self) -> bool {
        !self.request_chunks.is_empty()
    }

    /// Consume this accumulation into its finalized pair.
    pub fn into_pair(self, connection: ConnectionKey, status: CompletionStatus) -> RequestResponsePair {
        let request = self.request_chunks.iter().fold(
            BytesMut::with_capacity(self.request_chunks.iter().map(Bytes::len).sum()),
            |mut buf, chunk| {
                buf.extend_from_slice(chunk);
                buf
            },
        );
        RequestResponsePair {
            connection,
            interaction_index: self.interaction_index,
            request: request.freeze(),
            request_first_ts: self.request_first_ts,
            request_last_ts: self.request_last_ts,
            response: self.response_buffer.freeze(),
            response_first_ts: self.response_first_ts,
            response_last_ts: self.response_last_ts,
            status,
            record_keys: self.record_keys,
        }
    }
}

/// Finalized request+response byte sequences with their timestamps,
/// connection identity and completion status.
#[derive(Debug, Clone)]
pub struct RequestResponsePair {
    pub connection: ConnectionKey,
    pub interaction_index: u64,
    pub request: Bytes,
    pub request_first_ts: Option<i64>,
    pub request_last_ts: Option<i64>,
    pub response: Bytes,
    pub response_first_ts: Option<i64>,
    pub response_last_ts: Option<i64>,
    pub status: CompletionStatus,
    pub record_keys: Vec<RecordKey>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulation_concatenates_in_arrival_order() {
        let mut acc = Accumulation::new(3);
        acc.push_request_chunk(10, Bytes::from_static(b"GET / "));
        acc.push_request_chunk(12, Bytes::from_static(b"HTTP/1.1\r\n\r\n"));
        acc.state = AccumulationState::RequestSent;
        acc.push_response_chunk(20, b"HTTP/1.1 200");
        acc.push_response_chunk(21, b" OK\r\n\r\n");

        let pair = acc.into_pair(
            ConnectionKey::new("n", "c"),
            CompletionStatus::ClosedNormally,
        );
        assert_eq!(&pair.request[..], b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(&pair.response[..], b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(pair.interaction_index, 3);
        assert_eq!(pair.request_first_ts, Some(10));
        assert_eq!(pair.response_last_ts, Some(21));
    }

    #[test]
    fn test_attach_record_dedups() {
        let mut acc = Accumulation::new(0);
        let key = RecordKey::new("s", 7);
        assert!(acc.attach_record(&key));
        assert!(!acc.attach_record(&key));
        assert_eq!(acc.record_keys.len(), 1);
    }
}
