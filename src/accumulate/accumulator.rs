//! Observation-to-transaction accumulator
//!
//! Drives a per-connection state machine over the observations in each
//! capture record, emitting callbacks as requests and full transactions are
//! reconstructed. The expiry registry bounds the working set: connections
//! whose observations stall fall out of the processing window and are
//! force-finalized through the same close path as an explicit premature
//! close, so no in-flight replay work is ever left waiting on a transaction
//! that will never complete.

use crate::accumulate::expiry::{ExpiringStreamMap, TouchOutcome};
use crate::accumulate::{Accumulation, AccumulationState, CompletionStatus, RequestResponsePair};
use crate::capture::source::RecordKey;
use crate::capture::{ConnectionKey, ObservationKind, TrafficStream};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A reconstructed request ready for replay scheduling.
#[derive(Debug, Clone)]
pub struct ReconstructedRequest {
    /// Request fragments in arrival order; packet boundaries preserved.
    pub chunks: Vec<Bytes>,
    pub first_timestamp_ms: i64,
    pub last_timestamp_ms: i64,
}

/// Callbacks fired by the accumulator as transactions take shape.
///
/// All callbacks fire synchronously on the ingest path, in stream order for
/// any one connection.
pub trait AccumulatorCallbacks: Send + Sync {
    /// A complete request was reconstructed for `connection` at
    /// `interaction_index`.
    fn on_request_received(
        &self,
        connection: &ConnectionKey,
        interaction_index: u64,
        request: ReconstructedRequest,
    );

    /// The response completed; the full pair is handed off.
    fn on_full_transaction(&self, pair: RequestResponsePair);

    /// The connection ended (exception, expiry, or shutdown flush) and its
    /// close consumes `interaction_index` as a unit of outbound work.
    fn on_connection_close(
        &self,
        connection: &ConnectionKey,
        interaction_index: u64,
        status: CompletionStatus,
        timestamp_ms: i64,
    );

    /// A capture record attached to an open accumulation; the record must
    /// not be released upstream until every pair carrying its key resolves.
    fn on_record_retained(&self, key: &RecordKey);

    /// Every observation in the record was rejected or ignored; the record
    /// can be released upstream immediately.
    fn on_stream_ignored(&self, key: &RecordKey);
}

/// Counters over the accumulator's lifetime.
#[derive(Debug, Default)]
pub struct AccumulatorStats {
    pub requests_reconstructed: AtomicU64,
    pub transactions_reconstructed: AtomicU64,
    pub forced_finalizations: AtomicU64,
    pub connections_expired: AtomicU64,
    pub invariant_violations: AtomicU64,
    pub out_of_order_drops: AtomicU64,
    pub unsupported_segments: AtomicU64,
}

/// Point-in-time snapshot of [`AccumulatorStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorStatsSnapshot {
    pub requests_reconstructed: u64,
    pub transactions_reconstructed: u64,
    pub forced_finalizations: u64,
    pub connections_expired: u64,
    pub invariant_violations: u64,
    pub out_of_order_drops: u64,
    pub unsupported_segments: u64,
}

impl AccumulatorStats {
    pub fn snapshot(&self) -> AccumulatorStatsSnapshot {
        AccumulatorStatsSnapshot {
            requests_reconstructed: self.requests_reconstructed.load(Ordering::Relaxed),
            transactions_reconstructed: self.transactions_reconstructed.load(Ordering::Relaxed),
            forced_finalizations: self.forced_finalizations.load(Ordering::Relaxed),
            connections_expired: self.connections_expired.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
            out_of_order_drops: self.out_of_order_drops.load(Ordering::Relaxed),
            unsupported_segments: self.unsupported_segments.load(Ordering::Relaxed),
        }
    }
}

struct LiveConnection {
    accumulation: Accumulation,
    /// Next connection-relative index to assign to a unit of outbound work.
    next_interaction: u64,
}

/// Consumes capture records and reconstructs HTTP transactions.
pub struct TrafficAccumulator {
    live: DashMap<ConnectionKey, LiveConnection>,
    expiry: ExpiringStreamMap,
    callbacks: Arc<dyn AccumulatorCallbacks>,
    stats: Arc<AccumulatorStats>,
}

impl TrafficAccumulator {
    pub fn new(expiry: ExpiringStreamMap, callbacks: Arc<dyn AccumulatorCallbacks>) -> Self {
        Self {
            live: DashMap::new(),
            expiry,
            callbacks,
            stats: Arc::new(AccumulatorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<AccumulatorStats> {
        self.stats.clone()
    }

    /// Number of connections with an open accumulation.
    pub fn open_count(&self) -> usize {
        self.live.len()
    }

    /// Feed one capture record through the state machine.
    pub fn accept(&self, stream: &TrafficStream) {
        let connection = stream.connection_key();
        let mut retained = false;

        for observation in &stream.observations {
            let ts = observation.timestamp_ms;
            match self.expiry.touch(&connection, ts) {
                TouchOutcome::Accepted { expired } => {
                    for key in expired {
                        self.expire_connection(&key, ts);
                    }
                }
                TouchOutcome::TooOld | TouchOutcome::Dead => {
                    self.stats.out_of_order_drops.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                TouchOutcome::RetriesExhausted => {
                    self.stats.out_of_order_drops.fetch_add(1, Ordering::Relaxed);
                    self.expire_connection(&connection, ts);
                    continue;
                }
            }

            retained |= self.apply(&connection, ts, &observation.kind, stream.record_key.as_ref());
        }

        if let Some(ref key) = stream.record_key {
            if !retained {
                self.callbacks.on_stream_ignored(key);
            }
        }
    }

    /// Flush every still-open accumulation through the premature-close path.
    /// Shutdown never silently drops data.
    pub fn close(&self) {
        let open: Vec<ConnectionKey> = self.live.iter().map(|e| e.key().clone()).collect();
        for connection in open {
            self.close_connection(&connection, CompletionStatus::ClosedPrematurely, None);
        }
    }

    /// Apply one observation; returns whether the record key was newly
    /// attached to an open accumulation.
    fn apply(
        &self,
        connection: &ConnectionKey,
        ts: i64,
        kind: &ObservationKind,
        record_key: Option<&RecordKey>,
    ) -> bool {
        match kind {
            ObservationKind::Read(data) => self.on_read(connection, ts, data.clone(), record_key),
            ObservationKind::Write(data) => self.on_write(connection, ts, data, record_key),
            ObservationKind::EndOfMessage => self.on_end_of_message(connection, ts),
            ObservationKind::ConnectionException(message) => {
                debug!(connection = %connection, message = %message, "Connection exception observed");
                self.close_connection(connection, CompletionStatus::ClosedPrematurely, Some(ts));
                false
            }
            ObservationKind::ReadSegment(_) | ObservationKind::WriteSegment(_) => {
                // Recognized but unimplemented: reassembly before a logical
                // boundary. Fatal to this accumulation only.
                warn!(connection = %connection, "Segmented observation is unsupported; dropping accumulation");
                self.stats.unsupported_segments.fetch_add(1, Ordering::Relaxed);
                self.close_connection(connection, CompletionStatus::ClosedPrematurely, Some(ts));
                false
            }
        }
    }

    fn on_read(
        &self,
        connection: &ConnectionKey,
        ts: i64,
        data: Bytes,
        record_key: Option<&RecordKey>,
    ) -> bool {
        // A Read while the previous transaction is still awaiting its final
        // response boundary means the client pipelined the next request on a
        // kept-alive connection: finalize the previous transaction first.
        let force_finalize = self
            .live
            .get(connection)
            .map(|live| live.accumulation.state == AccumulationState::RequestSent)
            .unwrap_or(false);
        if force_finalize {
            self.stats.forced_finalizations.fetch_add(1, Ordering::Relaxed);
            self.finalize_transaction(connection, CompletionStatus::ClosedNormally);
        }

        let mut live = self.live.entry(connection.clone()).or_insert_with(|| {
            let mut entry = LiveConnection {
                accumulation: Accumulation::new(0),
                next_interaction: 0,
            };
            entry.accumulation.interaction_index = entry.next_interaction;
            entry.next_interaction += 1;
            entry
        });
        let attached = match record_key {
            Some(key) => live.accumulation.attach_record(key),
            None => false,
        };
        live.accumulation.push_request_chunk(ts, data);
        drop(live);

        if attached {
            if let Some(key) = record_key {
                self.callbacks.on_record_retained(key);
            }
        }
        attached
    }

    fn on_write(
        &self,
        connection: &ConnectionKey,
        ts: i64,
        data: &Bytes,
        record_key: Option<&RecordKey>,
    ) -> bool {
        let Some(mut live) = self.live.get_mut(connection) else {
            // Response bytes with no request in sight: the capture violated
            // the one-response-follows-one-request shape.
            self.invariant_violation(connection, ts);
            return false;
        };
        if live.accumulation.state != AccumulationState::RequestSent {
            drop(live);
            self.invariant_violation(connection, ts);
            return false;
        }
        let attached = match record_key {
            Some(key) => live.accumulation.attach_record(key),
            None => false,
        };
        live.accumulation.push_response_chunk(ts, data);
        drop(live);

        if attached {
            if let Some(key) = record_key {
                self.callbacks.on_record_retained(key);
            }
        }
        attached
    }

    fn on_end_of_message(&self, connection: &ConnectionKey, ts: i64) -> bool {
        let Some(mut live) = self.live.get_mut(connection) else {
            // Boundary with nothing accumulated; nothing to do.
            return false;
        };
        match live.accumulation.state {
            AccumulationState::NothingSent => {
                if !live.accumulation.has_request_data() {
                    return false;
                }
                live.accumulation.state = AccumulationState::RequestSent;
                let request = ReconstructedRequest {
                    chunks: live.accumulation.request_chunks.clone(),
                    first_timestamp_ms: live.accumulation.request_first_ts.unwrap_or(ts),
                    last_timestamp_ms: live.accumulation.request_last_ts.unwrap_or(ts),
                };
                let index = live.accumulation.interaction_index;
                drop(live);
                self.stats.requests_reconstructed.fetch_add(1, Ordering::Relaxed);
                self.callbacks.on_request_received(connection, index, request);
                false
            }
            AccumulationState::RequestSent => {
                drop(live);
                self.finalize_transaction(connection, CompletionStatus::ClosedNormally);
                false
            }
            AccumulationState::ResponseSent => false,
        }
    }

    /// Finalize the open transaction normally and recycle the accumulation,
    /// keeping the connection's interaction counter running for keep-alive
    /// reuse.
    fn finalize_transaction(&self, connection: &ConnectionKey, status: CompletionStatus) {
        let Some(mut live) = self.live.get_mut(connection) else {
            return;
        };
        let next_index = live.next_interaction;
        live.next_interaction += 1;
        let finished = std::mem::replace(&mut live.accumulation, Accumulation::new(next_index));
        drop(live);

        self.stats
            .transactions_reconstructed
            .fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .on_full_transaction(finished.into_pair(connection.clone(), status));
    }

    /// Tear down a connection entirely: finalize any open accumulation with
    /// `status`, fire the close callback, release the expiry marker.
    fn close_connection(
        &self,
        connection: &ConnectionKey,
        status: CompletionStatus,
        timestamp_ms: Option<i64>,
    ) {
        let Some((_, live)) = self.live.remove(connection) else {
            self.expiry.remove(connection);
            return;
        };
        let close_ts = timestamp_ms
            .or(live.accumulation.response_last_ts)
            .or(live.accumulation.request_last_ts)
            .unwrap_or(0);

        let has_data =
            live.accumulation.has_request_data() || !live.accumulation.response_buffer.is_empty();
        // An empty accumulation never consumed its index; the close takes it
        // over so the session's index space stays dense.
        let close_index = if has_data {
            live.next_interaction
        } else {
            live.accumulation.interaction_index
        };
        if has_data {
            self.stats
                .transactions_reconstructed
                .fetch_add(1, Ordering::Relaxed);
            self.callbacks
                .on_full_transaction(live.accumulation.into_pair(connection.clone(), status));
        }
        self.callbacks
            .on_connection_close(connection, close_index, status, close_ts);
        self.expiry.remove(connection);
    }

    fn expire_connection(&self, connection: &ConnectionKey, ts: i64) {
        self.stats.connections_expired.fetch_add(1, Ordering::Relaxed);
        self.close_connection(connection, CompletionStatus::Expired, Some(ts));
    }

    fn invariant_violation(&self, connection: &ConnectionKey, ts: i64) {
        warn!(
            connection = %connection,
            "Write observed with no prior read; connection is unrecoverable"
        );
        self.stats.invariant_violations.fetch_add(1, Ordering::Relaxed);
        self.expiry.condemn(connection);
        self.close_connection(connection, CompletionStatus::ClosedPrematurely, Some(ts));
    }
}
