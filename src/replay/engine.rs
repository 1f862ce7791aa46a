//! Replay engine
//!
//! Top-level glue: wires the accumulator's callbacks to orchestrator
//! scheduling, advances the ingestion watermark with replay progress, and is
//! the single place that commits upstream capture records once every
//! transaction touching a record has fully resolved (or been force-expired).

use crate::accumulate::accumulator::{
    AccumulatorCallbacks, ReconstructedRequest, TrafficAccumulator,
};
use crate::accumulate::expiry::{DefaultBehavioralPolicy, ExpiringStreamMap, ExpiryConfig};
use crate::accumulate::{CompletionStatus, RequestResponsePair};
use crate::capture::source::RecordKey;
use crate::capture::{BlockingTrafficSource, ConnectionKey};
use crate::config::ReplayerConfig;
use crate::error::{ReplayError, Result};
use crate::output::{ReplayOutcome, ResultSink};
use crate::replay::clock::TimeShifter;
use crate::replay::limiter::AdmissionLimiter;
use crate::replay::orchestrator::{
    OrchestratorConfig, RequestSenderOrchestrator, RetryPolicy, TargetResult,
};
use crate::replay::pool::{ClientConnectionPool, PoolConfig};
use crate::replay::session::{SessionKey, UniqueRequestKey};
use crate::transform::{RequestTransformFactory, TransformContext};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Aggregate counters over one replay run.
#[derive(Debug, Default)]
pub struct ReplayStats {
    pub records_read: AtomicU64,
    pub requests_scheduled: AtomicU64,
    pub transactions_succeeded: AtomicU64,
    pub transactions_failed: AtomicU64,
    pub transactions_expired: AtomicU64,
    pub dropped_by_shutdown: AtomicU64,
    pub target_retries: AtomicU64,
    pub records_committed: AtomicU64,
}

/// Point-in-time snapshot of [`ReplayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStatsSnapshot {
    pub records_read: u64,
    pub requests_scheduled: u64,
    pub transactions_succeeded: u64,
    pub transactions_failed: u64,
    pub transactions_expired: u64,
    pub dropped_by_shutdown: u64,
    pub target_retries: u64,
    pub records_committed: u64,
}

impl ReplayStats {
    pub fn snapshot(&self) -> ReplayStatsSnapshot {
        ReplayStatsSnapshot {
            records_read: self.records_read.load(Ordering::Relaxed),
            requests_scheduled: self.requests_scheduled.load(Ordering::Relaxed),
            transactions_succeeded: self.transactions_succeeded.load(Ordering::Relaxed),
            transactions_failed: self.transactions_failed.load(Ordering::Relaxed),
            transactions_expired: self.transactions_expired.load(Ordering::Relaxed),
            dropped_by_shutdown: self.dropped_by_shutdown.load(Ordering::Relaxed),
            target_retries: self.target_retries.load(Ordering::Relaxed),
            records_committed: self.records_committed.load(Ordering::Relaxed),
        }
    }
}

/// Both halves of one transaction's replay: the reconstructed source pair
/// and the settled target result. Whichever side finishes last emits the
/// output tuple.
enum TxnSlot {
    /// Source pair arrived; replay is still in flight (or was never
    /// scheduled, in which case the slot is finalized immediately).
    SourceOnly(Box<RequestResponsePair>),
    /// Target replay settled before the source pair was finalized.
    TargetOnly(TargetResult),
}

struct EngineShared {
    run_id: String,
    config: ReplayerConfig,
    gate: Arc<BlockingTrafficSource>,
    sink: Arc<dyn ResultSink>,
    transform: Arc<dyn RequestTransformFactory>,
    orchestrator: Arc<RequestSenderOrchestrator>,
    limiter: Arc<AdmissionLimiter>,
    pool: Arc<ClientConnectionPool>,
    /// Current session incarnation per source connection.
    incarnations: DashMap<ConnectionKey, u64>,
    /// Requests handed to the orchestrator and not yet emitted.
    scheduled: DashMap<UniqueRequestKey, ()>,
    /// Requests scheduled but not yet joined with their source pair.
    pending: DashMap<UniqueRequestKey, TxnSlot>,
    /// Outstanding replay references per upstream record.
    record_refs: DashMap<RecordKey, u64>,
    outstanding: AtomicU64,
    idle: Notify,
    shutdown: Notify,
    shutting_down: AtomicBool,
    fatal: parking_lot::Mutex<Option<String>>,
    stats: Arc<ReplayStats>,
}

impl EngineShared {
    fn session_key(&self, connection: &ConnectionKey) -> SessionKey {
        let session_number = self
            .incarnations
            .get(connection)
            .map(|e| *e.value())
            .unwrap_or(0);
        SessionKey {
            connection: connection.clone(),
            session_number,
            generation: 0,
        }
    }

    fn spawn_tracked<F>(self: &Arc<Self>, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let shared = self.clone();
        tokio::spawn(async move {
            fut.await;
            if shared.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                shared.idle.notify_waiters();
            }
        });
    }

    fn escalate(&self, message: String) {
        error!(error = %message, "Unrecoverable failure; shutting replay down");
        *self.fatal.lock() = Some(message);
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    /// Join one half of a transaction with the other; emit once both are in.
    async fn complete_half(
        self: &Arc<Self>,
        key: UniqueRequestKey,
        half: TxnSlot,
    ) {
        use dashmap::mapref::entry::Entry;
        let joined = match self.pending.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(half);
                None
            }
            Entry::Occupied(slot) => {
                let (_, existing) = slot.remove_entry();
                match (existing, half) {
                    (TxnSlot::SourceOnly(pair), TxnSlot::TargetOnly(target))
                    | (TxnSlot::TargetOnly(target), TxnSlot::SourceOnly(pair)) => {
                        Some((pair, Some(target)))
                    }
                    // Duplicate halves cannot happen: the accumulator emits
                    // one pair per index and the scheduler one settle.
                    (existing, _) => {
                        warn!(request = %key, "Duplicate transaction half; keeping first");
                        match existing {
                            TxnSlot::SourceOnly(pair) => Some((pair, None)),
                            TxnSlot::TargetOnly(_) => None,
                        }
                    }
                }
            }
        };
        if let Some((pair, target)) = joined {
            self.emit_outcome(&key, *pair, target).await;
        }
    }

    /// A source pair that never had (and never will have) target work.
    async fn complete_unscheduled(self: &Arc<Self>, key: UniqueRequestKey, pair: RequestResponsePair) {
        self.emit_outcome(&key, pair, None).await;
    }

    async fn emit_outcome(
        self: &Arc<Self>,
        key: &UniqueRequestKey,
        pair: RequestResponsePair,
        target: Option<TargetResult>,
    ) {
        let (attempts, target_error) = match target {
            Some(result) => (result.attempts, result.error),
            None => (Vec::new(), None),
        };

        match pair.status {
            CompletionStatus::Expired => {
                self.stats.transactions_expired.fetch_add(1, Ordering::Relaxed);
            }
            _ if target_error.is_some() => {
                self.stats.transactions_failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stats
                    .transactions_succeeded
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        if attempts.len() > 1 {
            self.stats
                .target_retries
                .fetch_add(attempts.len() as u64 - 1, Ordering::Relaxed);
        }

        let outcome = ReplayOutcome {
            run_id: self.run_id.clone(),
            node_id: pair.connection.node_id.clone(),
            connection_id: pair.connection.connection_id.clone(),
            session_number: key.session.session_number,
            interaction_index: pair.interaction_index,
            status: pair.status,
            source_request_b64: ReplayOutcome::encode_payload(&pair.request),
            source_response_b64: ReplayOutcome::encode_payload(&pair.response),
            source_first_timestamp_ms: pair.request_first_ts,
            source_last_timestamp_ms: pair.response_last_ts.or(pair.request_last_ts),
            target_attempts: attempts,
            error: target_error,
        };
        if let Err(e) = self.sink.accept(outcome).await {
            // The sink is the product of the run; losing it is unrecoverable.
            self.escalate(format!("result sink failed: {e}"));
        }

        self.scheduled.remove(key);
        // This transaction is resolved; replay progress moves the read
        // watermark forward.
        if let Some(ts) = pair.response_last_ts.or(pair.request_last_ts) {
            self.gate.stop_reads_past(ts);
        }
        for record in &pair.record_keys {
            self.release_record(record).await;
        }
    }

    /// Drop one replay reference on a record; commit upstream at zero.
    async fn release_record(self: &Arc<Self>, record: &RecordKey) {
        let committed = match self.record_refs.entry(record.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if *slot.get() <= 1 {
                    slot.remove();
                    true
                } else {
                    *slot.get_mut() -= 1;
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(_) => true,
        };
        if committed {
            self.commit_record(record).await;
        }
    }

    async fn commit_record(self: &Arc<Self>, record: &RecordKey) {
        match self.gate.commit(record).await {
            Ok(()) => {
                self.stats.records_committed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(record = %record, error = %e, "Failed to commit capture record");
            }
        }
    }
}

struct EngineCallbacks {
    shared: Arc<EngineShared>,
}

impl AccumulatorCallbacks for EngineCallbacks {
    fn on_request_received(
        &self,
        connection: &ConnectionKey,
        interaction_index: u64,
        request: ReconstructedRequest,
    ) {
        let shared = self.shared.clone();
        let key = UniqueRequestKey {
            session: shared.session_key(connection),
            interaction_index,
        };
        shared.scheduled.insert(key.clone(), ());
        shared.stats.requests_scheduled.fetch_add(1, Ordering::Relaxed);

        let ctx = TransformContext {
            connection: connection.clone(),
            interaction_index,
        };
        let shared_for_task = shared.clone();
        shared.spawn_tracked(async move {
            let shared = shared_for_task;
            // Preparation runs in parallel across sessions; ordering is
            // restored by the sequencer at send time.
            let mut transform = shared.transform.create(&ctx);
            for chunk in &request.chunks {
                transform.consume(chunk);
            }
            let transformed = match transform.finalize() {
                Ok(t) => t,
                Err(e) => {
                    warn!(request = %key, error = %e, "Request transform failed");
                    let target = TargetResult {
                        attempts: Vec::new(),
                        error: Some(e.to_string()),
                    };
                    shared.complete_half(key, TxnSlot::TargetOnly(target)).await;
                    return;
                }
            };

            // Packets are paced to span the same capture interval the
            // original request spanned.
            let span_ms = request.last_timestamp_ms - request.first_timestamp_ms;
            let interval_ms = if transformed.packets.len() > 1 {
                span_ms / (transformed.packets.len() as i64 - 1).max(1)
            } else {
                0
            };

            let target = match shared
                .orchestrator
                .schedule_request(
                    &key,
                    request.first_timestamp_ms,
                    interval_ms,
                    transformed.packets,
                )
                .await
            {
                Ok(result) => result,
                Err(ReplayError::ShuttingDown) | Err(ReplayError::SessionCancelled) => {
                    shared.stats.dropped_by_shutdown.fetch_add(1, Ordering::Relaxed);
                    TargetResult {
                        attempts: Vec::new(),
                        error: Some(ReplayError::ShuttingDown.to_string()),
                    }
                }
                Err(e) => {
                    if e.is_unrecoverable() {
                        shared.escalate(e.to_string());
                    }
                    TargetResult {
                        attempts: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
            // The wire work for this capture instant has settled; ingestion
            // may read one window further ahead.
            shared.gate.stop_reads_past(request.last_timestamp_ms);
            shared.complete_half(key, TxnSlot::TargetOnly(target)).await;
        });
    }

    fn on_full_transaction(&self, pair: RequestResponsePair) {
        let shared = self.shared.clone();
        let key = UniqueRequestKey {
            session: shared.session_key(&pair.connection),
            interaction_index: pair.interaction_index,
        };

        // A pair whose request never completed was never handed to the
        // orchestrator; settle it directly and keep the session's index
        // space dense with an empty unit of work.
        let scheduled = shared.scheduled.contains_key(&key);

        let shared_for_task = shared.clone();
        shared.spawn_tracked(async move {
            let shared = shared_for_task;
            if scheduled {
                shared.complete_half(key, TxnSlot::SourceOnly(Box::new(pair))).await;
            } else {
                if let Err(e) = shared.orchestrator.schedule_skip(&key).await {
                    debug!(request = %key, error = %e, "Skip slot failed");
                }
                shared.complete_unscheduled(key, pair).await;
            }
        });
    }

    fn on_connection_close(
        &self,
        connection: &ConnectionKey,
        interaction_index: u64,
        status: CompletionStatus,
        timestamp_ms: i64,
    ) {
        let shared = self.shared.clone();
        let key = UniqueRequestKey {
            session: shared.session_key(connection),
            interaction_index,
        };
        debug!(connection = %connection, status = ?status, "Connection closed");

        // The next incarnation of this connection id gets a fresh session
        // and a fresh index space.
        {
            let mut entry = shared.incarnations.entry(connection.clone()).or_insert(0);
            *entry += 1;
        }

        let shared_for_task = shared.clone();
        shared.spawn_tracked(async move {
            let shared = shared_for_task;
            if let Err(e) = shared.orchestrator.schedule_close(&key).await {
                debug!(request = %key, error = %e, "Close scheduling failed");
            }
            if timestamp_ms > 0 {
                shared.gate.stop_reads_past(timestamp_ms);
            }
        });
    }

    fn on_record_retained(&self, key: &RecordKey) {
        *self.shared.record_refs.entry(key.clone()).or_insert(0) += 1;
    }

    fn on_stream_ignored(&self, key: &RecordKey) {
        let shared = self.shared.clone();
        let key = key.clone();
        let shared_for_task = shared.clone();
        shared.spawn_tracked(async move {
            shared_for_task.commit_record(&key).await;
        });
    }
}

/// Replays a capture against a target service.
pub struct ReplayEngine {
    shared: Arc<EngineShared>,
    accumulator: TrafficAccumulator,
}

impl ReplayEngine {
    pub fn new(
        config: ReplayerConfig,
        gate: Arc<BlockingTrafficSource>,
        sink: Arc<dyn ResultSink>,
        transform: Arc<dyn RequestTransformFactory>,
        retry: Arc<dyn RetryPolicy>,
    ) -> Result<Self> {
        config.validate()?;

        let clock = Arc::new(TimeShifter::new(config.speedup_factor));
        let limiter = Arc::new(AdmissionLimiter::new(config.max_concurrent_requests));
        let pool = Arc::new(ClientConnectionPool::new(PoolConfig {
            target_addr: config.target_addr.clone(),
            connect_timeout: config.connect_timeout(),
        }));
        let orchestrator = Arc::new(RequestSenderOrchestrator::new(
            pool.clone(),
            clock,
            limiter.clone(),
            retry,
            OrchestratorConfig {
                response_timeout: config.response_timeout(),
                max_retries: config.max_retries,
            },
        ));

        let shared = Arc::new(EngineShared {
            run_id: uuid::Uuid::new_v4().to_string(),
            gate,
            sink,
            transform,
            orchestrator,
            limiter,
            pool,
            incarnations: DashMap::new(),
            scheduled: DashMap::new(),
            pending: DashMap::new(),
            record_refs: DashMap::new(),
            outstanding: AtomicU64::new(0),
            idle: Notify::new(),
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
            fatal: parking_lot::Mutex::new(None),
            stats: Arc::new(ReplayStats::default()),
            config,
        });

        let expiry = ExpiringStreamMap::new(
            ExpiryConfig {
                minimum_guaranteed_lifetime_ms: shared.config.expiry_window_ms as i64,
                granularity_ms: shared.config.expiry_granularity_ms as i64,
                max_touch_retries: shared.config.max_touch_retries,
            },
            Arc::new(DefaultBehavioralPolicy),
        );
        let accumulator = TrafficAccumulator::new(
            expiry,
            Arc::new(EngineCallbacks {
                shared: shared.clone(),
            }),
        );

        Ok(Self {
            shared,
            accumulator,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    pub fn stats(&self) -> Arc<ReplayStats> {
        self.shared.stats.clone()
    }

    pub fn accumulator_stats(&self) -> crate::accumulate::AccumulatorStatsSnapshot {
        self.accumulator.stats().snapshot()
    }

    /// Request an orderly shutdown: ingestion stops, outstanding work is
    /// drained, retries are suppressed.
    pub fn shutdown(&self) {
        if !self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            info!("Shutdown requested");
            self.shared.orchestrator.suppress_retries();
            self.shared.shutdown.notify_waiters();
        }
    }

    /// Ingest the whole capture, replay it, drain, and report.
    pub async fn run(&self) -> Result<ReplayStatsSnapshot> {
        info!(
            run_id = %self.shared.run_id,
            target = %self.shared.config.target_addr,
            speedup = self.shared.config.speedup_factor,
            "Starting replay"
        );

        loop {
            if self.shared.shutting_down.load(Ordering::Acquire) {
                break;
            }
            let read = tokio::select! {
                chunk = self.shared.gate.read_next() => chunk,
                _ = self.shared.shutdown.notified() => break,
            };
            match read {
                Ok(Some(stream)) => {
                    self.shared.stats.records_read.fetch_add(1, Ordering::Relaxed);
                    self.accumulator.accept(&stream);
                }
                Ok(None) => {
                    debug!("Capture exhausted");
                    break;
                }
                Err(e) => {
                    self.shared.escalate(format!("capture read failed: {e}"));
                    break;
                }
            }
        }

        self.finish().await?;

        if let Some(message) = self.shared.fatal.lock().clone() {
            return Err(ReplayError::Unrecoverable(message));
        }
        Ok(self.shared.stats.snapshot())
    }

    /// Flush open accumulations, drain outstanding work, tear everything
    /// down in order: sessions, then the admission limiter, then the sink.
    async fn finish(&self) -> Result<()> {
        self.accumulator.close();

        let deadline = tokio::time::Instant::now() + self.shared.config.shutdown_timeout();
        let mut forced = false;
        loop {
            if self.shared.outstanding.load(Ordering::Acquire) == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline && !forced {
                warn!(
                    outstanding = self.shared.outstanding.load(Ordering::Acquire),
                    "Drain timeout; cancelling remaining replay work"
                );
                forced = true;
                self.shared.orchestrator.suppress_retries();
                self.shared.limiter.close();
                self.shared.pool.shutdown_now().await;
            }
            let _ = tokio::time::timeout(
                Duration::from_millis(50),
                self.shared.idle.notified(),
            )
            .await;
        }

        self.shared.limiter.close();
        self.shared.pool.shutdown_now().await;
        self.shared.sink.flush().await?;

        let stats = self.shared.stats.snapshot();
        let acc = self.accumulator.stats().snapshot();
        info!(
            run_id = %self.shared.run_id,
            records_read = stats.records_read,
            requests = stats.requests_scheduled,
            succeeded = stats.transactions_succeeded,
            failed = stats.transactions_failed,
            expired = stats.transactions_expired,
            dropped = stats.dropped_by_shutdown,
            retries = stats.target_retries,
            committed = stats.records_committed,
            invariant_violations = acc.invariant_violations,
            out_of_order_drops = acc.out_of_order_drops,
            "Replay complete"
        );
        Ok(())
    }
}
