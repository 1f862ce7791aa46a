//! Time-windowed expiration registry
//!
//! Decides, for every touch of a connection, whether its timestamp is still
//! inside the valid processing window, and evicts connections that fall
//! behind. Memory stays proportional to `window x arrival rate`: per
//! partition, connection markers live in time buckets quantized to a
//! configurable granularity, and buckets older than
//! `newest - minimum_guaranteed_lifetime` are swept on each accepted touch.
//!
//! There is no global lock on the hot path: per-connection markers are
//! updated with a bounded-retry compare-and-swap, partitions are sharded in
//! a concurrent map, and only the bucket index of one partition sits behind
//! a short mutex.

use crate::capture::ConnectionKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Marker value before a connection's first accepted touch.
const NEVER: i64 = i64::MIN;

/// Outcome of touching a connection's last-touched marker.
#[derive(Debug, PartialEq, Eq)]
pub enum TouchOutcome {
    /// Touch accepted; any connections evicted by the accompanying sweep are
    /// returned so the owner can finalize them.
    Accepted { expired: Vec<ConnectionKey> },
    /// The timestamp is older than the current window start; likely an
    /// out-of-order capture.
    TooOld,
    /// The connection was already marked dead; no further updates accepted.
    Dead,
    /// The CAS retry bound was exceeded and the policy chose to give up;
    /// the connection is treated as expired.
    RetriesExhausted,
}

/// Policy hooks for observability and deterministic testing of the
/// bookkeeping edge cases.
pub trait BehavioralPolicy: Send + Sync {
    /// A touch arrived older than the window start.
    fn on_out_of_order(&self, connection: &ConnectionKey, timestamp_ms: i64, window_start_ms: i64);

    /// The CAS retry bound was hit. Return `true` to keep retrying another
    /// round, `false` to give up and expire the connection.
    fn on_retry_exhausted(&self, connection: &ConnectionKey) -> bool;
}

/// Default policy: log and give up after the bounded retries.
#[derive(Debug, Default)]
pub struct DefaultBehavioralPolicy;

impl BehavioralPolicy for DefaultBehavioralPolicy {
    fn on_out_of_order(&self, connection: &ConnectionKey, timestamp_ms: i64, window_start_ms: i64) {
        debug!(
            connection = %connection,
            timestamp_ms,
            window_start_ms,
            "Rejected touch older than processing window"
        );
    }

    fn on_retry_exhausted(&self, connection: &ConnectionKey) -> bool {
        warn!(connection = %connection, "Touch retries exhausted; expiring connection");
        false
    }
}

/// Configuration for the expiry registry.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// How far behind the newest observed timestamp a connection may still
    /// be touched.
    pub minimum_guaranteed_lifetime_ms: i64,
    /// Bucket quantization.
    pub granularity_ms: i64,
    /// CAS retry bound per touch.
    pub max_touch_retries: u32,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            minimum_guaranteed_lifetime_ms: 120_000,
            granularity_ms: 1_000,
            max_touch_retries: 5,
        }
    }
}

struct ConnEntry {
    last_touched_ms: AtomicI64,
    dead: AtomicBool,
}

struct Partition {
    newest_ts: AtomicI64,
    touches: DashMap<String, Arc<ConnEntry>>,
    /// bucket start -> connection ids last touched inside that bucket
    buckets: Mutex<BTreeMap<i64, HashSet<String>>>,
}

impl Partition {
    fn new() -> Self {
        Self {
            newest_ts: AtomicI64::new(NEVER),
            touches: DashMap::new(),
            buckets: Mutex::new(BTreeMap::new()),
        }
    }
}

/// Per-(partition, connection) registry of last-touched times with
/// time-bucketed expiry.
pub struct ExpiringStreamMap {
    config: ExpiryConfig,
    policy: Arc<dyn BehavioralPolicy>,
    partitions: DashMap<String, Arc<Partition>>,
}

impl ExpiringStreamMap {
    pub fn new(config: ExpiryConfig, policy: Arc<dyn BehavioralPolicy>) -> Self {
        Self {
            config,
            policy,
            partitions: DashMap::new(),
        }
    }

    fn bucket_of(&self, ts: i64) -> i64 {
        ts.div_euclid(self.config.granularity_ms) * self.config.granularity_ms
    }

    /// Move `connection`'s marker into the bucket for `timestamp_ms`,
    /// creating it on first touch, and sweep buckets that fell out of the
    /// window.
    pub fn touch(&self, connection: &ConnectionKey, timestamp_ms: i64) -> TouchOutcome {
        let partition = self
            .partitions
            .entry(connection.node_id.clone())
            .or_insert_with(|| Arc::new(Partition::new()))
            .clone();

        let newest = partition.newest_ts.fetch_max(timestamp_ms, Ordering::AcqRel);
        let newest = newest.max(timestamp_ms);
        let window_start = newest.saturating_sub(self.config.minimum_guaranteed_lifetime_ms);
        if timestamp_ms < window_start {
            self.policy
                .on_out_of_order(connection, timestamp_ms, window_start);
            return TouchOutcome::TooOld;
        }

        let entry = partition
            .touches
            .entry(connection.connection_id.clone())
            .or_insert_with(|| {
                Arc::new(ConnEntry {
                    last_touched_ms: AtomicI64::new(NEVER),
                    dead: AtomicBool::new(false),
                })
            })
            .clone();
        if entry.dead.load(Ordering::Acquire) {
            return TouchOutcome::Dead;
        }

        // Bounded-retry CAS on the last-touched marker. The marker is
        // monotonically non-decreasing: an older concurrent touch keeps the
        // newer value.
        let mut accepted_from = None;
        'cas: loop {
            let mut attempts = 0;
            let mut observed = entry.last_touched_ms.load(Ordering::Acquire);
            loop {
                if timestamp_ms <= observed {
                    // A newer touch already holds the marker; nothing to move.
                    break 'cas;
                }
                match entry.last_touched_ms.compare_exchange_weak(
                    observed,
                    timestamp_ms,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(previous) => {
                        accepted_from = Some(previous);
                        break 'cas;
                    }
                    Err(current) => {
                        observed = current;
                        attempts += 1;
                        if attempts >= self.config.max_touch_retries {
                            if self.policy.on_retry_exhausted(connection) {
                                continue 'cas;
                            }
                            self.mark_dead(&partition, &connection.connection_id, &entry);
                            return TouchOutcome::RetriesExhausted;
                        }
                    }
                }
            }
        }

        if entry.dead.load(Ordering::Acquire) {
            return TouchOutcome::Dead;
        }

        // Move the marker between buckets and sweep anything out of window.
        let expired = {
            let mut buckets = partition.buckets.lock();
            if let Some(previous) = accepted_from {
                if previous != NEVER {
                    let old_bucket = self.bucket_of(previous);
                    if let Some(set) = buckets.get_mut(&old_bucket) {
                        set.remove(&connection.connection_id);
                        if set.is_empty() {
                            buckets.remove(&old_bucket);
                        }
                    }
                }
                buckets
                    .entry(self.bucket_of(timestamp_ms))
                    .or_default()
                    .insert(connection.connection_id.clone());
            }
            self.sweep_locked(&partition, &mut buckets, window_start, &connection.node_id)
        };

        TouchOutcome::Accepted { expired }
    }

    /// Mark a connection dead without waiting for the window to pass.
    /// Further touches are rejected.
    pub fn condemn(&self, connection: &ConnectionKey) {
        if let Some(partition) = self.partitions.get(&connection.node_id) {
            let partition = partition.clone();
            let entry = partition
                .touches
                .get(&connection.connection_id)
                .map(|entry| entry.clone());
            if let Some(entry) = entry {
                self.mark_dead(&partition, &connection.connection_id, &entry);
            }
        }
    }

    /// Drop a connection entirely (transaction finalized and recycled).
    pub fn remove(&self, connection: &ConnectionKey) {
        if let Some(partition) = self.partitions.get(&connection.node_id) {
            let partition = partition.clone();
            if let Some((_, entry)) = partition.touches.remove(&connection.connection_id) {
                let last = entry.last_touched_ms.load(Ordering::Acquire);
                if last != NEVER {
                    let mut buckets = partition.buckets.lock();
                    let bucket = self.bucket_of(last);
                    if let Some(set) = buckets.get_mut(&bucket) {
                        set.remove(&connection.connection_id);
                        if set.is_empty() {
                            buckets.remove(&bucket);
                        }
                    }
                }
            }
        }
    }

    /// Number of live (not yet dead) connection markers across all partitions.
    pub fn live_count(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| {
                p.touches
                    .iter()
                    .filter(|e| !e.dead.load(Ordering::Acquire))
                    .count()
            })
            .sum()
    }

    /// Marks the connection dead but keeps the tombstone so the marker
    /// accepts no further updates until the owner calls [`Self::remove`].
    fn mark_dead(&self, partition: &Partition, connection_id: &str, entry: &ConnEntry) {
        entry.dead.store(true, Ordering::Release);
        let last = entry.last_touched_ms.load(Ordering::Acquire);
        if last != NEVER {
            let mut buckets = partition.buckets.lock();
            let bucket = self.bucket_of(last);
            if let Some(set) = buckets.get_mut(&bucket) {
                set.remove(connection_id);
                if set.is_empty() {
                    buckets.remove(&bucket);
                }
            }
        }
    }

    fn sweep_locked(
        &self,
        partition: &Partition,
        buckets: &mut BTreeMap<i64, HashSet<String>>,
        window_start_ms: i64,
        node_id: &str,
    ) -> Vec<ConnectionKey> {
        let mut expired = Vec::new();
        // A bucket [k, k + granularity) is wholly out of window once its end
        // is at or before the window start.
        let mut doomed = Vec::new();
        for (&bucket, _) in buckets.iter() {
            if bucket + self.config.granularity_ms <= window_start_ms {
                doomed.push(bucket);
            } else {
                break;
            }
        }
        for bucket in doomed {
            if let Some(set) = buckets.remove(&bucket) {
                for connection_id in set {
                    if let Some(entry) = partition.touches.get(&connection_id) {
                        // Tombstone until the owner finalizes and removes.
                        entry.dead.store(true, Ordering::Release);
                        expired.push(ConnectionKey::new(node_id, connection_id));
                    }
                }
            }
        }
        if !expired.is_empty() {
            debug!(
                node_id,
                expired = expired.len(),
                window_start_ms,
                "Swept connections out of the processing window"
            );
        }
        expired
    }
}
