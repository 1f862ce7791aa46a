//! Flow-control gate between ingestion and replay
//!
//! `BlockingTrafficSource` wraps a raw capture source and caps how far
//! ingestion may run ahead of replay progress. Replay completion paths call
//! `stop_reads_past` to raise a watermark; the single ingest reader suspends
//! whenever the newest timestamp it has already observed is past that
//! watermark. This is the system's primary backpressure mechanism: it bounds
//! the outstanding accumulation count and in-flight replay concurrency.

use crate::capture::source::{RecordKey, TrafficSource};
use crate::capture::TrafficStream;
use crate::error::Result;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

/// Watermark value before the first read seeds it.
const UNSET: i64 = i64::MIN;

pub struct BlockingTrafficSource {
    inner: Arc<dyn TrafficSource>,
    /// Reads are permitted while `last_observed <= watermark`.
    watermark_ms: AtomicI64,
    /// Newest observation timestamp handed out so far.
    last_observed_ms: AtomicI64,
    buffer_time_window_ms: i64,
    advanced: Notify,
}

impl BlockingTrafficSource {
    pub fn new(inner: Arc<dyn TrafficSource>, buffer_time_window_ms: i64) -> Self {
        Self {
            inner,
            watermark_ms: AtomicI64::new(UNSET),
            last_observed_ms: AtomicI64::new(UNSET),
            buffer_time_window_ms,
            advanced: Notify::new(),
        }
    }

    /// Raise the read watermark to `point_in_time + buffer_time_window`.
    ///
    /// Monotonic set-if-later; safe for concurrent callers. Wakes the reader
    /// if it was suspended behind the old watermark.
    pub fn stop_reads_past(&self, point_in_time_ms: i64) {
        let candidate = point_in_time_ms.saturating_add(self.buffer_time_window_ms);
        let mut current = self.watermark_ms.load(Ordering::Acquire);
        while current == UNSET || candidate > current {
            match self.watermark_ms.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(watermark_ms = candidate, "Advanced read watermark");
                    // notify_one stores a permit when the reader is not yet
                    // parked, so an advance can never be missed.
                    self.advanced.notify_one();
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Current watermark, if seeded.
    pub fn watermark_ms(&self) -> Option<i64> {
        match self.watermark_ms.load(Ordering::Acquire) {
            UNSET => None,
            v => Some(v),
        }
    }

    /// Read the next record, suspending while ingestion is ahead of the
    /// watermark. Single-caller.
    pub async fn read_next(&self) -> Result<Option<TrafficStream>> {
        loop {
            let watermark = self.watermark_ms.load(Ordering::Acquire);
            let last = self.last_observed_ms.load(Ordering::Acquire);
            if watermark == UNSET || last == UNSET || last <= watermark {
                break;
            }
            trace!(
                last_observed_ms = last,
                watermark_ms = watermark,
                "Ingestion ahead of watermark; suspending reads"
            );
            self.advanced.notified().await;
        }

        let chunk = self.inner.read_next().await?;
        if let Some(ref stream) = chunk {
            if let Some(max_ts) = stream.max_timestamp_ms() {
                let previous = self.last_observed_ms.fetch_max(max_ts, Ordering::AcqRel);
                if previous == UNSET {
                    // First read seeds the watermark one window ahead.
                    let _ = self.watermark_ms.compare_exchange(
                        UNSET,
                        max_ts.saturating_add(self.buffer_time_window_ms),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            }
        }
        Ok(chunk)
    }

    pub async fn commit(&self, key: &RecordKey) -> Result<()> {
        self.inner.commit(key).await
    }

    pub fn committed_count(&self) -> u64 {
        self.inner.committed_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::ChannelTrafficSource;
    use crate::capture::Observation;
    use std::time::Duration;

    fn stream_at(ts: i64) -> TrafficStream {
        TrafficStream::new("n", "c", vec![Observation::end_of_message(ts)])
    }

    #[tokio::test]
    async fn test_first_read_seeds_watermark() {
        let (tx, source) = ChannelTrafficSource::new(4);
        let gate = BlockingTrafficSource::new(Arc::new(source), 1000);
        tx.send(stream_at(5000)).await.unwrap();

        assert!(gate.watermark_ms().is_none());
        gate.read_next().await.unwrap().unwrap();
        assert_eq!(gate.watermark_ms(), Some(6000));
    }

    #[tokio::test]
    async fn test_read_blocks_past_watermark_until_advanced() {
        let (tx, source) = ChannelTrafficSource::new(4);
        let gate = Arc::new(BlockingTrafficSource::new(Arc::new(source), 1000));

        tx.send(stream_at(5000)).await.unwrap();
        tx.send(stream_at(9000)).await.unwrap();
        tx.send(stream_at(9100)).await.unwrap();

        // Seed: watermark 6000, last observed 5000.
        gate.read_next().await.unwrap().unwrap();
        // Second read is allowed (5000 <= 6000) and moves last observed to 9000.
        gate.read_next().await.unwrap().unwrap();

        // Third read must now block: 9000 > 6000.
        let blocked = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.read_next().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // An advance below the needed point keeps it blocked.
        gate.stop_reads_past(7000); // watermark 8000 < 9000
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // Advancing past the observed point releases the read.
        gate.stop_reads_past(8500); // watermark 9500 >= 9000
        let stream = blocked.await.unwrap().unwrap().unwrap();
        assert_eq!(stream.max_timestamp_ms(), Some(9100));
    }

    #[tokio::test]
    async fn test_watermark_is_monotonic() {
        let (_tx, source) = ChannelTrafficSource::new(1);
        let gate = BlockingTrafficSource::new(Arc::new(source), 100);
        gate.stop_reads_past(5000);
        assert_eq!(gate.watermark_ms(), Some(5100));
        gate.stop_reads_past(1000);
        assert_eq!(gate.watermark_ms(), Some(5100));
        gate.stop_reads_past(6000);
        assert_eq!(gate.watermark_ms(), Some(6100));
    }
}
