//! Per-session work sequencing
//!
//! Work items for one session carry a dense channel-interaction index
//! assigned in original capture order. Their asynchronous preparation may
//! finish in any order on any task, but index i's body must not start until
//! index i-1 has signaled completion. The sequencer parks early arrivals on
//! oneshot wakeups keyed by index and releases them strictly in order;
//! cancellation drops every parked wakeup so waiters complete exceptionally
//! instead of stalling the pipeline.

use crate::error::{ReplayError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use tokio::sync::oneshot;

struct SequencerInner {
    /// Lowest index whose body has not yet run.
    next_to_start: u64,
    /// Whether some body is currently running.
    running: bool,
    /// Early arrivals waiting for their turn, keyed by index.
    parked: BTreeMap<u64, oneshot::Sender<()>>,
    cancelled: bool,
}

/// Strict index-order gate for one session's work bodies.
pub struct ScheduleSequencer {
    inner: Mutex<SequencerInner>,
}

impl Default for ScheduleSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleSequencer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SequencerInner {
                next_to_start: 0,
                running: false,
                parked: BTreeMap::new(),
                cancelled: false,
            }),
        }
    }

    /// Number of work items parked waiting for their turn.
    pub fn parked_len(&self) -> usize {
        self.inner.lock().parked.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Refuse new work and drop every parked wakeup; the corresponding
    /// waiters observe `SessionCancelled`.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.cancelled = true;
        inner.parked.clear();
    }

    /// Run `work` as the body for `index`, waiting until every lower index
    /// has completed. Completion is signaled whether the body returns,
    /// errors, or is dropped mid-flight.
    pub async fn run_in_order<F, T>(&self, index: u64, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let turn = {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return Err(ReplayError::SessionCancelled);
            }
            if index == inner.next_to_start && !inner.running {
                inner.running = true;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.parked.insert(index, tx);
                Some(rx)
            }
        };

        if let Some(rx) = turn {
            rx.await.map_err(|_| ReplayError::SessionCancelled)?;
        }

        // Signal completion even if `work` is dropped mid-flight, so a
        // cancelled task cannot wedge every later index.
        let guard = CompletionGuard {
            sequencer: self,
            index,
        };
        let result = work.await;
        drop(guard);
        result
    }

    fn finish(&self, index: u64) {
        let mut inner = self.inner.lock();
        inner.running = false;
        if index + 1 > inner.next_to_start {
            inner.next_to_start = index + 1;
        }
        if inner.cancelled {
            return;
        }
        // Wake the next index if it already arrived. A waiter that vanished
        // (dropped future) counts as finished; skip past it.
        loop {
            let next = inner.next_to_start;
            match inner.parked.remove(&next) {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        inner.running = true;
                        return;
                    }
                    inner.next_to_start += 1;
                }
                None => return,
            }
        }
    }
}

struct CompletionGuard<'a> {
    sequencer: &'a ScheduleSequencer,
    index: u64,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.sequencer.finish(self.index);
    }
}
