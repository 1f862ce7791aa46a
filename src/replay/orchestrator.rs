//! Request send orchestration
//!
//! Schedules transform-then-send (and close) work onto the right session at
//! the right wall-clock time, using each session's sequencer to reproduce
//! original capture order on the wire even though request preparation for
//! different indices completes in arbitrary order.

use crate::error::{ReplayError, Result};
use crate::output::AttemptRecord;
use crate::replay::clock::TimeShifter;
use crate::replay::limiter::AdmissionLimiter;
use crate::replay::pool::ClientConnectionPool;
use crate::replay::session::UniqueRequestKey;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Verdict from the retry visitor for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDirective {
    Done,
    Retry,
}

/// Inspects each attempt's outcome (response or send failure) and decides
/// whether to re-issue the send.
pub trait RetryPolicy: Send + Sync {
    fn evaluate(&self, attempt: &AttemptRecord, attempt_number: u32) -> RetryDirective;
}

/// Default policy: any aggregated response settles the request; only
/// retryable transport failures are re-issued.
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn evaluate(&self, attempt: &AttemptRecord, _attempt_number: u32) -> RetryDirective {
        if attempt.error.is_some() {
            RetryDirective::Retry
        } else {
            RetryDirective::Done
        }
    }
}

/// The settled result of replaying one request: every attempt made, in
/// order, and the terminal error if none succeeded.
#[derive(Debug, Clone)]
pub struct TargetResult {
    pub attempts: Vec<AttemptRecord>,
    pub error: Option<String>,
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub response_timeout: Duration,
    pub max_retries: u32,
}

pub struct RequestSenderOrchestrator {
    pool: Arc<ClientConnectionPool>,
    clock: Arc<TimeShifter>,
    limiter: Arc<AdmissionLimiter>,
    retry: Arc<dyn RetryPolicy>,
    config: OrchestratorConfig,
    /// Class-wide retry suppression during shutdown.
    retries_suppressed: AtomicBool,
}

impl RequestSenderOrchestrator {
    pub fn new(
        pool: Arc<ClientConnectionPool>,
        clock: Arc<TimeShifter>,
        limiter: Arc<AdmissionLimiter>,
        retry: Arc<dyn RetryPolicy>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            clock,
            limiter,
            retry,
            config,
            retries_suppressed: AtomicBool::new(false),
        }
    }

    /// Globally suppress retries; used while shutting down so failed
    /// attempts settle instead of being re-issued.
    pub fn suppress_retries(&self) {
        self.retries_suppressed.store(true, Ordering::Release);
    }

    pub fn clock(&self) -> &Arc<TimeShifter> {
        &self.clock
    }

    /// Schedule a TRANSMIT unit of work at the request's capture-order
    /// index. Admission is acquired first (backpressure), then the body is
    /// gated by the sequencer, wall-clock scheduled, and paced. The retry
    /// loop runs inside the held sequencer slot so later indices wait until
    /// this unit settles.
    pub async fn schedule_request(
        &self,
        key: &UniqueRequestKey,
        start_source_ts: i64,
        packet_interval_source_ms: i64,
        packets: Vec<Bytes>,
    ) -> Result<TargetResult> {
        let start = self.clock.to_real_time(start_source_ts);
        let interval = self.clock.shift_duration(packet_interval_source_ms);

        let session = self.pool.session_for(&key.session)?;
        let outcome = session
            .sequencer()
            .run_in_order(
                key.interaction_index,
                self.attempt_loop(&session, key, start, interval, &packets),
            )
            .await;

        match outcome {
            Ok(result) => Ok(result),
            Err(ReplayError::SessionCancelled) if !self.suppressed() => {
                // The incarnation died under us; re-issue on a fresh one.
                // The fresh session serializes sends on its channel, so the
                // dead sequencer is not consulted again.
                warn!(request = %key, "Session cancelled mid-schedule; re-incarnating");
                let fresh_key = key.session.next_incarnation();
                let fresh = self.pool.session_for(&fresh_key)?;
                tokio::select! {
                    _ = tokio::time::sleep_until(start) => {}
                    _ = fresh.wait_cancelled() => return Err(ReplayError::SessionCancelled),
                }
                let _permit = self.limiter.admit().await?;
                let attempt = self.attempt_once(&fresh, interval, &packets).await;
                let error = attempt.error.clone();
                Ok(TargetResult {
                    attempts: vec![attempt],
                    error,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn attempt_loop(
        &self,
        session: &Arc<crate::replay::session::ConnectionReplaySession>,
        key: &UniqueRequestKey,
        start: Instant,
        interval: Duration,
        packets: &[Bytes],
    ) -> Result<TargetResult> {
        tokio::select! {
            _ = tokio::time::sleep_until(start) => {}
            _ = session.wait_cancelled() => return Err(ReplayError::SessionCancelled),
        }
        // Admission is taken once the body has its turn, so parked work
        // never sits on a slot another session could use.
        let _permit = self.limiter.admit().await?;
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut attempt_number: u32 = 0;
        loop {
            attempt_number += 1;
            let attempt = self.attempt_once(session, interval, packets).await;
            let directive = if self.suppressed() || attempt_number > self.config.max_retries {
                RetryDirective::Done
            } else {
                self.retry.evaluate(&attempt, attempt_number)
            };
            let error = attempt.error.clone();
            attempts.push(attempt);

            match directive {
                RetryDirective::Done => return Ok(TargetResult { error, attempts }),
                RetryDirective::Retry => {
                    if session.is_cancelled() {
                        return Err(ReplayError::SessionCancelled);
                    }
                    debug!(request = %key, attempt = attempt_number, "Retrying target send");
                }
            }
        }
    }

    /// Schedule a CLOSE unit of work under the same ordering discipline as
    /// a send.
    pub async fn schedule_close(&self, key: &UniqueRequestKey) -> Result<()> {
        let session = self.pool.session_for(&key.session)?;
        let pool = self.pool.clone();
        let session_key = key.session.clone();
        let outcome = session
            .sequencer()
            .run_in_order(key.interaction_index, async move {
                pool.close_connection(&session_key).await;
                Ok(())
            })
            .await;
        match outcome {
            Ok(()) => Ok(()),
            // A cancelled session is already torn down; the close settled.
            Err(ReplayError::SessionCancelled) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Consume an interaction index with no wire effect, keeping the
    /// session's index space dense when a unit of work was finalized
    /// without anything to send.
    pub async fn schedule_skip(&self, key: &UniqueRequestKey) -> Result<()> {
        let session = match self.pool.session_for(&key.session) {
            Ok(session) => session,
            Err(ReplayError::ShuttingDown) => return Ok(()),
            Err(e) => return Err(e),
        };
        match session
            .sequencer()
            .run_in_order(key.interaction_index, async { Ok(()) })
            .await
        {
            Ok(()) | Err(ReplayError::SessionCancelled) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn suppressed(&self) -> bool {
        self.retries_suppressed.load(Ordering::Acquire)
    }

    async fn attempt_once(
        &self,
        session: &Arc<crate::replay::session::ConnectionReplaySession>,
        interval: Duration,
        packets: &[Bytes],
    ) -> AttemptRecord {
        let begin = Instant::now();
        let outcome = session
            .send_and_receive(packets, interval, self.config.response_timeout)
            .await;
        let latency_ms = begin.elapsed().as_millis() as u64;
        match outcome {
            Ok(response) => AttemptRecord {
                status_code: Some(response.status_code),
                latency_ms,
                response_size: response.bytes.len(),
                response_b64: Some(crate::output::ReplayOutcome::encode_payload(
                    &response.bytes,
                )),
                error: None,
            },
            Err(e) => AttemptRecord {
                status_code: None,
                latency_ms,
                response_size: 0,
                response_b64: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ConnectionKey;
    use crate::replay::pool::PoolConfig;
    use crate::replay::session::SessionKey;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_target() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    loop {
                        let Ok(n) = socket.read(&mut buf).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        // One canned response per request boundary.
                        if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                            let body = b"ok";
                            let response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\nok",
                                body.len()
                            );
                            if socket.write_all(response.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        (addr, handle)
    }

    fn orchestrator(target: String) -> RequestSenderOrchestrator {
        RequestSenderOrchestrator::new(
            Arc::new(ClientConnectionPool::new(PoolConfig {
                target_addr: target,
                connect_timeout: Duration::from_secs(1),
            })),
            Arc::new(TimeShifter::new(1000.0)),
            Arc::new(AdmissionLimiter::new(64)),
            Arc::new(DefaultRetryPolicy),
            OrchestratorConfig {
                response_timeout: Duration::from_secs(2),
                max_retries: 2,
            },
        )
    }

    fn request_key(conn: &str, index: u64) -> UniqueRequestKey {
        UniqueRequestKey {
            session: SessionKey::initial(ConnectionKey::new("n", conn)),
            interaction_index: index,
        }
    }

    #[tokio::test]
    async fn test_request_round_trip_records_attempt() {
        let (addr, _target) = echo_target().await;
        let orch = orchestrator(addr.to_string());

        let result = orch
            .schedule_request(
                &request_key("c1", 0),
                1_000,
                0,
                vec![Bytes::from_static(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n")],
            )
            .await
            .unwrap();

        assert!(result.error.is_none());
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(result.attempts[0].status_code, Some(200));
        assert!(result.attempts[0].response_size > 0);
    }

    #[tokio::test]
    async fn test_unreachable_target_exhausts_retries() {
        let orch = orchestrator("127.0.0.1:1".to_string());
        let result = orch
            .schedule_request(
                &request_key("c1", 0),
                1_000,
                0,
                vec![Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")],
            )
            .await
            .unwrap();

        // max_retries bounds total attempts at max_retries + 1.
        assert_eq!(result.attempts.len(), 3);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_suppressed_retries_settle_after_one_attempt() {
        let orch = orchestrator("127.0.0.1:1".to_string());
        orch.suppress_retries();
        let result = orch
            .schedule_request(
                &request_key("c1", 0),
                1_000,
                0,
                vec![Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")],
            )
            .await
            .unwrap();
        assert_eq!(result.attempts.len(), 1);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_pipelined_sends_stay_in_index_order() {
        let (addr, _target) = echo_target().await;
        let orch = Arc::new(orchestrator(addr.to_string()));

        // Submit in reverse arrival order; completion must follow indices.
        let mut handles = Vec::new();
        for index in (0..4u64).rev() {
            let orch = orch.clone();
            handles.push(tokio::spawn(async move {
                // Stagger so higher indices arrive (and park) first.
                tokio::time::sleep(Duration::from_millis((4 - index) * 10)).await;
                let body = format!("GET /{index} HTTP/1.1\r\nHost: h\r\n\r\n");
                let result = orch
                    .schedule_request(
                        &request_key("c1", index),
                        1_000 + index as i64,
                        0,
                        vec![Bytes::from(body)],
                    )
                    .await
                    .unwrap();
                (index, result)
            }));
        }
        for handle in handles {
            let (_, result) = handle.await.unwrap();
            assert!(result.error.is_none(), "attempt failed: {result:?}");
        }
    }

    #[tokio::test]
    async fn test_schedule_close_tears_down_session() {
        let (addr, _target) = echo_target().await;
        let orch = orchestrator(addr.to_string());

        orch.schedule_request(
            &request_key("c1", 0),
            1_000,
            0,
            vec![Bytes::from_static(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n")],
        )
        .await
        .unwrap();

        orch.schedule_close(&request_key("c1", 1)).await.unwrap();
        assert_eq!(orch.pool.live_sessions(), 0);
    }
}
