//! Connection replay sessions
//!
//! A session is one live incarnation of a downstream connection: a lazily
//! created channel to the target, an ordered work queue, and a cancellation
//! flag. All scheduling for one `SessionKey` funnels through the session's
//! sequencer for its entire lifetime, so per-connection state never needs a
//! lock held across an await.

use crate::capture::ConnectionKey;
use crate::error::{ReplayError, Result};
use crate::replay::http::{AggregatedResponse, ResponseAggregator};
use crate::replay::sequencer::ScheduleSequencer;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

/// Identity of one session incarnation for a source connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub connection: ConnectionKey,
    /// Incarnation counter, bumped on reassignment or cancellation.
    pub session_number: u64,
    pub generation: u64,
}

impl SessionKey {
    pub fn initial(connection: ConnectionKey) -> Self {
        Self {
            connection,
            session_number: 0,
            generation: 0,
        }
    }

    /// The key of the next incarnation of this connection.
    pub fn next_incarnation(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            session_number: self.session_number + 1,
            generation: self.generation,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}.{}",
            self.connection, self.session_number, self.generation
        )
    }
}

/// Identity of one unit of outbound replay work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueRequestKey {
    pub session: SessionKey,
    /// Connection-relative capture-order sequence number of this work unit.
    pub interaction_index: u64,
}

impl fmt::Display for UniqueRequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.session, self.interaction_index)
    }
}

/// One live incarnation of a downstream connection.
pub struct ConnectionReplaySession {
    key: SessionKey,
    target_addr: String,
    connect_timeout: Duration,
    sequencer: ScheduleSequencer,
    channel: Mutex<Option<TcpStream>>,
    cancelled: AtomicBool,
    cancel_tx: watch::Sender<bool>,
}

impl ConnectionReplaySession {
    pub fn new(key: SessionKey, target_addr: String, connect_timeout: Duration) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            key,
            target_addr,
            connect_timeout,
            sequencer: ScheduleSequencer::new(),
            channel: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            cancel_tx,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn sequencer(&self) -> &ScheduleSequencer {
        &self.sequencer
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Refuse new work, drain every parked sequencer slot exceptionally,
    /// and wake any body sleeping toward its scheduled send time.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_tx.send_replace(true);
        self.sequencer.cancel();
    }

    /// Resolves once the session is cancelled. Used to race scheduled
    /// sleeps against cancellation so teardown never waits out a pacing
    /// delay.
    pub async fn wait_cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Write the request packets paced by `interval`, then read the
    /// aggregated response. The channel is connected on first use.
    pub async fn send_and_receive(
        &self,
        packets: &[Bytes],
        interval: Duration,
        response_timeout: Duration,
    ) -> Result<AggregatedResponse> {
        if self.is_cancelled() {
            return Err(ReplayError::SessionCancelled);
        }
        let mut channel = self.channel.lock().await;
        let stream = match channel.as_mut() {
            Some(stream) => stream,
            None => {
                let stream = self.connect().await?;
                channel.insert(stream)
            }
        };

        let outcome = Self::exchange(stream, packets, interval, response_timeout).await;
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                // Drop the broken channel so a retry reconnects.
                *channel = None;
                return Err(e);
            }
        };

        trace!(
            session = %self.key,
            status = response.status_code,
            bytes = response.bytes.len(),
            "Aggregated target response"
        );
        Ok(response)
    }

    /// Close the downstream channel if one was ever opened.
    pub async fn close_channel(&self) {
        if let Some(mut stream) = self.channel.lock().await.take() {
            let _ = stream.shutdown().await;
            debug!(session = %self.key, "Closed target channel");
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&self.target_addr),
        )
        .await
        .map_err(|_| {
            ReplayError::Target(format!(
                "connect to {} timed out after {:?}",
                self.target_addr, self.connect_timeout
            ))
        })?
        .map_err(|e| ReplayError::Target(format!("connect to {} failed: {e}", self.target_addr)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ReplayError::Target(format!("set_nodelay failed: {e}")))?;
        debug!(session = %self.key, target = %self.target_addr, "Opened target channel");
        Ok(stream)
    }

    async fn exchange(
        stream: &mut TcpStream,
        packets: &[Bytes],
        interval: Duration,
        response_timeout: Duration,
    ) -> Result<AggregatedResponse> {
        for (i, packet) in packets.iter().enumerate() {
            if i > 0 && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            stream
                .write_all(packet)
                .await
                .map_err(|e| ReplayError::Target(format!("send failed: {e}")))?;
        }
        stream
            .flush()
            .await
            .map_err(|e| ReplayError::Target(format!("flush failed: {e}")))?;

        tokio::time::timeout(response_timeout, Self::read_response(stream))
            .await
            .map_err(|_| ReplayError::ResponseTimeout(response_timeout.as_millis() as u64))?
    }

    async fn read_response(stream: &mut TcpStream) -> Result<AggregatedResponse> {
        let mut aggregator = ResponseAggregator::new();
        let mut chunk = [0u8; 16 * 1024];
        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| ReplayError::Target(format!("receive failed: {e}")))?;
            if n == 0 {
                return aggregator.finish_on_close();
            }
            if aggregator.push(&chunk[..n])? {
                return aggregator.into_response();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_incarnation() {
        let key = SessionKey::initial(ConnectionKey::new("n", "c1"));
        assert_eq!(key.session_number, 0);
        let next = key.next_incarnation();
        assert_eq!(next.session_number, 1);
        assert_eq!(next.connection, key.connection);
        assert_eq!(next.to_string(), "n.c1#1.0");
    }

    #[tokio::test]
    async fn test_cancelled_session_refuses_sends() {
        let session = ConnectionReplaySession::new(
            SessionKey::initial(ConnectionKey::new("n", "c1")),
            "127.0.0.1:1".to_string(),
            Duration::from_millis(100),
        );
        session.cancel();
        let result = session
            .send_and_receive(
                &[Bytes::from_static(b"x")],
                Duration::ZERO,
                Duration::from_millis(100),
            )
            .await;
        assert!(matches!(result, Err(ReplayError::SessionCancelled)));
    }

    #[tokio::test]
    async fn test_close_without_channel_is_noop() {
        let session = ConnectionReplaySession::new(
            SessionKey::initial(ConnectionKey::new("n", "c1")),
            "127.0.0.1:1".to_string(),
            Duration::from_millis(100),
        );
        session.close_channel().await;
    }
}
