//! Replay result output
//!
//! Every reconstructed transaction produces one output tuple: the source
//! request and response, each target attempt with its latency and size, and
//! the terminal error if replay failed. Sinks are pluggable; the provided
//! JSON-lines sink writes one tuple per line with payloads base64 encoded.

use crate::accumulate::CompletionStatus;
use crate::error::{ReplayError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// One target send attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub response_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The full output tuple for one reconstructed transaction.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub run_id: String,
    pub node_id: String,
    pub connection_id: String,
    pub session_number: u64,
    pub interaction_index: u64,
    pub status: CompletionStatus,
    pub source_request_b64: String,
    pub source_response_b64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_first_timestamp_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_last_timestamp_ms: Option<i64>,
    pub target_attempts: Vec<AttemptRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplayOutcome {
    pub fn encode_payload(data: &[u8]) -> String {
        BASE64.encode(data)
    }
}

/// Destination for replay outcomes.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn accept(&self, outcome: ReplayOutcome) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes one JSON object per line to any byte sink (file, stdout, ...).
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl JsonLinesSink {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn accept(&self, outcome: ReplayOutcome) -> Result<()> {
        let mut line = serde_json::to_vec(&outcome)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| ReplayError::Sink(format!("write failed: {e}")))?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .flush()
            .await
            .map_err(|e| ReplayError::Sink(format!("flush failed: {e}")))?;
        Ok(())
    }
}

/// Collects outcomes in memory; used by tests and embeddings.
#[derive(Default)]
pub struct VecSink {
    outcomes: parking_lot::Mutex<Vec<ReplayOutcome>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<ReplayOutcome> {
        self.outcomes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.outcomes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.lock().is_empty()
    }
}

#[async_trait]
impl ResultSink for VecSink {
    async fn accept(&self, outcome: ReplayOutcome) -> Result<()> {
        self.outcomes.lock().push(outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> ReplayOutcome {
        ReplayOutcome {
            run_id: "run-1".into(),
            node_id: "n".into(),
            connection_id: "c1".into(),
            session_number: 0,
            interaction_index: 2,
            status: CompletionStatus::ClosedNormally,
            source_request_b64: ReplayOutcome::encode_payload(b"GET / HTTP/1.1\r\n\r\n"),
            source_response_b64: ReplayOutcome::encode_payload(b"HTTP/1.1 200 OK\r\n\r\n"),
            source_first_timestamp_ms: Some(1_000),
            source_last_timestamp_ms: Some(1_500),
            target_attempts: vec![AttemptRecord {
                status_code: Some(200),
                latency_ms: 12,
                response_size: 19,
                response_b64: None,
                error: None,
            }],
            error: None,
        }
    }

    #[tokio::test]
    async fn test_json_lines_sink_writes_one_line_per_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let file = tokio::fs::File::create(&path).await.unwrap();

        let sink = JsonLinesSink::new(Box::new(file));
        sink.accept(outcome()).await.unwrap();
        sink.accept(outcome()).await.unwrap();
        sink.flush().await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["interaction_index"], 2);
        assert_eq!(parsed["status"], "closed_normally");
        assert_eq!(parsed["target_attempts"][0]["status_code"], 200);
    }

    #[tokio::test]
    async fn test_vec_sink_collects() {
        let sink = VecSink::new();
        sink.accept(outcome()).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.outcomes()[0].run_id, "run-1");
    }
}
