//! Wire codec for capture files
//!
//! Capture files are a sequence of frames, each a big-endian `u32` length
//! prefix followed by one JSON-encoded `TrafficStream` record. Binary
//! payloads travel as base64 strings inside the JSON for binary safety.

use crate::capture::{Observation, ObservationKind, TrafficStream};
use crate::error::{ReplayError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is treated as corruption.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct WireStream {
    node_id: String,
    connection_id: String,
    observations: Vec<WireObservation>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireObservation {
    Read { ts: i64, data: String },
    Write { ts: i64, data: String },
    ReadSegment { ts: i64, data: String },
    WriteSegment { ts: i64, data: String },
    EndOfMessage { ts: i64 },
    ConnectionException { ts: i64, message: String },
}

impl WireObservation {
    fn from_observation(obs: &Observation) -> Self {
        let ts = obs.timestamp_ms;
        match &obs.kind {
            ObservationKind::Read(data) => WireObservation::Read {
                ts,
                data: BASE64.encode(data),
            },
            ObservationKind::Write(data) => WireObservation::Write {
                ts,
                data: BASE64.encode(data),
            },
            ObservationKind::ReadSegment(data) => WireObservation::ReadSegment {
                ts,
                data: BASE64.encode(data),
            },
            ObservationKind::WriteSegment(data) => WireObservation::WriteSegment {
                ts,
                data: BASE64.encode(data),
            },
            ObservationKind::EndOfMessage => WireObservation::EndOfMessage { ts },
            ObservationKind::ConnectionException(message) => {
                WireObservation::ConnectionException {
                    ts,
                    message: message.clone(),
                }
            }
        }
    }

    fn into_observation(self) -> Result<Observation> {
        let decode = |data: &str| -> Result<Bytes> {
            BASE64
                .decode(data)
                .map(Bytes::from)
                .map_err(|e| ReplayError::CorruptFrame(format!("invalid base64 payload: {e}")))
        };
        Ok(match self {
            WireObservation::Read { ts, data } => Observation {
                timestamp_ms: ts,
                kind: ObservationKind::Read(decode(&data)?),
            },
            WireObservation::Write { ts, data } => Observation {
                timestamp_ms: ts,
                kind: ObservationKind::Write(decode(&data)?),
            },
            WireObservation::ReadSegment { ts, data } => Observation {
                timestamp_ms: ts,
                kind: ObservationKind::ReadSegment(decode(&data)?),
            },
            WireObservation::WriteSegment { ts, data } => Observation {
                timestamp_ms: ts,
                kind: ObservationKind::WriteSegment(decode(&data)?),
            },
            WireObservation::EndOfMessage { ts } => Observation {
                timestamp_ms: ts,
                kind: ObservationKind::EndOfMessage,
            },
            WireObservation::ConnectionException { ts, message } => Observation {
                timestamp_ms: ts,
                kind: ObservationKind::ConnectionException(message),
            },
        })
    }
}

/// Write one length-delimited frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    stream: &TrafficStream,
) -> Result<()> {
    let wire = WireStream {
        node_id: stream.node_id.clone(),
        connection_id: stream.connection_id.clone(),
        observations: stream
            .observations
            .iter()
            .map(WireObservation::from_observation)
            .collect(),
    };
    let payload = serde_json::to_vec(&wire)?;
    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(ReplayError::CorruptFrame(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    Ok(())
}

/// Read the next frame, or `None` on a clean end of input.
///
/// A truncated length prefix at the very start of a frame is a clean EOF;
/// truncation anywhere else is corruption.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<TrafficStream>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(ReplayError::CorruptFrame(format!(
            "frame length {len} exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| ReplayError::CorruptFrame(format!("truncated frame: {e}")))?;

    let wire: WireStream = serde_json::from_slice(&payload)
        .map_err(|e| ReplayError::CorruptFrame(format!("invalid frame JSON: {e}")))?;
    let observations = wire
        .observations
        .into_iter()
        .map(WireObservation::into_observation)
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(TrafficStream::new(
        wire.node_id,
        wire.connection_id,
        observations,
    )))
}
