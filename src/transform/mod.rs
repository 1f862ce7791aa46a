//! Request transformation seams
//!
//! Before a reconstructed request is sent to the target it passes through a
//! pluggable transform: consume the captured bytes, finalize into the
//! packets that will actually go on the wire. Header rewriting (Host,
//! Authorization) happens here; the replay core treats the transform as an
//! opaque collaborator.

use crate::capture::ConnectionKey;
use crate::error::{ReplayError, Result};
use bytes::{Bytes, BytesMut};

/// Context handed to the factory for each transformed request.
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub connection: ConnectionKey,
    pub interaction_index: u64,
}

/// The request bytes that will be sent, with packet boundaries preserved.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub packets: Vec<Bytes>,
}

impl TransformedRequest {
    pub fn total_len(&self) -> usize {
        self.packets.iter().map(Bytes::len).sum()
    }
}

/// Streaming consumer for one request's bytes.
pub trait RequestTransform: Send {
    fn consume(&mut self, chunk: &[u8]);
    fn finalize(self: Box<Self>) -> Result<TransformedRequest>;
}

/// Produces a transform per request.
pub trait RequestTransformFactory: Send + Sync {
    fn create(&self, ctx: &TransformContext) -> Box<dyn RequestTransform>;
}

/// Optionally rewrites the Authorization header on a transformed request.
pub trait AuthTransform: Send + Sync {
    /// Returns the replacement Authorization value, or `None` to leave the
    /// captured header untouched.
    fn authorization(&self, ctx: &TransformContext) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Provided implementations
// ---------------------------------------------------------------------------

/// Passes captured bytes through untouched, preserving packet boundaries.
pub struct IdentityTransformFactory;

impl RequestTransformFactory for IdentityTransformFactory {
    fn create(&self, _ctx: &TransformContext) -> Box<dyn RequestTransform> {
        Box::new(IdentityTransform { packets: Vec::new() })
    }
}

struct IdentityTransform {
    packets: Vec<Bytes>,
}

impl RequestTransform for IdentityTransform {
    fn consume(&mut self, chunk: &[u8]) {
        self.packets.push(Bytes::copy_from_slice(chunk));
    }

    fn finalize(self: Box<Self>) -> Result<TransformedRequest> {
        Ok(TransformedRequest {
            packets: self.packets,
        })
    }
}

/// Always answers with a fixed Authorization value.
pub struct StaticAuthTransform {
    value: String,
}

impl StaticAuthTransform {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl AuthTransform for StaticAuthTransform {
    fn authorization(&self, _ctx: &TransformContext) -> Option<String> {
        Some(self.value.clone())
    }
}

/// Rewrites request headers: swaps the Host header and, when an auth
/// transform is present, replaces or inserts the Authorization header.
/// The body is passed through untouched; the transformed request collapses
/// to a single packet because the header block may change size.
pub struct HeaderRewriteTransformFactory {
    host: Option<String>,
    auth: Option<Box<dyn AuthTransform>>,
}

impl HeaderRewriteTransformFactory {
    pub fn new(host: Option<String>, auth: Option<Box<dyn AuthTransform>>) -> Self {
        Self { host, auth }
    }
}

impl RequestTransformFactory for HeaderRewriteTransformFactory {
    fn create(&self, ctx: &TransformContext) -> Box<dyn RequestTransform> {
        Box::new(HeaderRewriteTransform {
            buf: BytesMut::new(),
            host: self.host.clone(),
            authorization: self.auth.as_ref().and_then(|a| a.authorization(ctx)),
        })
    }
}

struct HeaderRewriteTransform {
    buf: BytesMut,
    host: Option<String>,
    authorization: Option<String>,
}

impl RequestTransform for HeaderRewriteTransform {
    fn consume(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn finalize(self: Box<Self>) -> Result<TransformedRequest> {
        let raw = self.buf.freeze();
        let header_end = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| {
                ReplayError::Transform("request has no header boundary".to_string())
            })?;
        let head = std::str::from_utf8(&raw[..header_end])
            .map_err(|_| ReplayError::Transform("non-UTF8 request head".to_string()))?;
        let body = raw.slice(header_end + 4..);

        let mut lines = head.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| ReplayError::Transform("empty request head".to_string()))?;

        let mut out = String::with_capacity(head.len() + 64);
        out.push_str(request_line);
        out.push_str("\r\n");
        let mut auth_written = false;
        for line in lines {
            let name = line.split(':').next().unwrap_or_default();
            if name.eq_ignore_ascii_case("host") {
                if let Some(ref host) = self.host {
                    out.push_str("Host: ");
                    out.push_str(host);
                    out.push_str("\r\n");
                    continue;
                }
            }
            if name.eq_ignore_ascii_case("authorization") {
                if let Some(ref auth) = self.authorization {
                    out.push_str("Authorization: ");
                    out.push_str(auth);
                    out.push_str("\r\n");
                    auth_written = true;
                    continue;
                }
            }
            out.push_str(line);
            out.push_str("\r\n");
        }
        if let Some(ref auth) = self.authorization {
            if !auth_written {
                out.push_str("Authorization: ");
                out.push_str(auth);
                out.push_str("\r\n");
            }
        }
        out.push_str("\r\n");

        let mut packet = BytesMut::with_capacity(out.len() + body.len());
        packet.extend_from_slice(out.as_bytes());
        packet.extend_from_slice(&body);
        Ok(TransformedRequest {
            packets: vec![packet.freeze()],
        })
    }
}
