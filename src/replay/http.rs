//! HTTP/1.1 response aggregation
//!
//! Replay sends raw captured request bytes; the only protocol knowledge the
//! engine needs is where the target's response ends. The accumulator here is
//! fed read chunks incrementally and reports completion once the framing
//! (Content-Length, chunked transfer coding, or connection close) says the
//! message is whole.

use crate::error::{ReplayError, Result};
use bytes::{Bytes, BytesMut};

/// Raw aggregated response plus the parsed status code.
#[derive(Debug, Clone)]
pub struct AggregatedResponse {
    pub bytes: Bytes,
    pub status_code: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Headers not fully received yet.
    Headers,
    /// Fixed-size body; total message size is known.
    Length(usize),
    /// Chunked transfer coding; scan for the terminal chunk.
    Chunked,
    /// No framing header: body runs until the peer closes.
    UntilClose,
    Complete,
}

/// Incremental response-boundary detector.
#[derive(Debug)]
pub struct ResponseAggregator {
    buf: BytesMut,
    framing: Framing,
    header_len: usize,
    status_code: u16,
}

impl Default for ResponseAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseAggregator {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            framing: Framing::Headers,
            header_len: 0,
            status_code: 0,
        }
    }

    pub fn bytes_received(&self) -> usize {
        self.buf.len()
    }

    /// Feed one read chunk. Returns `true` once the response is complete.
    pub fn push(&mut self, chunk: &[u8]) -> Result<bool> {
        self.buf.extend_from_slice(chunk);
        self.advance()?;
        Ok(self.framing == Framing::Complete)
    }

    /// The peer closed the connection. For close-delimited bodies that is
    /// the message boundary; anywhere else it means truncation.
    pub fn finish_on_close(mut self) -> Result<AggregatedResponse> {
        match self.framing {
            Framing::UntilClose => {
                self.framing = Framing::Complete;
                self.into_response()
            }
            Framing::Complete => self.into_response(),
            _ => Err(ReplayError::MalformedResponse(format!(
                "connection closed after {} bytes with incomplete response",
                self.buf.len()
            ))),
        }
    }

    pub fn into_response(self) -> Result<AggregatedResponse> {
        if self.framing != Framing::Complete {
            return Err(ReplayError::MalformedResponse(
                "response incomplete".to_string(),
            ));
        }
        Ok(AggregatedResponse {
            bytes: self.buf.freeze(),
            status_code: self.status_code,
        })
    }

    fn advance(&mut self) -> Result<()> {
        if self.framing == Framing::Headers {
            let Some(header_end) = find_subslice(&self.buf, b"\r\n\r\n") else {
                return Ok(());
            };
            self.header_len = header_end + 4;
            self.parse_head()?;
        }
        match self.framing {
            Framing::Length(total) => {
                if self.buf.len() >= total {
                    self.framing = Framing::Complete;
                }
            }
            Framing::Chunked => {
                if chunked_body_complete(&self.buf[self.header_len..])? {
                    self.framing = Framing::Complete;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn parse_head(&mut self) -> Result<()> {
        let head = &self.buf[..self.header_len];
        let head_str = std::str::from_utf8(head)
            .map_err(|_| ReplayError::MalformedResponse("non-UTF8 response head".to_string()))?;
        let mut lines = head_str.split("\r\n");

        let status_line = lines
            .next()
            .ok_or_else(|| ReplayError::MalformedResponse("empty response head".to_string()))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(ReplayError::MalformedResponse(format!(
                "bad status line: {status_line}"
            )));
        }
        self.status_code = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| {
                ReplayError::MalformedResponse(format!("bad status code in: {status_line}"))
            })?;

        let mut content_length: Option<usize> = None;
        let mut chunked = false;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = Some(value.parse().map_err(|_| {
                    ReplayError::MalformedResponse(format!("bad content-length: {value}"))
                })?);
            } else if name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                chunked = true;
            }
        }

        // Transfer-Encoding wins over Content-Length when both appear.
        self.framing = if chunked {
            Framing::Chunked
        } else if let Some(len) = content_length {
            Framing::Length(self.header_len + len)
        } else if (100..200).contains(&self.status_code)
            || self.status_code == 204
            || self.status_code == 304
        {
            // Bodyless by definition.
            Framing::Complete
        } else {
            Framing::UntilClose
        };
        Ok(())
    }
}

/// Walk chunk frames from the start of the body; complete once the
/// zero-length chunk and its trailing CRLF have arrived.
fn chunked_body_complete(body: &[u8]) -> Result<bool> {
    let mut pos = 0;
    loop {
        let Some(line_end) = find_subslice(&body[pos..], b"\r\n") else {
            return Ok(false);
        };
        let size_line = &body[pos..pos + line_end];
        let size_str = std::str::from_utf8(size_line)
            .map_err(|_| ReplayError::MalformedResponse("non-UTF8 chunk size".to_string()))?;
        let size_hex = size_str.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| {
            ReplayError::MalformedResponse(format!("bad chunk size: {size_hex}"))
        })?;
        pos += line_end + 2;

        if size == 0 {
            // Trailer section ends with a bare CRLF.
            return Ok(find_subslice(&body[pos..], b"\r\n").is_some());
        }
        // Chunk data plus its trailing CRLF.
        if body.len() < pos + size + 2 {
            return Ok(false);
        }
        pos += size + 2;
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_length_framing() {
        let mut agg = ResponseAggregator::new();
        assert!(!agg.push(b"HTTP/1.1 200 OK\r\nContent-Le").unwrap());
        assert!(!agg.push(b"ngth: 5\r\n\r\nhel").unwrap());
        assert!(agg.push(b"lo").unwrap());
        let response = agg.into_response().unwrap();
        assert_eq!(response.status_code, 200);
        assert!(response.bytes.ends_with(b"hello"));
    }

    #[test]
    fn test_chunked_framing() {
        let mut agg = ResponseAggregator::new();
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(!agg.push(head).unwrap());
        assert!(!agg.push(b"5\r\nhello\r\n").unwrap());
        assert!(agg.push(b"0\r\n\r\n").unwrap());
        let response = agg.into_response().unwrap();
        assert_eq!(response.status_code, 200);
    }

    #[test]
    fn test_bodyless_status_completes_at_header_end() {
        let mut agg = ResponseAggregator::new();
        assert!(agg.push(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap());
        assert_eq!(agg.into_response().unwrap().status_code, 204);
    }

    #[test]
    fn test_until_close_framing() {
        let mut agg = ResponseAggregator::new();
        assert!(!agg.push(b"HTTP/1.1 200 OK\r\n\r\npartial body").unwrap());
        let response = agg.finish_on_close().unwrap();
        assert_eq!(response.status_code, 200);
        assert!(response.bytes.ends_with(b"partial body"));
    }

    #[test]
    fn test_close_mid_message_is_malformed() {
        let mut agg = ResponseAggregator::new();
        assert!(!agg
            .push(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort")
            .unwrap());
        assert!(matches!(
            agg.finish_on_close(),
            Err(ReplayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_garbage_status_line_rejected() {
        let mut agg = ResponseAggregator::new();
        let err = agg.push(b"NOT-HTTP nonsense\r\n\r\n").unwrap_err();
        assert!(matches!(err, ReplayError::MalformedResponse(_)));
    }
}
