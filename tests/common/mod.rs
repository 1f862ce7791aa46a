//! Shared test fixtures for recast integration tests
//!
//! Provides an in-process HTTP/1.1 target that records the requests it
//! receives, plus builders for capture records.

#![allow(dead_code)]

use recast::capture::{Observation, TrafficStream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Requests observed by the test target, in wire arrival order.
#[derive(Default)]
pub struct RequestLog {
    entries: parking_lot::Mutex<Vec<String>>,
}

impl RequestLog {
    /// First line of every request received so far.
    pub fn request_lines(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn push(&self, line: String) {
        self.entries.lock().push(line);
    }
}

/// Spawn an HTTP/1.1 target that answers every request with
/// `200 OK` / `Content-Length: 2` / body `ok`, recording request lines.
pub async fn spawn_http_target() -> (SocketAddr, Arc<RequestLog>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test target");
    let addr = listener.local_addr().expect("target local addr");
    let log = Arc::new(RequestLog::default());

    let accept_log = log.clone();
    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let log = accept_log.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 16 * 1024];
                loop {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);

                    // Answer once per complete request head. Test requests
                    // carry no body.
                    while let Some(end) = find_subslice(&buf, b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&buf[..end]).to_string();
                        if let Some(line) = head.lines().next() {
                            log.push(line.to_string());
                        }
                        buf.drain(..end + 4);
                        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
                        if socket.write_all(response).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    (addr, log, handle)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A capture record holding one complete request for `connection`.
pub fn request_record(connection: &str, path: &str, ts: i64) -> TrafficStream {
    let request = format!("GET {path} HTTP/1.1\r\nHost: source\r\n\r\n");
    TrafficStream::new(
        "node-1",
        connection,
        vec![
            Observation::read(ts, request.into_bytes()),
            Observation::end_of_message(ts + 1),
        ],
    )
}

/// A capture record holding one complete response for `connection`.
pub fn response_record(connection: &str, body: &str, ts: i64) -> TrafficStream {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    TrafficStream::new(
        "node-1",
        connection,
        vec![
            Observation::write(ts, response.into_bytes()),
            Observation::end_of_message(ts + 1),
        ],
    )
}

/// Decode a base64 payload captured in an outcome tuple.
pub fn decode_b64(data: &str) -> Vec<u8> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .expect("valid base64 payload")
}
