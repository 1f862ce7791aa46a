//! End-to-end replay tests: capture records in, target traffic and output
//! tuples out, upstream commits observed.

mod common;

use common::*;
use recast::accumulate::CompletionStatus;
use recast::capture::source::ChannelTrafficSource;
use recast::capture::{BlockingTrafficSource, Observation, TrafficSource, TrafficStream};
use recast::config::ReplayerConfig;
use recast::output::VecSink;
use recast::replay::{DefaultRetryPolicy, ReplayEngine};
use recast::transform::IdentityTransformFactory;
use std::sync::Arc;

fn fast_config(target: std::net::SocketAddr) -> ReplayerConfig {
    let mut config = ReplayerConfig::for_target(target.to_string());
    config.speedup_factor = 1_000.0;
    config.response_timeout_ms = 2_000;
    config.connect_timeout_ms = 1_000;
    config.shutdown_timeout_ms = 5_000;
    config
}

struct Harness {
    engine: Arc<ReplayEngine>,
    sink: Arc<VecSink>,
    source: Arc<ChannelTrafficSource>,
    tx: tokio::sync::mpsc::Sender<TrafficStream>,
}

fn harness(config: ReplayerConfig) -> Harness {
    let (tx, source) = ChannelTrafficSource::new(64);
    let source = Arc::new(source);
    let gate = Arc::new(BlockingTrafficSource::new(
        source.clone(),
        config.buffer_window_ms as i64,
    ));
    let sink = Arc::new(VecSink::new());
    let engine = Arc::new(
        ReplayEngine::new(
            config,
            gate,
            sink.clone(),
            Arc::new(IdentityTransformFactory),
            Arc::new(DefaultRetryPolicy),
        )
        .expect("engine construction"),
    );
    Harness {
        engine,
        sink,
        source,
        tx,
    }
}

#[tokio::test]
async fn test_single_transaction_end_to_end() {
    let (addr, target_log, _target) = spawn_http_target().await;
    let h = harness(fast_config(addr));

    h.tx.send(request_record("c1", "/", 1_000)).await.unwrap();
    h.tx.send(response_record("c1", "source-body", 1_500))
        .await
        .unwrap();
    drop(h.tx);

    let stats = h.engine.run().await.unwrap();
    assert_eq!(stats.records_read, 2);
    assert_eq!(stats.requests_scheduled, 1);
    assert_eq!(stats.transactions_succeeded, 1);
    assert_eq!(stats.transactions_failed, 0);

    // Exactly one outcome with the exact source bytes.
    let outcomes = h.sink.outcomes();
    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert_eq!(outcome.connection_id, "c1");
    assert_eq!(outcome.interaction_index, 0);
    assert_eq!(outcome.status, CompletionStatus::ClosedNormally);
    assert_eq!(
        decode_b64(&outcome.source_request_b64),
        b"GET / HTTP/1.1\r\nHost: source\r\n\r\n"
    );
    let source_response = decode_b64(&outcome.source_response_b64);
    assert!(source_response.ends_with(b"source-body"));
    assert!(outcome.source_first_timestamp_ms.unwrap() <= outcome.source_last_timestamp_ms.unwrap());

    // One target attempt with the target's actual answer.
    assert_eq!(outcome.target_attempts.len(), 1);
    assert_eq!(outcome.target_attempts[0].status_code, Some(200));
    assert!(outcome.error.is_none());

    // The target saw exactly the captured request.
    assert_eq!(target_log.request_lines(), vec!["GET / HTTP/1.1".to_string()]);

    // Both upstream records were committed once replay resolved.
    assert_eq!(h.source.committed_count(), 2);
    assert_eq!(stats.records_committed, 2);
}

#[tokio::test]
async fn test_keepalive_transactions_preserve_capture_order() {
    let (addr, target_log, _target) = spawn_http_target().await;
    let h = harness(fast_config(addr));

    // Five request/response transactions on one kept-alive connection.
    for i in 0..5 {
        let ts = 1_000 + i as i64 * 100;
        h.tx.send(request_record("c1", &format!("/{i}"), ts))
            .await
            .unwrap();
        h.tx.send(response_record("c1", "resp", ts + 50))
            .await
            .unwrap();
    }
    drop(h.tx);

    let stats = h.engine.run().await.unwrap();
    assert_eq!(stats.transactions_succeeded, 5);

    // The target received the requests in capture-index order even though
    // preparation was concurrent.
    let lines = target_log.request_lines();
    assert_eq!(
        lines,
        (0..5)
            .map(|i| format!("GET /{i} HTTP/1.1"))
            .collect::<Vec<_>>()
    );

    // All ten records released upstream.
    assert_eq!(h.source.committed_count(), 10);
}

#[tokio::test]
async fn test_multiple_connections_replay_concurrently() {
    let (addr, target_log, _target) = spawn_http_target().await;
    let h = harness(fast_config(addr));

    for conn in ["a", "b", "c"] {
        h.tx.send(request_record(conn, &format!("/{conn}"), 1_000))
            .await
            .unwrap();
        h.tx.send(response_record(conn, "resp", 1_400))
            .await
            .unwrap();
    }
    drop(h.tx);

    let stats = h.engine.run().await.unwrap();
    assert_eq!(stats.transactions_succeeded, 3);
    assert_eq!(h.sink.len(), 3);

    let mut lines = target_log.request_lines();
    lines.sort();
    assert_eq!(
        lines,
        vec!["GET /a HTTP/1.1", "GET /b HTTP/1.1", "GET /c HTTP/1.1"]
    );
}

#[tokio::test]
async fn test_premature_close_still_produces_outcome_and_commit() {
    let (addr, _target_log, _target) = spawn_http_target().await;
    let h = harness(fast_config(addr));

    // Request completes, then the connection dies before any response.
    h.tx.send(request_record("c1", "/", 1_000)).await.unwrap();
    h.tx.send(TrafficStream::new(
        "node-1",
        "c1",
        vec![Observation::connection_exception(1_200, "reset by peer")],
    ))
    .await
    .unwrap();
    drop(h.tx);

    let stats = h.engine.run().await.unwrap();
    let outcomes = h.sink.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, CompletionStatus::ClosedPrematurely);
    assert!(decode_b64(&outcomes[0].source_response_b64).is_empty());
    // The request itself was still replayed against the target.
    assert_eq!(outcomes[0].target_attempts.len(), 1);

    // Every record released: the exception record carried no retained data.
    assert_eq!(h.source.committed_count(), 2);
    assert_eq!(stats.records_read, 2);
}

#[tokio::test]
async fn test_unreachable_target_reports_failures_not_abort() {
    let mut config = ReplayerConfig::for_target("127.0.0.1:1".to_string());
    config.speedup_factor = 1_000.0;
    config.connect_timeout_ms = 200;
    config.max_retries = 1;
    config.shutdown_timeout_ms = 5_000;
    let h = harness(config);

    h.tx.send(request_record("c1", "/", 1_000)).await.unwrap();
    h.tx.send(response_record("c1", "resp", 1_100)).await.unwrap();
    drop(h.tx);

    // Per-transaction failures never abort the run.
    let stats = h.engine.run().await.unwrap();
    assert_eq!(stats.transactions_failed, 1);
    assert_eq!(stats.transactions_succeeded, 0);

    let outcomes = h.sink.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].error.is_some());
    // max_retries = 1 bounds attempts at 2.
    assert_eq!(outcomes[0].target_attempts.len(), 2);

    // Failed transactions still release their upstream records.
    assert_eq!(h.source.committed_count(), 2);
}

#[tokio::test]
async fn test_shutdown_mid_run_drains_and_flushes() {
    let (addr, _target_log, _target) = spawn_http_target().await;
    let h = harness(fast_config(addr));

    h.tx.send(request_record("c1", "/", 1_000)).await.unwrap();
    h.tx.send(response_record("c1", "resp", 1_100)).await.unwrap();
    // Keep the sender open so ingestion would otherwise wait forever.

    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.run().await });
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    h.engine.shutdown();
    let stats = run.await.unwrap().unwrap();

    // The transaction that made it in was fully replayed and flushed.
    assert_eq!(stats.transactions_succeeded, 1);
    assert_eq!(h.sink.len(), 1);
}
