#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # recast
//!
//! recast reconstructs HTTP request/response transactions from a capture of
//! raw, possibly out-of-order and interleaved, network observations recorded
//! on many concurrent source connections, and replays those transactions
//! against a target service while preserving each connection's original
//! ordering, optionally at an accelerated pace. It is built for
//! migration/validation tooling that compares a legacy service's recorded
//! behavior against a new target.
//!
//! ## Pipeline
//!
//! ```text
//! capture records -> gated source -> accumulator -> engine
//!   -> orchestrator (admission + pacing) -> session pool -> target
//!   -> output tuples -> commit back to the capture source
//! ```
//!
//! - [`capture`]: the traffic data model, wire codec, sources, and the
//!   watermark gate that bounds how far ingestion runs ahead of replay
//! - [`accumulate`]: the per-connection state machine and the time-windowed
//!   expiry registry that bounds its working set
//! - [`replay`]: time shifting, admission control, per-session ordering,
//!   connection pooling, retries, and the engine
//! - [`transform`]: request/auth rewriting seams applied before send
//! - [`output`]: the per-transaction result tuple and sinks
//! - [`config`]: CLI arguments and validated configuration
//! - [`error`]: error types and the crate [`Result`] alias
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use recast::capture::{BlockingTrafficSource, FileTrafficSource};
//! use recast::config::ReplayerConfig;
//! use recast::output::JsonLinesSink;
//! use recast::replay::{DefaultRetryPolicy, ReplayEngine};
//! use recast::transform::IdentityTransformFactory;
//!
//! #[tokio::main]
//! async fn main() -> recast::Result<()> {
//!     let config = ReplayerConfig::for_target("localhost:9200");
//!     let source = Arc::new(FileTrafficSource::open("capture.bin").await?);
//!     let gate = Arc::new(BlockingTrafficSource::new(
//!         source,
//!         config.buffer_window_ms as i64,
//!     ));
//!     let sink = Arc::new(JsonLinesSink::new(Box::new(tokio::io::stdout())));
//!
//!     let engine = ReplayEngine::new(
//!         config,
//!         gate,
//!         sink,
//!         Arc::new(IdentityTransformFactory),
//!         Arc::new(DefaultRetryPolicy),
//!     )?;
//!     let stats = engine.run().await?;
//!     println!("replayed {} transactions", stats.transactions_succeeded);
//!     Ok(())
//! }
//! ```

// Deny .unwrap() in production code; test code is exempt.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod accumulate;
pub mod capture;
pub mod config;
pub mod error;
pub mod output;
pub mod replay;
pub mod transform;

pub use error::{ReplayError, Result};
pub use replay::{ReplayEngine, ReplayStatsSnapshot};
