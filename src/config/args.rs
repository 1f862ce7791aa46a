//! Command-line arguments for the recast binary
//!
//! This module defines the CLI arguments structure using clap. Every option
//! can also be supplied through a `RECAST_*` environment variable.

use clap::Parser;
use std::path::PathBuf;

use super::defaults::*;

/// Command-line arguments for the recast replayer
#[derive(Parser, Debug, Clone)]
#[command(name = "recast")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Replay captured HTTP traffic against a target service")]
pub struct ReplayerArgs {
    /// Capture input: a file of length-delimited records, or `-` for stdin
    #[arg(long, env = "RECAST_INPUT", default_value = "-")]
    pub input: String,

    /// Output for replay tuples (JSON lines): a file path, or `-` for stdout
    #[arg(long, env = "RECAST_OUTPUT", default_value = "-")]
    pub output: String,

    /// Target service address (`host:port`)
    #[arg(long, env = "RECAST_TARGET_ADDR")]
    pub target_addr: String,

    /// Replay speed multiplier; values above 1.0 accelerate replay
    #[arg(long, env = "RECAST_SPEEDUP_FACTOR", default_value_t = DEFAULT_SPEEDUP_FACTOR)]
    pub speedup_factor: f64,

    /// How far past replay progress ingestion may read ahead, in capture
    /// milliseconds. Smaller values tighten backpressure and memory use.
    #[arg(long, env = "RECAST_BUFFER_WINDOW_MS", default_value_t = DEFAULT_BUFFER_WINDOW_MS)]
    pub buffer_window_ms: u64,

    /// How long a stalled connection stays replayable behind the newest
    /// observed capture timestamp, in capture milliseconds
    #[arg(long, env = "RECAST_EXPIRY_WINDOW_MS", default_value_t = DEFAULT_EXPIRY_WINDOW_MS)]
    pub expiry_window_ms: u64,

    /// Time-bucket granularity of the expiry registry, in capture
    /// milliseconds
    #[arg(long, env = "RECAST_EXPIRY_GRANULARITY_MS", default_value_t = DEFAULT_EXPIRY_GRANULARITY_MS)]
    pub expiry_granularity_ms: u64,

    /// Bounded retry count for expiry bookkeeping races
    #[arg(long, env = "RECAST_MAX_TOUCH_RETRIES", default_value_t = DEFAULT_MAX_TOUCH_RETRIES)]
    pub max_touch_retries: u32,

    /// Global bound on concurrently in-flight replayed requests
    #[arg(long, env = "RECAST_MAX_CONCURRENT_REQUESTS", default_value_t = DEFAULT_MAX_CONCURRENT_REQUESTS)]
    pub max_concurrent_requests: usize,

    /// Per-request target response timeout in milliseconds
    #[arg(long, env = "RECAST_RESPONSE_TIMEOUT_MS", default_value_t = DEFAULT_RESPONSE_TIMEOUT_MS)]
    pub response_timeout_ms: u64,

    /// Target connect timeout in milliseconds
    #[arg(long, env = "RECAST_CONNECT_TIMEOUT_MS", default_value_t = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,

    /// Maximum re-issues after a failed target attempt
    #[arg(long, env = "RECAST_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Grace period for draining outstanding work on shutdown, in
    /// milliseconds
    #[arg(long, env = "RECAST_SHUTDOWN_TIMEOUT_MS", default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_MS)]
    pub shutdown_timeout_ms: u64,

    /// Worker threads for the replay runtime (default: CPU count)
    #[arg(long, env = "RECAST_WORKER_THREADS")]
    pub worker_threads: Option<usize>,

    /// Replace the Authorization header on every replayed request
    #[arg(long, env = "RECAST_AUTH_HEADER")]
    pub auth_header: Option<String>,

    /// Rewrite the Host header on every replayed request
    #[arg(long, env = "RECAST_HOST_REWRITE")]
    pub host_rewrite: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RECAST_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,
}

impl ReplayerArgs {
    /// Whether input should be read from stdin.
    pub fn input_is_stdin(&self) -> bool {
        self.input == "-"
    }

    /// Whether output should go to stdout.
    pub fn output_is_stdout(&self) -> bool {
        self.output == "-"
    }

    pub fn input_path(&self) -> Option<PathBuf> {
        (!self.input_is_stdin()).then(|| PathBuf::from(&self.input))
    }

    pub fn output_path(&self) -> Option<PathBuf> {
        (!self.output_is_stdout()).then(|| PathBuf::from(&self.output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_with_defaults() {
        let args =
            ReplayerArgs::try_parse_from(["recast", "--target-addr", "localhost:9200"]).unwrap();
        assert_eq!(args.target_addr, "localhost:9200");
        assert_eq!(args.speedup_factor, DEFAULT_SPEEDUP_FACTOR);
        assert_eq!(args.buffer_window_ms, DEFAULT_BUFFER_WINDOW_MS);
        assert!(args.input_is_stdin());
        assert!(args.output_is_stdout());
    }

    #[test]
    fn test_args_require_target() {
        assert!(ReplayerArgs::try_parse_from(["recast"]).is_err());
    }

    #[test]
    fn test_paths_resolved_when_not_stdio() {
        let args = ReplayerArgs::try_parse_from([
            "recast",
            "--target-addr",
            "localhost:9200",
            "--input",
            "capture.bin",
            "--output",
            "out.jsonl",
        ])
        .unwrap();
        assert_eq!(args.input_path(), Some(PathBuf::from("capture.bin")));
        assert_eq!(args.output_path(), Some(PathBuf::from("out.jsonl")));
    }
}
