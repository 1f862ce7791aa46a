//! Default constants for recast configuration

/// Replay pace relative to capture pace; 1.0 preserves original timing.
pub const DEFAULT_SPEEDUP_FACTOR: f64 = 1.0;

/// How far past replay progress ingestion may read ahead.
pub const DEFAULT_BUFFER_WINDOW_MS: u64 = 5_000;

/// How far behind the newest observed timestamp a connection may still be
/// touched before it is expired.
pub const DEFAULT_EXPIRY_WINDOW_MS: u64 = 120_000;

/// Quantization of the expiry registry's time buckets.
pub const DEFAULT_EXPIRY_GRANULARITY_MS: u64 = 1_000;

/// CAS retry bound for expiry bookkeeping.
pub const DEFAULT_MAX_TOUCH_RETRIES: u32 = 5;

/// Global bound on concurrently in-flight replayed requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1_024;

/// How long to wait for the target's aggregated response.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 30_000;

/// Target connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Re-issues after a failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Grace period for draining outstanding work on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_LOG_LEVEL: &str = "info";
