//! Configuration for the recast replayer
//!
//! - `defaults` - default constants
//! - `args` - CLI argument definitions
//!
//! [`ReplayerConfig`] is the validated form consumed by the engine; it is
//! built from CLI args (which also read `RECAST_*` environment variables).

mod args;
mod defaults;

pub use args::ReplayerArgs;
pub use defaults::*;

use crate::error::{ReplayError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete replayer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayerConfig {
    pub target_addr: String,

    #[serde(default = "default_speedup_factor")]
    pub speedup_factor: f64,

    #[serde(default = "default_buffer_window_ms")]
    pub buffer_window_ms: u64,

    #[serde(default = "default_expiry_window_ms")]
    pub expiry_window_ms: u64,

    #[serde(default = "default_expiry_granularity_ms")]
    pub expiry_granularity_ms: u64,

    #[serde(default = "default_max_touch_retries")]
    pub max_touch_retries: u32,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(default)]
    pub auth_header: Option<String>,

    #[serde(default)]
    pub host_rewrite: Option<String>,
}

fn default_speedup_factor() -> f64 {
    DEFAULT_SPEEDUP_FACTOR
}
fn default_buffer_window_ms() -> u64 {
    DEFAULT_BUFFER_WINDOW_MS
}
fn default_expiry_window_ms() -> u64 {
    DEFAULT_EXPIRY_WINDOW_MS
}
fn default_expiry_granularity_ms() -> u64 {
    DEFAULT_EXPIRY_GRANULARITY_MS
}
fn default_max_touch_retries() -> u32 {
    DEFAULT_MAX_TOUCH_RETRIES
}
fn default_max_concurrent_requests() -> usize {
    DEFAULT_MAX_CONCURRENT_REQUESTS
}
fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_MS
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

impl ReplayerConfig {
    /// Build configuration from parsed CLI arguments.
    pub fn from_args(args: &ReplayerArgs) -> Self {
        Self {
            target_addr: args.target_addr.clone(),
            speedup_factor: args.speedup_factor,
            buffer_window_ms: args.buffer_window_ms,
            expiry_window_ms: args.expiry_window_ms,
            expiry_granularity_ms: args.expiry_granularity_ms,
            max_touch_retries: args.max_touch_retries,
            max_concurrent_requests: args.max_concurrent_requests,
            response_timeout_ms: args.response_timeout_ms,
            connect_timeout_ms: args.connect_timeout_ms,
            max_retries: args.max_retries,
            shutdown_timeout_ms: args.shutdown_timeout_ms,
            auth_header: args.auth_header.clone(),
            host_rewrite: args.host_rewrite.clone(),
        }
    }

    /// A config for tests and embeddings pointing at `target_addr`, with
    /// tight timeouts.
    pub fn for_target(target_addr: impl Into<String>) -> Self {
        Self {
            target_addr: target_addr.into(),
            speedup_factor: DEFAULT_SPEEDUP_FACTOR,
            buffer_window_ms: DEFAULT_BUFFER_WINDOW_MS,
            expiry_window_ms: DEFAULT_EXPIRY_WINDOW_MS,
            expiry_granularity_ms: DEFAULT_EXPIRY_GRANULARITY_MS,
            max_touch_retries: DEFAULT_MAX_TOUCH_RETRIES,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            auth_header: None,
            host_rewrite: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_addr.is_empty() {
            return Err(ReplayError::Config("target address is required".into()));
        }
        if self.speedup_factor <= 0.0 {
            return Err(ReplayError::Config(format!(
                "speedup factor must be positive, got {}",
                self.speedup_factor
            )));
        }
        if self.expiry_granularity_ms == 0 {
            return Err(ReplayError::Config(
                "expiry granularity must be non-zero".into(),
            ));
        }
        if self.expiry_granularity_ms > self.expiry_window_ms {
            return Err(ReplayError::Config(format!(
                "expiry granularity ({} ms) exceeds the expiry window ({} ms)",
                self.expiry_granularity_ms, self.expiry_window_ms
            )));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ReplayError::Config(
                "max concurrent requests must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_from_args_carries_everything() {
        let args = ReplayerArgs::try_parse_from([
            "recast",
            "--target-addr",
            "localhost:9200",
            "--speedup-factor",
            "8.0",
            "--auth-header",
            "Basic Zm9v",
        ])
        .unwrap();
        let config = ReplayerConfig::from_args(&args);
        assert_eq!(config.target_addr, "localhost:9200");
        assert_eq!(config.speedup_factor, 8.0);
        assert_eq!(config.auth_header.as_deref(), Some("Basic Zm9v"));
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ReplayerConfig::for_target("localhost:9200");
        config.speedup_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = ReplayerConfig::for_target("localhost:9200");
        config.expiry_granularity_ms = config.expiry_window_ms + 1;
        assert!(config.validate().is_err());

        let mut config = ReplayerConfig::for_target("localhost:9200");
        config.max_concurrent_requests = 0;
        assert!(config.validate().is_err());
    }
}
