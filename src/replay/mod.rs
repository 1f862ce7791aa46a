//! Replay execution substrate
//!
//! Everything between a reconstructed transaction and the target's wire:
//! capture-to-wall-clock mapping, global admission control, per-session
//! ordering, connection pooling, send orchestration with retries, and the
//! engine that glues it to the accumulator and the upstream commit contract.

pub mod clock;
pub mod engine;
pub mod http;
pub mod limiter;
pub mod orchestrator;
pub mod pool;
pub mod sequencer;
pub mod session;

pub use clock::TimeShifter;
pub use engine::{ReplayEngine, ReplayStats, ReplayStatsSnapshot};
pub use http::{AggregatedResponse, ResponseAggregator};
pub use limiter::{AdmissionLimiter, AdmissionPermit};
pub use orchestrator::{
    DefaultRetryPolicy, OrchestratorConfig, RequestSenderOrchestrator, RetryDirective,
    RetryPolicy, TargetResult,
};
pub use pool::{ClientConnectionPool, PoolConfig};
pub use sequencer::ScheduleSequencer;
pub use session::{ConnectionReplaySession, SessionKey, UniqueRequestKey};
