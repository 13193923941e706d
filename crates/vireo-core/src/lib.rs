//! Vireo Core - Adaptive Streaming Client Engine
//!
//! This crate provides the per-session decision core of a streaming client:
//! - Bandwidth estimation from completed segment fetches
//! - Adaptive bitrate (ABR) level selection
//! - Buffer health monitoring with remediation policy
//! - Retry, circuit breaking, and the offline cache path
//! - Delivery endpoint scoring and failover
//! - A last-resort ordered recovery chain
//!
//! Manifest parsing, media decode, DRM, and UI are external collaborators:
//! the engine consumes a quality ladder and playback state, and emits
//! selected levels, fetch requests, and typed telemetry events.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Vireo Core                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  Bandwidth   │  │    Buffer    │  │     ABR      │           │
//! │  │  Estimator   │  │   Monitor    │  │   Engine     │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │   Stream    │                              │
//! │                    │   Session   │                              │
//! │                    └──────┬──────┘                              │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐            │
//! │  │   Endpoint   │  │  Resilience │  │   Fallback   │            │
//! │  │   Selector   │  │   Manager   │  │ Orchestrator │            │
//! │  └──────────────┘  └─────────────┘  └──────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod abr;
pub mod bandwidth;
pub mod buffer;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod fallback;
pub mod resilience;
pub mod session;
pub mod types;

pub use abr::{AbrContext, AbrDecision, AbrDecisionEngine, SwitchReason};
pub use bandwidth::BandwidthEstimator;
pub use buffer::{BufferInfo, BufferMonitor, PreloadMode, RemediationAction, StallDetector, StallEvent};
pub use config::{
    AbrConfig, BufferConfig, CircuitBreakerConfig, EndpointConfig, EngineConfig, ResilienceConfig,
    RetryConfig, ScoreWeights,
};
pub use endpoint::{EndpointCandidate, EndpointProber, EndpointSelector, HttpProber, ProbeResult};
pub use error::{Error, Result};
pub use events::{EngineEvent, TelemetryRecord, TelemetrySink};
pub use fallback::{FallbackContext, FallbackOrchestrator, RecoveryAction};
pub use resilience::{
    CircuitBreaker, CircuitState, HttpTransport, NetworkResilienceManager, RetryPolicy,
    SegmentCache, SegmentRequest, Transport,
};
pub use session::StreamSession;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine library with default configuration
pub fn init() {
    tracing::info!(version = VERSION, "Vireo Core initialized");
}
