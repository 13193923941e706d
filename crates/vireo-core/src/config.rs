//! Engine configuration
//!
//! Every threshold the decision algorithms consult lives here; the defaults
//! are reasonable starting points, not load-bearing constants.

use crate::endpoint::EndpointCandidate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Adaptive-bitrate selection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbrConfig {
    /// Fraction of the bandwidth estimate a level may consume (<1)
    pub bandwidth_safety_factor: f64,
    /// Below this buffer level, only downswitches are allowed (seconds)
    pub min_buffer_level: f64,
    /// Above this buffer level, quality may rise freely (seconds)
    pub max_buffer_level: f64,
    /// Below this buffer level, collapse to the lowest quality (seconds)
    pub panic_buffer_level: f64,
    /// Minimum dwell time between switches
    pub min_time_between_switches: Duration,
    /// Maximum level-index steps per switch
    pub max_level_jump: usize,
    /// Lowest selectable level index (None = no limit)
    pub min_quality: Option<usize>,
    /// Highest selectable level index (None = no limit)
    pub max_quality: Option<usize>,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            bandwidth_safety_factor: 0.9,
            min_buffer_level: 10.0,
            max_buffer_level: 30.0,
            panic_buffer_level: 2.0,
            min_time_between_switches: Duration::from_secs(3),
            max_level_jump: 2,
            min_quality: None,
            max_quality: None,
        }
    }
}

/// Buffer monitoring and remediation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Initial buffer target (seconds)
    pub target_buffer_length: f64,
    /// Floor for the adaptive buffer target (seconds)
    pub min_buffer_length: f64,
    /// Ceiling for the adaptive buffer target (seconds)
    pub max_buffer_length: f64,
    /// Below this, health is critical (seconds)
    pub critical_buffer_level: f64,
    /// Below this, health is low (seconds)
    pub min_buffer_level: f64,
    /// Above this, health is excellent (seconds)
    pub optimal_buffer_level: f64,
    /// More holes than this classifies as fragmented
    pub max_buffer_holes: usize,
    /// Request playback pause when health turns critical
    pub pause_on_critical: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            target_buffer_length: 20.0,
            min_buffer_length: 5.0,
            max_buffer_length: 60.0,
            critical_buffer_level: 2.0,
            min_buffer_level: 10.0,
            optimal_buffer_level: 30.0,
            max_buffer_holes: 2,
            pause_on_critical: false,
        }
    }
}

/// Exponential-backoff retry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt (total tries = max_attempts + 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    /// Jitter fraction in [0, 1)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the breaker closes
    pub success_threshold: u32,
    /// Open-state cooldown before the next probe is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Network resilience tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Byte budget for the offline segment cache
    pub cache_budget_bytes: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache_budget_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Endpoint scoring weights. Must sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub latency: f64,
    pub throughput: f64,
    pub availability: f64,
    pub distance: f64,
    pub cost: f64,
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.latency + self.throughput + self.availability + self.distance + self.cost
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            latency: 0.3,
            throughput: 0.3,
            availability: 0.2,
            distance: 0.1,
            cost: 0.1,
        }
    }
}

/// Delivery endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Preferred origin
    pub primary: EndpointCandidate,
    /// Failover origins, in preference order
    pub fallbacks: Vec<EndpointCandidate>,
    /// Scoring weights
    pub weights: ScoreWeights,
    /// Overall deadline for one probe round across all candidates
    pub probe_timeout: Duration,
    /// Size of the ranged throughput-probe fetch
    pub probe_sample_bytes: u64,
    /// Client position for edge-distance scoring
    pub client_position: Option<crate::types::GeoPoint>,
}

impl EndpointConfig {
    pub fn single(primary: EndpointCandidate) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
            weights: ScoreWeights::default(),
            probe_timeout: Duration::from_secs(5),
            probe_sample_bytes: 128 * 1024,
            client_position: None,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub abr: AbrConfig,
    pub buffer: BufferConfig,
    pub resilience: ResilienceConfig,
    pub endpoints: EndpointConfig,
    /// Estimate returned before the first bandwidth sample (bps)
    pub default_bandwidth_bps: u64,
    /// Decision-loop cadence
    pub tick_interval: Duration,
}

impl EngineConfig {
    pub fn new(endpoints: EndpointConfig) -> Self {
        Self {
            abr: AbrConfig::default(),
            buffer: BufferConfig::default(),
            resilience: ResilienceConfig::default(),
            endpoints,
            default_bandwidth_bps: 1_000_000,
            tick_interval: Duration::from_secs(1),
        }
    }

    /// Sanity-check cross-field invariants
    pub fn validate(&self) -> crate::Result<()> {
        if !(0.0..1.0).contains(&self.abr.bandwidth_safety_factor) {
            return Err(crate::Error::InvalidConfig(
                "bandwidth_safety_factor must be in (0, 1)".to_string(),
            ));
        }
        if self.abr.panic_buffer_level > self.abr.min_buffer_level {
            return Err(crate::Error::InvalidConfig(
                "panic_buffer_level must not exceed min_buffer_level".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.resilience.retry.jitter_factor) {
            return Err(crate::Error::InvalidConfig(
                "jitter_factor must be in [0, 1)".to_string(),
            ));
        }
        let weight_sum = self.endpoints.weights.sum();
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(crate::Error::InvalidConfig(format!(
                "endpoint score weights must sum to 1.0, got {weight_sum}"
            )));
        }
        Ok(())
    }
}
