//! Core types for the streaming engine

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single rung of the quality ladder.
///
/// The engine holds these sorted ascending by bitrate; index 0 is the
/// always-available lowest-quality fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityLevel {
    /// Bitrate in bits per second
    pub bitrate: u64,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub frame_rate: f32,
    /// Codec string (e.g. "avc1.640028")
    pub codec: String,
}

impl QualityLevel {
    pub fn new(bitrate: u64, width: u32, height: u32) -> Self {
        Self {
            bitrate,
            width,
            height,
            frame_rate: 30.0,
            codec: "avc1.640028".to_string(),
        }
    }

    /// Returns quality tier name
    pub fn quality_name(&self) -> &'static str {
        match self.height {
            0..=240 => "240p",
            241..=360 => "360p",
            361..=480 => "480p",
            481..=720 => "720p",
            721..=1080 => "1080p",
            1081..=1440 => "1440p",
            _ => "4K",
        }
    }
}

/// Device-side limits applied as the last ABR stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceConstraints {
    /// Viewport width in CSS pixels
    pub viewport_width: u32,
    /// Viewport height in CSS pixels
    pub viewport_height: u32,
    /// Device pixel ratio
    pub pixel_ratio: f64,
    /// Low-power signal (battery saver, thermal throttling)
    pub low_power: bool,
}

impl DeviceConstraints {
    const LOW_POWER_MAX_HEIGHT: u32 = 720;

    /// Maximum useful frame height for this device
    pub fn max_height(&self) -> u32 {
        let physical = (self.viewport_height as f64 * self.pixel_ratio) as u32;
        if self.low_power {
            physical.min(Self::LOW_POWER_MAX_HEIGHT)
        } else {
            physical
        }
    }
}

/// Connection quality tier derived from the current bandwidth estimate.
///
/// Drives the adaptive per-request timeout: fast links fail fast, slow
/// links get room to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Moderate,
    Poor,
}

impl ConnectionQuality {
    /// Classify a bandwidth estimate in bits per second
    pub fn from_bandwidth(bits_per_sec: u64) -> Self {
        match bits_per_sec {
            bps if bps >= 10_000_000 => ConnectionQuality::Excellent,
            bps if bps >= 3_000_000 => ConnectionQuality::Good,
            bps if bps >= 1_000_000 => ConnectionQuality::Moderate,
            _ => ConnectionQuality::Poor,
        }
    }

    /// Per-request timeout for this tier
    pub fn request_timeout(&self) -> Duration {
        match self {
            ConnectionQuality::Excellent => Duration::from_secs(5),
            ConnectionQuality::Good => Duration::from_secs(10),
            ConnectionQuality::Moderate => Duration::from_secs(20),
            ConnectionQuality::Poor => Duration::from_secs(30),
        }
    }
}

/// A downloaded (playable) span of the media timeline, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

/// A gap between downloaded ranges
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferHole {
    pub start: f64,
    pub end: f64,
}

impl BufferHole {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Discrete buffer health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferHealth {
    Critical,
    Low,
    Fragmented,
    Good,
    Excellent,
}

impl std::fmt::Display for BufferHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferHealth::Critical => write!(f, "critical"),
            BufferHealth::Low => write!(f, "low"),
            BufferHealth::Fragmented => write!(f, "fragmented"),
            BufferHealth::Good => write!(f, "good"),
            BufferHealth::Excellent => write!(f, "excellent"),
        }
    }
}

/// A point on the globe, for edge-distance scoring
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Session quality metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Bitrate of the currently selected level in bps
    pub current_bitrate: u64,
    /// Most recent buffer level in seconds
    pub buffer_level: f64,
    /// Number of playback stalls
    pub stall_count: u32,
    /// Total time spent stalled in seconds
    pub stall_duration: f64,
    /// Number of quality switches
    pub quality_switches: u32,
    /// Current bandwidth estimate in bps
    pub average_throughput: u64,
}

impl QualityMetrics {
    /// Calculate Quality of Experience score (0-100)
    pub fn qoe_score(&self) -> f64 {
        let bitrate_score = match self.current_bitrate {
            b if b >= 5_000_000 => 100.0,
            b if b >= 2_500_000 => 80.0,
            b if b >= 1_000_000 => 60.0,
            _ => 40.0,
        };

        // Stalls dominate perceived quality
        let stall_penalty = (self.stall_count as f64 * 10.0 + self.stall_duration * 5.0).min(50.0);
        let switch_penalty = (self.quality_switches as f64 * 2.0).min(20.0);

        (bitrate_score - stall_penalty - switch_penalty).clamp(0.0, 100.0)
    }
}
