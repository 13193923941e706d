//! Buffer health monitoring and remediation
//!
//! `compute_buffer_info` is recomputed from scratch every tick from the
//! playback position and the downloaded ranges; nothing here caches timeline
//! state. Remediation never touches playback directly — it returns an action
//! the session turns into an outbound signal.

use crate::config::BufferConfig;
use crate::types::{BufferHealth, BufferHole, TimeRange};
use serde::Serialize;
use std::time::Instant;
use tracing::debug;

/// Gaps shorter than this are measurement noise, not holes
pub const HOLE_NOISE_FLOOR_SECS: f64 = 0.1;

/// Snapshot of the buffered timeline, recomputed each tick
#[derive(Debug, Clone, Serialize)]
pub struct BufferInfo {
    /// Buffered seconds ahead of the playhead
    pub length: f64,
    /// Start of the buffered region
    pub start: f64,
    /// End of the buffered region
    pub end: f64,
    /// Gaps ahead of the playhead, noise excluded
    pub holes: Vec<BufferHole>,
    /// Buffered share of the whole content, 0-100
    pub percentage_of_duration: f64,
    pub health: BufferHealth,
}

/// Segment preloading intensity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadMode {
    Normal,
    Aggressive,
}

/// One remediation step per tick, dispatched by health classification
#[derive(Debug, Clone, PartialEq)]
pub enum RemediationAction {
    /// Critical: drop to the lowest quality immediately
    ForceLowestQuality { pause: bool },
    /// Low: buffer more before playing on
    RaiseBufferTarget { seconds: f64 },
    /// Fragmented: jump over the first hole ahead
    SeekToContiguous { position: f64 },
    /// Excellent: stop hoarding bandwidth
    LowerBufferTarget { seconds: f64 },
}

/// Buffer monitor with an adaptive buffer target
pub struct BufferMonitor {
    config: BufferConfig,
    target: f64,
    preload: PreloadMode,
}

impl BufferMonitor {
    pub fn new(config: BufferConfig) -> Self {
        let target = config.target_buffer_length;
        Self {
            config,
            target,
            preload: PreloadMode::Normal,
        }
    }

    /// Current adaptive buffer target in seconds
    pub fn buffer_target(&self) -> f64 {
        self.target
    }

    pub fn preload_mode(&self) -> PreloadMode {
        self.preload
    }

    /// Recompute the buffer snapshot for this tick
    pub fn compute_buffer_info(
        &self,
        position: f64,
        ranges: &[TimeRange],
        duration: Option<f64>,
    ) -> BufferInfo {
        let merged = merge_ranges(ranges);

        let length: f64 = merged
            .iter()
            .filter(|r| r.end > position)
            .map(|r| r.end - r.start.max(position))
            .sum();

        let start = merged.first().map(|r| r.start).unwrap_or(position);
        let end = merged.last().map(|r| r.end).unwrap_or(position);

        let holes: Vec<BufferHole> = merged
            .windows(2)
            .map(|w| BufferHole { start: w[0].end, end: w[1].start })
            .filter(|h| h.duration() >= HOLE_NOISE_FLOOR_SECS && h.end > position)
            .collect();

        let percentage_of_duration = match duration {
            Some(d) if d > 0.0 => {
                let buffered: f64 = merged.iter().map(TimeRange::duration).sum();
                (buffered / d * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };

        let health = self.classify(length, holes.len());

        BufferInfo {
            length,
            start,
            end,
            holes,
            percentage_of_duration,
            health,
        }
    }

    /// Health classification. Pure: depends only on the arguments and the
    /// configured thresholds, never on call history.
    pub fn classify(&self, length: f64, hole_count: usize) -> BufferHealth {
        if length < self.config.critical_buffer_level {
            BufferHealth::Critical
        } else if length < self.config.min_buffer_level {
            BufferHealth::Low
        } else if hole_count > self.config.max_buffer_holes {
            BufferHealth::Fragmented
        } else if length > self.config.optimal_buffer_level {
            BufferHealth::Excellent
        } else {
            BufferHealth::Good
        }
    }

    /// Decide the remediation step for this tick, if any. Adjusts the
    /// adaptive target and preload mode as a side effect.
    pub fn plan_remediation(
        &mut self,
        info: &BufferInfo,
        position: f64,
    ) -> Option<RemediationAction> {
        match info.health {
            BufferHealth::Critical => {
                self.preload = PreloadMode::Aggressive;
                debug!(length = info.length, "Buffer critical, forcing lowest quality");
                Some(RemediationAction::ForceLowestQuality {
                    pause: self.config.pause_on_critical,
                })
            }
            BufferHealth::Low => {
                self.target = (self.target * 1.5).min(self.config.max_buffer_length);
                Some(RemediationAction::RaiseBufferTarget { seconds: self.target })
            }
            BufferHealth::Fragmented => info
                .holes
                .iter()
                .find(|h| h.end > position)
                .map(|h| RemediationAction::SeekToContiguous { position: h.end }),
            BufferHealth::Excellent => {
                self.preload = PreloadMode::Normal;
                self.target = (self.target * 0.8).max(self.config.min_buffer_length);
                Some(RemediationAction::LowerBufferTarget { seconds: self.target })
            }
            BufferHealth::Good => {
                self.preload = PreloadMode::Normal;
                None
            }
        }
    }
}

/// Sort and coalesce downloaded ranges; sub-noise gaps are treated as
/// contiguous
fn merge_ranges(ranges: &[TimeRange]) -> Vec<TimeRange> {
    let mut sorted: Vec<TimeRange> = ranges
        .iter()
        .filter(|r| r.duration() > 0.0)
        .copied()
        .collect();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged: Vec<TimeRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start - last.end < HOLE_NOISE_FLOOR_SECS => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Playback stall event
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StallEvent {
    Started { position: f64 },
    Resolved { duration_ms: u64 },
}

/// Detects playback-stopped-while-not-paused transitions.
///
/// Independent of the buffer monitor; the session feeds it the playhead on
/// every tick.
#[derive(Debug, Default)]
pub struct StallDetector {
    stalled_since: Option<Instant>,
    last_position: Option<f64>,
    stall_count: u32,
}

impl StallDetector {
    const EPSILON: f64 = 1e-3;

    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one tick of playback state
    pub fn update(&mut self, position: f64, paused: bool, now: Instant) -> Option<StallEvent> {
        let moved = self
            .last_position
            .is_none_or(|p| (position - p).abs() > Self::EPSILON);
        self.last_position = Some(position);

        if paused || moved {
            if let Some(since) = self.stalled_since.take() {
                return Some(StallEvent::Resolved {
                    duration_ms: now.duration_since(since).as_millis() as u64,
                });
            }
            return None;
        }

        if self.stalled_since.is_none() {
            self.stalled_since = Some(now);
            self.stall_count += 1;
            return Some(StallEvent::Started { position });
        }
        None
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled_since.is_some()
    }

    pub fn stall_count(&self) -> u32 {
        self.stall_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor() -> BufferMonitor {
        BufferMonitor::new(BufferConfig::default())
    }

    #[test]
    fn test_classification_table() {
        let m = monitor();
        // critical < 2.0, low < 10.0, fragmented > 2 holes, excellent > 30.0
        assert_eq!(m.classify(1.0, 0), BufferHealth::Critical);
        assert_eq!(m.classify(5.0, 0), BufferHealth::Low);
        assert_eq!(m.classify(15.0, 3), BufferHealth::Fragmented);
        assert_eq!(m.classify(15.0, 2), BufferHealth::Good);
        assert_eq!(m.classify(35.0, 0), BufferHealth::Excellent);
    }

    #[test]
    fn test_classification_is_pure() {
        let mut m = monitor();
        let before = m.classify(5.0, 1);
        // Mutate internal state through remediation, then re-ask
        let info = m.compute_buffer_info(0.0, &[TimeRange::new(0.0, 5.0)], None);
        let _ = m.plan_remediation(&info, 0.0);
        assert_eq!(m.classify(5.0, 1), before);
    }

    #[test]
    fn test_buffer_length_ahead_of_playhead() {
        let m = monitor();
        let ranges = [TimeRange::new(0.0, 20.0)];
        let info = m.compute_buffer_info(8.0, &ranges, Some(100.0));
        assert!((info.length - 12.0).abs() < 1e-9);
        assert!((info.percentage_of_duration - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_holes_ignore_noise() {
        let m = monitor();
        let ranges = [
            TimeRange::new(0.0, 10.0),
            TimeRange::new(10.05, 20.0), // 50 ms gap: noise
            TimeRange::new(25.0, 30.0),  // 5 s gap: a real hole
        ];
        let info = m.compute_buffer_info(0.0, &ranges, None);
        assert_eq!(info.holes.len(), 1);
        assert!((info.holes[0].start - 20.0).abs() < 1e-9);
        assert!((info.holes[0].end - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_holes_behind_playhead_excluded() {
        let m = monitor();
        let ranges = [
            TimeRange::new(0.0, 5.0),
            TimeRange::new(10.0, 15.0),
            TimeRange::new(20.0, 25.0),
        ];
        let info = m.compute_buffer_info(16.0, &ranges, None);
        assert_eq!(info.holes.len(), 1);
        assert!((info.holes[0].end - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_critical_remediation() {
        let config = BufferConfig { pause_on_critical: true, ..BufferConfig::default() };
        let mut m = BufferMonitor::new(config);
        let info = m.compute_buffer_info(0.0, &[TimeRange::new(0.0, 1.0)], None);
        assert_eq!(info.health, BufferHealth::Critical);

        let action = m.plan_remediation(&info, 0.0);
        assert_eq!(action, Some(RemediationAction::ForceLowestQuality { pause: true }));
        assert_eq!(m.preload_mode(), PreloadMode::Aggressive);
    }

    #[test]
    fn test_low_buffer_raises_target_up_to_cap() {
        let mut m = monitor();
        let info = m.compute_buffer_info(0.0, &[TimeRange::new(0.0, 5.0)], None);
        assert_eq!(info.health, BufferHealth::Low);

        // 20 -> 30 -> 45 -> 60, capped at max_buffer_length
        for expected in [30.0, 45.0, 60.0, 60.0] {
            let action = m.plan_remediation(&info, 0.0);
            assert_eq!(action, Some(RemediationAction::RaiseBufferTarget { seconds: expected }));
        }
    }

    #[test]
    fn test_excellent_lowers_target_down_to_floor() {
        let mut m = monitor();
        let info = m.compute_buffer_info(0.0, &[TimeRange::new(0.0, 40.0)], None);
        assert_eq!(info.health, BufferHealth::Excellent);

        let action = m.plan_remediation(&info, 0.0);
        assert_eq!(action, Some(RemediationAction::LowerBufferTarget { seconds: 16.0 }));

        for _ in 0..20 {
            m.plan_remediation(&info, 0.0);
        }
        assert!((m.buffer_target() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_fragmented_seeks_past_first_hole() {
        let config = BufferConfig { max_buffer_holes: 0, ..BufferConfig::default() };
        let mut m = BufferMonitor::new(config);
        let ranges = [TimeRange::new(0.0, 12.0), TimeRange::new(14.0, 26.0)];
        let info = m.compute_buffer_info(1.0, &ranges, None);
        assert_eq!(info.health, BufferHealth::Fragmented);

        let action = m.plan_remediation(&info, 1.0);
        assert_eq!(action, Some(RemediationAction::SeekToContiguous { position: 14.0 }));
    }

    #[test]
    fn test_stall_lifecycle() {
        let mut d = StallDetector::new();
        let t0 = Instant::now();

        // Playing and advancing: no stall
        assert_eq!(d.update(1.0, false, t0), None);
        assert_eq!(d.update(2.0, false, t0 + Duration::from_secs(1)), None);

        // Position freezes while playing
        let started = d.update(2.0, false, t0 + Duration::from_secs(2));
        assert_eq!(started, Some(StallEvent::Started { position: 2.0 }));
        assert!(d.is_stalled());

        // Still frozen: no duplicate event
        assert_eq!(d.update(2.0, false, t0 + Duration::from_secs(3)), None);

        // Position moves again: resolved with measured duration
        let resolved = d.update(2.5, false, t0 + Duration::from_secs(5));
        assert_eq!(resolved, Some(StallEvent::Resolved { duration_ms: 3000 }));
        assert!(!d.is_stalled());
        assert_eq!(d.stall_count(), 1);
    }

    #[test]
    fn test_user_pause_is_not_a_stall() {
        let mut d = StallDetector::new();
        let t0 = Instant::now();

        assert_eq!(d.update(1.0, false, t0), None);
        assert_eq!(d.update(1.0, true, t0 + Duration::from_secs(1)), None);
        assert_eq!(d.update(1.0, true, t0 + Duration::from_secs(2)), None);
        assert_eq!(d.stall_count(), 0);
    }
}
