//! Adaptive bitrate level selection
//!
//! `select_level` runs four ordered stages: bandwidth filtering, buffer-state
//! narrowing, the stability/gradual-change rule, and the policy/device clamp.
//! The ordering is load-bearing — each stage narrows or adjusts what the
//! previous one produced.

use crate::config::AbrConfig;
use crate::types::{DeviceConstraints, QualityLevel};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Why a decision landed where it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    /// First selection of the session
    Initial,
    UpSwitch,
    DownSwitch,
    /// Buffer below the panic level; collapsed to index 0
    PanicBuffer,
    /// No level fit the bandwidth budget; forced to index 0
    NoCandidates,
    /// Held the current level inside the switch-dwell window
    MinInterval,
    AlreadyOptimal,
    /// Externally forced (recovery or user override)
    Manual,
}

/// Outcome of one selection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbrDecision {
    pub index: usize,
    pub reason: SwitchReason,
    pub changed: bool,
}

/// Inputs gathered fresh for each selection cycle
#[derive(Debug, Clone, Default)]
pub struct AbrContext {
    /// Conservative bandwidth estimate in bps
    pub bandwidth_estimate: u64,
    /// Buffered seconds ahead of the playhead
    pub buffer_level: f64,
    /// Device limits, if known
    pub device: Option<DeviceConstraints>,
}

/// Quality level selector
pub struct AbrDecisionEngine {
    config: AbrConfig,
    levels: Vec<QualityLevel>,
    current: usize,
    last_switch: Option<Instant>,
    initialized: bool,
}

impl AbrDecisionEngine {
    pub fn new(config: AbrConfig, levels: Vec<QualityLevel>) -> Self {
        let mut engine = Self {
            config,
            levels: Vec::new(),
            current: 0,
            last_switch: None,
            initialized: false,
        };
        engine.set_levels(levels);
        engine
    }

    /// Replace the quality ladder wholesale (manifest change)
    pub fn set_levels(&mut self, mut levels: Vec<QualityLevel>) {
        levels.sort_by_key(|l| l.bitrate);
        self.current = if levels.is_empty() {
            0
        } else {
            self.current.min(levels.len() - 1)
        };
        self.levels = levels;
    }

    pub fn levels(&self) -> &[QualityLevel] {
        &self.levels
    }

    pub fn current_level(&self) -> usize {
        self.current
    }

    pub fn current_bitrate(&self) -> u64 {
        self.levels.get(self.current).map(|l| l.bitrate).unwrap_or(0)
    }

    /// Pick the level for the next segment. Never fails; with empty or
    /// inconsistent inputs the answer is index 0.
    pub fn select_level(&mut self, ctx: &AbrContext, now: Instant) -> AbrDecision {
        if self.levels.is_empty() {
            return AbrDecision {
                index: 0,
                reason: SwitchReason::NoCandidates,
                changed: false,
            };
        }

        let current = self.current.min(self.levels.len() - 1);

        // Stage 1: bandwidth filter
        let budget = ctx.bandwidth_estimate as f64 * self.config.bandwidth_safety_factor;
        let mut candidates = bandwidth_candidates(&self.levels, budget);

        // Stage 2: buffer-state narrowing
        let mut forced = false;
        if ctx.buffer_level < self.config.panic_buffer_level {
            candidates = vec![0];
            forced = true;
        } else if ctx.buffer_level < self.config.min_buffer_level {
            let ceiling = self.levels[current].bitrate as f64 * 0.7;
            candidates.retain(|&i| self.levels[i].bitrate as f64 <= ceiling);
        }
        // Above max_buffer_level and in the normal band the set stays as
        // filtered; the hold rule below is what privileges the current level.

        // Stage 3: stability and gradual change
        let in_dwell = self
            .last_switch
            .is_some_and(|t| now.duration_since(t) < self.config.min_time_between_switches);
        let holds = !forced && in_dwell && candidates.contains(&current);

        let (mut index, mut reason) = if holds {
            (current, SwitchReason::MinInterval)
        } else if candidates.is_empty() {
            (0, SwitchReason::NoCandidates)
        } else {
            // Levels are sorted by bitrate, so the last candidate is the
            // highest quality that survived the filters.
            let desired = *candidates.last().unwrap_or(&0);
            if forced {
                (desired, SwitchReason::PanicBuffer)
            } else {
                let stepped = step_toward(current, desired, self.config.max_level_jump);
                let reason = match stepped.cmp(&current) {
                    std::cmp::Ordering::Greater => SwitchReason::UpSwitch,
                    std::cmp::Ordering::Less => SwitchReason::DownSwitch,
                    std::cmp::Ordering::Equal => SwitchReason::AlreadyOptimal,
                };
                (stepped, reason)
            }
        };

        // Stage 4: policy clamp, then device clamp
        let top = self.levels.len() - 1;
        if let Some(min_q) = self.config.min_quality {
            index = index.max(min_q.min(top));
        }
        if let Some(max_q) = self.config.max_quality {
            index = index.min(max_q.min(top));
        }
        if let Some(device) = ctx.device {
            let max_height = device.max_height();
            while index > 0 && self.levels[index].height > max_height {
                index -= 1;
            }
        }

        if !self.initialized {
            self.initialized = true;
            reason = SwitchReason::Initial;
        }

        let changed = index != current;
        if changed {
            self.last_switch = Some(now);
            self.current = index;
        }

        debug!(
            estimate = ctx.bandwidth_estimate,
            buffer = ctx.buffer_level,
            from = current,
            to = index,
            reason = ?reason,
            "ABR selection"
        );

        AbrDecision { index, reason, changed }
    }

    /// Force a level directly (recovery path). Returns (from, to) when the
    /// level actually moved.
    pub fn force_level(&mut self, index: usize, now: Instant) -> Option<(usize, usize)> {
        if self.levels.is_empty() {
            return None;
        }
        let target = index.min(self.levels.len() - 1);
        if target == self.current {
            return None;
        }
        let from = self.current;
        self.current = target;
        self.last_switch = Some(now);
        self.initialized = true;
        Some((from, target))
    }
}

/// Stage 1: indices whose bitrate fits inside the bandwidth budget
fn bandwidth_candidates(levels: &[QualityLevel], budget_bps: f64) -> Vec<usize> {
    levels
        .iter()
        .enumerate()
        .filter(|(_, l)| l.bitrate as f64 <= budget_bps)
        .map(|(i, _)| i)
        .collect()
}

/// Move at most `max_jump` index steps from `current` toward `desired`
fn step_toward(current: usize, desired: usize, max_jump: usize) -> usize {
    if desired > current {
        current + (desired - current).min(max_jump)
    } else {
        current - (current - desired).min(max_jump)
    }
}
