//! Last-resort recovery chain
//!
//! Strategies form a closed, ordered set walked from a cursor. Each carries
//! its own bounded memory so a single pass cannot loop; success resets the
//! cursor and every strategy's memory, exhaustion surfaces a fatal error and
//! the next error starts a fresh pass.

use crate::error::{Error, Result};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// What the session should do to recover
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Drop to a specific (lower) quality level
    SwitchLevel(usize),
    /// Ask the protocol layer for an alternate transport
    SwitchProtocol,
    /// Fail over to another delivery origin
    SwitchOrigin,
    /// Play on from the segment cache only
    ServeFromCache,
    /// Lowest level, minimal buffering, last resort
    MinimalStream,
}

/// Facts the strategies consult when deciding whether they can act
#[derive(Debug, Clone, Copy)]
pub struct FallbackContext {
    pub current_level: usize,
    pub level_count: usize,
    /// The segment cache holds at least one entry
    pub cache_ready: bool,
    /// Healthy origins besides the current one
    pub alternate_origins: usize,
}

/// The closed strategy set, in chain order
#[derive(Debug)]
enum FallbackStrategy {
    /// Step down through untried quality levels
    QualityReduction { tried: HashSet<usize> },
    /// One-shot transport switch
    ProtocolSwitch { attempted: bool },
    /// Move to another origin
    OriginFailover,
    /// Cache-only degraded playback
    DegradedPlayback,
    /// Absolute floor: lowest level, minimal buffer
    MinimalStream { attempted: bool },
}

impl FallbackStrategy {
    fn name(&self) -> &'static str {
        match self {
            FallbackStrategy::QualityReduction { .. } => "quality-reduction",
            FallbackStrategy::ProtocolSwitch { .. } => "protocol-switch",
            FallbackStrategy::OriginFailover => "origin-failover",
            FallbackStrategy::DegradedPlayback => "degraded-playback",
            FallbackStrategy::MinimalStream { .. } => "minimal-stream",
        }
    }

    fn can_handle(&self, error: &Error) -> bool {
        match self {
            FallbackStrategy::QualityReduction { .. } => {
                error.is_transient() || matches!(error, Error::BufferStall { .. })
            }
            FallbackStrategy::ProtocolSwitch { .. } => {
                matches!(error, Error::Network { .. } | Error::Timeout)
            }
            FallbackStrategy::OriginFailover => matches!(
                error,
                Error::Network { .. } | Error::Timeout | Error::CircuitOpen
            ),
            FallbackStrategy::DegradedPlayback => matches!(
                error,
                Error::Network { .. }
                    | Error::Timeout
                    | Error::CircuitOpen
                    | Error::NoEndpointAvailable
            ),
            // The floor handles anything recovery can still be attempted for
            FallbackStrategy::MinimalStream { .. } => !matches!(error, Error::Cancelled),
        }
    }

    fn execute(&mut self, ctx: &FallbackContext) -> Result<RecoveryAction> {
        match self {
            FallbackStrategy::QualityReduction { tried } => {
                if ctx.level_count == 0 {
                    return Err(Error::Internal("no levels to reduce to".into()));
                }
                // Highest untried level strictly below the current one
                let next = (0..ctx.current_level).rev().find(|i| !tried.contains(i));
                match next {
                    Some(level) => {
                        tried.insert(level);
                        Ok(RecoveryAction::SwitchLevel(level))
                    }
                    None => Err(Error::Internal("all lower levels tried".into())),
                }
            }
            FallbackStrategy::ProtocolSwitch { attempted } => {
                if *attempted {
                    return Err(Error::Internal("protocol already switched".into()));
                }
                *attempted = true;
                Ok(RecoveryAction::SwitchProtocol)
            }
            FallbackStrategy::OriginFailover => {
                if ctx.alternate_origins == 0 {
                    return Err(Error::NoEndpointAvailable);
                }
                Ok(RecoveryAction::SwitchOrigin)
            }
            FallbackStrategy::DegradedPlayback => {
                if !ctx.cache_ready {
                    return Err(Error::Internal("cache empty, cannot degrade".into()));
                }
                Ok(RecoveryAction::ServeFromCache)
            }
            FallbackStrategy::MinimalStream { attempted } => {
                if *attempted {
                    return Err(Error::Internal("minimal stream already active".into()));
                }
                *attempted = true;
                Ok(RecoveryAction::MinimalStream)
            }
        }
    }

    fn reset_memory(&mut self) {
        match self {
            FallbackStrategy::QualityReduction { tried } => tried.clear(),
            FallbackStrategy::ProtocolSwitch { attempted } => *attempted = false,
            FallbackStrategy::MinimalStream { attempted } => *attempted = false,
            FallbackStrategy::OriginFailover | FallbackStrategy::DegradedPlayback => {}
        }
    }
}

/// Ordered recovery chain with a pass cursor
pub struct FallbackOrchestrator {
    strategies: Vec<FallbackStrategy>,
    cursor: usize,
    pass_active: bool,
}

impl FallbackOrchestrator {
    pub fn new() -> Self {
        Self {
            strategies: vec![
                FallbackStrategy::QualityReduction { tried: HashSet::new() },
                FallbackStrategy::ProtocolSwitch { attempted: false },
                FallbackStrategy::OriginFailover,
                FallbackStrategy::DegradedPlayback,
                FallbackStrategy::MinimalStream { attempted: false },
            ],
            cursor: 0,
            pass_active: false,
        }
    }

    /// A recovery pass is in progress (an action was handed out but success
    /// has not been reported yet)
    pub fn pass_active(&self) -> bool {
        self.pass_active
    }

    /// Walk the chain from the cursor and produce the next recovery action.
    /// Exhaustion ends the pass and surfaces `FatalPlayback`.
    pub fn recover(&mut self, error: &Error, ctx: &FallbackContext) -> Result<RecoveryAction> {
        self.pass_active = true;

        while self.cursor < self.strategies.len() {
            let strategy = &mut self.strategies[self.cursor];
            if !strategy.can_handle(error) {
                debug!(strategy = strategy.name(), "Strategy cannot handle error, skipping");
                self.cursor += 1;
                continue;
            }
            match strategy.execute(ctx) {
                Ok(action) => {
                    info!(strategy = strategy.name(), ?action, "Recovery action produced");
                    return Ok(action);
                }
                Err(err) => {
                    debug!(strategy = strategy.name(), error = %err, "Strategy failed, advancing");
                    self.cursor += 1;
                }
            }
        }

        warn!("Recovery chain exhausted");
        self.reset();
        Err(Error::FatalPlayback("recovery chain exhausted".to_string()))
    }

    /// Playback recovered: destroy the pass state
    pub fn mark_recovered(&mut self) {
        if self.pass_active {
            info!("Recovery succeeded, resetting chain");
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.pass_active = false;
        for strategy in &mut self.strategies {
            strategy.reset_memory();
        }
    }
}

impl Default for FallbackOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FallbackContext {
        FallbackContext {
            current_level: 2,
            level_count: 3,
            cache_ready: true,
            alternate_origins: 1,
        }
    }

    fn transient_error() -> Error {
        Error::from_status(503)
    }

    #[test]
    fn test_quality_reduction_steps_down_without_repeats() {
        let mut orch = FallbackOrchestrator::new();

        let first = orch.recover(&transient_error(), &ctx()).unwrap();
        assert_eq!(first, RecoveryAction::SwitchLevel(1));

        let second = orch.recover(&transient_error(), &ctx()).unwrap();
        assert_eq!(second, RecoveryAction::SwitchLevel(0));

        // All lower levels tried: the chain moves on to the protocol switch
        let third = orch.recover(&transient_error(), &ctx()).unwrap();
        assert_eq!(third, RecoveryAction::SwitchProtocol);
    }

    #[test]
    fn test_chain_walks_in_order() {
        let mut orch = FallbackOrchestrator::new();
        let context = FallbackContext { current_level: 0, ..ctx() };

        // Level already at 0: quality reduction has nothing to offer
        assert_eq!(
            orch.recover(&transient_error(), &context).unwrap(),
            RecoveryAction::SwitchProtocol
        );
        assert_eq!(
            orch.recover(&transient_error(), &context).unwrap(),
            RecoveryAction::SwitchOrigin
        );
    }

    #[test]
    fn test_exhaustion_surfaces_fatal_error() {
        let mut orch = FallbackOrchestrator::new();
        let context = FallbackContext {
            current_level: 0,
            level_count: 1,
            cache_ready: false,
            alternate_origins: 0,
        };

        let err = transient_error();
        assert_eq!(orch.recover(&err, &context).unwrap(), RecoveryAction::SwitchProtocol);
        assert_eq!(orch.recover(&err, &context).unwrap(), RecoveryAction::MinimalStream);

        match orch.recover(&err, &context) {
            Err(Error::FatalPlayback(_)) => {}
            other => panic!("expected fatal error, got {other:?}"),
        }
        // Exhaustion ended the pass; a new error starts a fresh one
        assert!(!orch.pass_active());
        assert_eq!(orch.recover(&err, &context).unwrap(), RecoveryAction::SwitchProtocol);
    }

    #[test]
    fn test_success_resets_cursor_and_memory() {
        let mut orch = FallbackOrchestrator::new();

        assert_eq!(
            orch.recover(&transient_error(), &ctx()).unwrap(),
            RecoveryAction::SwitchLevel(1)
        );
        assert!(orch.pass_active());

        orch.mark_recovered();
        assert!(!orch.pass_active());

        // The tried-set was cleared: level 1 is offered again
        assert_eq!(
            orch.recover(&transient_error(), &ctx()).unwrap(),
            RecoveryAction::SwitchLevel(1)
        );
    }

    #[test]
    fn test_circuit_open_skips_to_origin_failover() {
        let mut orch = FallbackOrchestrator::new();
        // CircuitOpen is not transient and not a protocol matter; the first
        // strategy that claims it is origin failover
        let action = orch.recover(&Error::CircuitOpen, &ctx()).unwrap();
        assert_eq!(action, RecoveryAction::SwitchOrigin);
    }

    #[test]
    fn test_no_endpoint_error_reaches_degraded_playback() {
        let mut orch = FallbackOrchestrator::new();
        let action = orch.recover(&Error::NoEndpointAvailable, &ctx()).unwrap();
        assert_eq!(action, RecoveryAction::ServeFromCache);
    }

    #[test]
    fn test_cancelled_is_never_recovered() {
        let mut orch = FallbackOrchestrator::new();
        match orch.recover(&Error::Cancelled, &ctx()) {
            Err(Error::FatalPlayback(_)) => {}
            other => panic!("expected fatal, got {other:?}"),
        }
    }
}
