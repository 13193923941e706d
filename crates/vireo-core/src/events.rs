//! Engine event emission
//!
//! The engine never touches the media element or the network stack of the
//! embedding player directly; everything it wants the outside world to do or
//! know is published here as a typed event. The sink is owned by the session
//! and delivers in emission order — there is no global bus and no implicit
//! listener.

use crate::abr::SwitchReason;
use crate::types::{BufferHealth, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Engine event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Periodic buffer snapshot
    BufferMetrics {
        length: f64,
        health: BufferHealth,
        holes: usize,
        percentage: f64,
    },

    /// Playback stopped while not user-paused
    StallStarted { position: f64 },

    /// Playback resumed after a stall
    StallResolved { duration_ms: u64 },

    /// Quality level switch
    QualityChanged {
        from: usize,
        to: usize,
        reason: SwitchReason,
    },

    /// Buffer remediation: drop to the lowest quality now
    RequestLowestQuality,

    /// Buffer remediation: new buffer target in seconds
    AdjustBufferTarget { seconds: f64 },

    /// Buffer remediation: pause playback until the buffer recovers
    PauseRequested,

    /// Buffer remediation: jump over an unrecoverable hole
    SeekRequested { position: f64 },

    /// Origin selection outcome
    EndpointSelected { id: String, score: f64 },

    /// Origin marked unhealthy
    EndpointFailed { id: String },

    /// Recovery asked the protocol layer to switch transports
    ProtocolSwitchRequested,

    /// Recovery entered cache-only degraded playback
    DegradedModeEntered,

    /// Recovery chain exhausted; playback must stop
    FatalError { code: String, message: String },
}

/// Event with delivery metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Unique event ID
    pub id: Uuid,
    /// Session ID
    pub session_id: SessionId,
    /// Monotonic per-session sequence number
    pub seq: u64,
    /// Timestamp
    pub at: DateTime<Utc>,
    /// The event
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// Session-owned event channel.
///
/// `emit` is synchronous and never blocks the decision loop; ordering is the
/// channel's FIFO order. A dropped receiver turns emission into a no-op.
pub struct TelemetrySink {
    session_id: SessionId,
    seq: AtomicU64,
    tx: mpsc::UnboundedSender<TelemetryRecord>,
}

impl TelemetrySink {
    /// Create a sink and the receiver the embedding layer consumes
    pub fn new(session_id: SessionId) -> (Self, mpsc::UnboundedReceiver<TelemetryRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                session_id,
                seq: AtomicU64::new(0),
                tx,
            },
            rx,
        )
    }

    /// Emit an event
    pub fn emit(&self, event: EngineEvent) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let record = TelemetryRecord {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            seq,
            at: Utc::now(),
            event,
        };
        let _ = self.tx.send(record);
    }

    /// Number of events emitted so far
    pub fn emitted(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (sink, mut rx) = TelemetrySink::new(SessionId::new());

        sink.emit(EngineEvent::RequestLowestQuality);
        sink.emit(EngineEvent::AdjustBufferTarget { seconds: 30.0 });
        sink.emit(EngineEvent::PauseRequested);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();

        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(third.seq, 2);
        assert!(matches!(first.event, EngineEvent::RequestLowestQuality));
        assert!(matches!(third.event, EngineEvent::PauseRequested));
    }

    #[tokio::test]
    async fn test_emit_survives_dropped_receiver() {
        let (sink, rx) = TelemetrySink::new(SessionId::new());
        drop(rx);

        sink.emit(EngineEvent::RequestLowestQuality);
        assert_eq!(sink.emitted(), 1);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = EngineEvent::BufferMetrics {
            length: 12.5,
            health: crate::types::BufferHealth::Good,
            holes: 0,
            percentage: 41.7,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"buffer_metrics\""));
        assert!(json.contains("\"health\":\"good\""));
    }
}
