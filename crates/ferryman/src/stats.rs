//! Relay counters and the realtime diagnostic queue.
//!
//! The realtime thread cannot log, so xruns it sees are pushed as
//! [`Diagnostic`] values onto a preallocated SPSC queue and logged by the
//! event loop. Counters are plain atomics, readable from anywhere.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};
use serde::Serialize;
use tracing::warn;

use crate::endpoint::EndpointKind;

/// Diagnostics buffered between event-loop drains.
pub const DIAGNOSTIC_QUEUE_CAPACITY: usize = 64;

/// Counters for one endpoint.
#[derive(Debug, Default)]
pub struct EndpointCounters {
    pub frames: AtomicU64,
    pub overflows: AtomicU64,
    pub underflows: AtomicU64,
    pub holes: AtomicU64,
}

impl EndpointCounters {
    fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            underflows: self.underflows.load(Ordering::Relaxed),
            holes: self.holes.load(Ordering::Relaxed),
        }
    }
}

/// Runtime statistics, updated from both sides of the relay.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Realtime callbacks seen.
    pub periods: AtomicU64,
    /// Periods silenced because the rings were being replaced.
    pub skipped_periods: AtomicU64,
    pub reconfigurations: AtomicU64,
    /// Diagnostics lost to a full queue.
    pub dropped_diagnostics: AtomicU64,
    pub playback: EndpointCounters,
    pub capture: EndpointCounters,
    pub monitor: EndpointCounters,
}

impl RelayStats {
    pub fn endpoint(&self, kind: EndpointKind) -> &EndpointCounters {
        match kind {
            EndpointKind::Playback => &self.playback,
            EndpointKind::Capture => &self.capture,
            EndpointKind::Monitor => &self.monitor,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            periods: self.periods.load(Ordering::Relaxed),
            skipped_periods: self.skipped_periods.load(Ordering::Relaxed),
            reconfigurations: self.reconfigurations.load(Ordering::Relaxed),
            dropped_diagnostics: self.dropped_diagnostics.load(Ordering::Relaxed),
            playback: self.playback.snapshot(),
            capture: self.capture.snapshot(),
            monitor: self.monitor.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EndpointSnapshot {
    pub frames: u64,
    pub overflows: u64,
    pub underflows: u64,
    pub holes: u64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub periods: u64,
    pub skipped_periods: u64,
    pub reconfigurations: u64,
    pub dropped_diagnostics: u64,
    pub playback: EndpointSnapshot,
    pub capture: EndpointSnapshot,
    pub monitor: EndpointSnapshot,
}

impl StatsSnapshot {
    pub fn endpoint(&self, kind: EndpointKind) -> &EndpointSnapshot {
        match kind {
            EndpointKind::Playback => &self.playback,
            EndpointKind::Capture => &self.capture,
            EndpointKind::Monitor => &self.monitor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrunKind {
    /// Writer had more than the ring could take.
    Overflow,
    /// Reader needed more than the ring held.
    Underflow,
}

/// One xrun seen on the realtime thread. Sizes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: XrunKind,
    pub endpoint: EndpointKind,
    pub have: usize,
    pub need: usize,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            XrunKind::Overflow => "overflow",
            XrunKind::Underflow => "underflow",
        };
        write!(
            f,
            "{} ring {}: {} < {}",
            self.endpoint, what, self.have, self.need
        )
    }
}

/// Realtime end of the diagnostic queue.
pub struct DiagnosticSender {
    producer: Producer<Diagnostic>,
    stats: Arc<RelayStats>,
}

impl DiagnosticSender {
    /// Queue a diagnostic. Never blocks; a full queue counts a drop.
    pub fn report(&mut self, diagnostic: Diagnostic) {
        if self.producer.push(diagnostic).is_err() {
            self.stats.dropped_diagnostics.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Event-loop end of the diagnostic queue.
pub struct DiagnosticReceiver {
    consumer: Consumer<Diagnostic>,
}

impl DiagnosticReceiver {
    /// Pop everything queued so far.
    pub fn drain(&mut self, mut f: impl FnMut(Diagnostic)) -> usize {
        let mut count = 0;
        while let Ok(diagnostic) = self.consumer.pop() {
            f(diagnostic);
            count += 1;
        }
        count
    }

    /// Log everything queued so far at warn level.
    pub fn log_pending(&mut self) -> usize {
        self.drain(|diagnostic| warn!("{}", diagnostic))
    }
}

pub fn diagnostic_queue(
    capacity: usize,
    stats: Arc<RelayStats>,
) -> (DiagnosticSender, DiagnosticReceiver) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (
        DiagnosticSender { producer, stats },
        DiagnosticReceiver { consumer },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn underflow(have: usize) -> Diagnostic {
        Diagnostic {
            kind: XrunKind::Underflow,
            endpoint: EndpointKind::Capture,
            have,
            need: 2048,
        }
    }

    #[test]
    fn test_queue_preserves_order() {
        let stats = Arc::new(RelayStats::default());
        let (mut tx, mut rx) = diagnostic_queue(8, Arc::clone(&stats));
        tx.report(underflow(0));
        tx.report(underflow(8));

        let mut seen = Vec::new();
        assert_eq!(rx.drain(|d| seen.push(d.have)), 2);
        assert_eq!(seen, vec![0, 8]);
        assert_eq!(rx.drain(|_| {}), 0);
    }

    #[test]
    fn test_full_queue_counts_drops() {
        let stats = Arc::new(RelayStats::default());
        let (mut tx, mut rx) = diagnostic_queue(2, Arc::clone(&stats));
        for i in 0..5 {
            tx.report(underflow(i));
        }
        assert_eq!(rx.log_pending(), 2);
        assert_eq!(stats.snapshot().dropped_diagnostics, 3);
    }

    #[test]
    fn test_display() {
        let d = Diagnostic {
            kind: XrunKind::Overflow,
            endpoint: EndpointKind::Playback,
            have: 1024,
            need: 2048,
        };
        assert_eq!(d.to_string(), "playback ring overflow: 1024 < 2048");
    }

    #[test]
    fn test_snapshot_per_endpoint() {
        let stats = RelayStats::default();
        stats.capture.underflows.fetch_add(3, Ordering::Relaxed);
        stats.monitor.holes.fetch_add(1, Ordering::Relaxed);
        stats.periods.fetch_add(10, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.periods, 10);
        assert_eq!(snap.endpoint(EndpointKind::Capture).underflows, 3);
        assert_eq!(snap.endpoint(EndpointKind::Monitor).holes, 1);
        assert_eq!(snap.endpoint(EndpointKind::Playback), &EndpointSnapshot::default());
    }

    #[test]
    fn test_snapshot_serializes() {
        let snap = RelayStats::default().snapshot();
        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["playback"]["overflows"], 0);
        assert_eq!(json["skipped_periods"], 0);
    }
}
