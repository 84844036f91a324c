//! State shared by the realtime relay, the event loop and the engine's
//! notification thread.
//!
//! Two locks guard it. `rt` holds the ring halves the realtime thread uses
//! and is only ever `try_lock`ed there. `io` holds the opposite halves plus
//! the endpoints and the current layout. Anything that needs both takes
//! `io` first, then `rt`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::endpoint::{EndpointKind, EndpointStatus, StreamEndpoint};
use crate::format::FrameLayout;
use crate::ring::{RingChannel, RingError, RingReader, RingWriter};
use crate::stats::RelayStats;

/// Coordinator phase, visible to every thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Stable = 0,
    Reconfiguring = 1,
    Shutdown = 2,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Phase::Stable,
            1 => Phase::Reconfiguring,
            _ => Phase::Shutdown,
        }
    }
}

/// Ring halves owned by the realtime side.
#[derive(Default)]
pub struct RtRings {
    pub playback: Option<RingWriter>,
    pub capture: Option<RingReader>,
    pub monitor: Option<RingReader>,
}

/// Ring halves owned by the event-loop side.
#[derive(Default)]
pub struct IoRings {
    pub playback: Option<RingReader>,
    pub capture: Option<RingWriter>,
    pub monitor: Option<RingWriter>,
}

impl IoRings {
    /// Writer feeding the graph for `kind`. None for playback.
    pub fn inbound(&mut self, kind: EndpointKind) -> Option<&mut RingWriter> {
        match kind {
            EndpointKind::Playback => None,
            EndpointKind::Capture => self.capture.as_mut(),
            EndpointKind::Monitor => self.monitor.as_mut(),
        }
    }
}

/// Allocate a fresh ring per endpoint and split them between the two sides.
pub fn allocate_rings(layout: &FrameLayout) -> Result<(RtRings, IoRings), RingError> {
    let (playback_writer, playback_reader) = RingChannel::for_layout(layout)?.split();
    let (capture_writer, capture_reader) = RingChannel::for_layout(layout)?.split();
    let (monitor_writer, monitor_reader) = RingChannel::for_layout(layout)?.split();

    Ok((
        RtRings {
            playback: Some(playback_writer),
            capture: Some(capture_reader),
            monitor: Some(monitor_reader),
        },
        IoRings {
            playback: Some(playback_reader),
            capture: Some(capture_writer),
            monitor: Some(monitor_writer),
        },
    ))
}

/// The three endpoints, one per ring.
#[derive(Debug)]
pub struct Endpoints {
    playback: StreamEndpoint,
    capture: StreamEndpoint,
    monitor: StreamEndpoint,
}

impl Endpoints {
    pub fn new(
        playback: StreamEndpoint,
        capture: StreamEndpoint,
        monitor: StreamEndpoint,
    ) -> Self {
        Self {
            playback,
            capture,
            monitor,
        }
    }

    pub fn get(&self, kind: EndpointKind) -> &StreamEndpoint {
        match kind {
            EndpointKind::Playback => &self.playback,
            EndpointKind::Capture => &self.capture,
            EndpointKind::Monitor => &self.monitor,
        }
    }

    pub fn get_mut(&mut self, kind: EndpointKind) -> &mut StreamEndpoint {
        match kind {
            EndpointKind::Playback => &mut self.playback,
            EndpointKind::Capture => &mut self.capture,
            EndpointKind::Monitor => &mut self.monitor,
        }
    }
}

/// Everything behind the io lock.
pub struct IoState {
    pub rings: IoRings,
    pub endpoints: Endpoints,
    pub layout: FrameLayout,
}

pub struct RelayShared {
    rt: Mutex<RtRings>,
    io: Mutex<IoState>,
    phase: AtomicU8,
    statuses: [Arc<EndpointStatus>; 3],
    stats: Arc<RelayStats>,
    channels: u16,
}

impl RelayShared {
    pub fn new(rt: RtRings, io: IoState, stats: Arc<RelayStats>) -> Self {
        let statuses = EndpointKind::ALL.map(|kind| Arc::clone(io.endpoints.get(kind).status()));
        let channels = io.layout.channels;
        Self {
            rt: Mutex::new(rt),
            io: Mutex::new(io),
            phase: AtomicU8::new(Phase::Stable as u8),
            statuses,
            stats,
            channels,
        }
    }

    /// Channel count never changes after start, unlike the period size.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn status(&self, kind: EndpointKind) -> &EndpointStatus {
        &self.statuses[kind.index()]
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Shutdown is terminal; later calls cannot leave it.
    pub fn set_phase(&self, phase: Phase) {
        let _ = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == Phase::Shutdown as u8 {
                    None
                } else {
                    Some(phase as u8)
                }
            });
    }

    /// Blocking io lock. Never call from the realtime thread.
    pub fn lock_io(&self) -> MutexGuard<'_, IoState> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocking rt lock. Only while already holding the io lock.
    pub fn lock_rt(&self) -> MutexGuard<'_, RtRings> {
        self.rt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Realtime access. None while a reconfiguration holds the rings.
    pub fn try_lock_rt(&self) -> Option<MutexGuard<'_, RtRings>> {
        match self.rt.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::endpoint::EndpointState;

    pub fn endpoint(kind: EndpointKind, layout: &FrameLayout) -> StreamEndpoint {
        StreamEndpoint::new(
            kind,
            kind.to_string(),
            None,
            layout.buffer_attr(),
            Arc::new(EndpointStatus::new()),
        )
    }

    pub fn shared(layout: FrameLayout) -> Arc<RelayShared> {
        let (rt, rings) = allocate_rings(&layout).unwrap();
        let endpoints = Endpoints::new(
            endpoint(EndpointKind::Playback, &layout),
            endpoint(EndpointKind::Capture, &layout),
            endpoint(EndpointKind::Monitor, &layout),
        );
        let io = IoState {
            rings,
            endpoints,
            layout,
        };
        Arc::new(RelayShared::new(rt, io, Arc::new(RelayStats::default())))
    }

    /// Walk an endpoint to Ready without a server.
    pub fn make_streaming(shared: &RelayShared, kind: EndpointKind) {
        let mut io = shared.lock_io();
        let ep = io.endpoints.get_mut(kind);
        ep.transition(EndpointState::Connecting);
        ep.transition(EndpointState::Ready);
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn layout() -> FrameLayout {
        FrameLayout::new(2, 48000, 256, 3).unwrap()
    }

    #[test]
    fn test_allocate_sizes_every_ring() {
        let (rt, mut io) = allocate_rings(&layout()).unwrap();
        assert_eq!(rt.playback.as_ref().map(|w| w.capacity()), Some(6144));
        assert_eq!(rt.capture.as_ref().map(|r| r.capacity()), Some(6144));
        assert_eq!(rt.monitor.as_ref().map(|r| r.capacity()), Some(6144));
        assert!(io.inbound(EndpointKind::Playback).is_none());
        assert!(io.inbound(EndpointKind::Monitor).is_some());
    }

    #[test]
    fn test_shutdown_phase_sticks() {
        let shared = shared(layout());
        assert_eq!(shared.phase(), Phase::Stable);
        shared.set_phase(Phase::Reconfiguring);
        assert_eq!(shared.phase(), Phase::Reconfiguring);
        shared.set_phase(Phase::Shutdown);
        shared.set_phase(Phase::Stable);
        assert_eq!(shared.phase(), Phase::Shutdown);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let shared = shared(layout());
        let _io = shared.lock_io();
        let held = shared.lock_rt();
        assert!(shared.try_lock_rt().is_none());
        drop(held);
        assert!(shared.try_lock_rt().is_some());
    }

    #[test]
    fn test_status_mirrors_endpoint() {
        let shared = shared(layout());
        assert!(!shared.status(EndpointKind::Capture).is_streaming());
        make_streaming(&shared, EndpointKind::Capture);
        assert!(shared.status(EndpointKind::Capture).is_streaming());
        assert!(!shared.status(EndpointKind::Monitor).is_streaming());
    }
}
